//! Subscriptions: one consumer task per (topic, consumer group, handler)
//!
//! Each task receives messages, parses the envelope, and awaits the handler.
//! On success the offset is committed. On failure the raw message goes to the
//! dead-letter queue and the offset is committed anyway, so a poison message
//! never blocks its partition.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::BusConfig;
use crate::consumer_retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};
use crate::dlq::DeadLetterSink;
use crate::envelope::{validate_envelope_fields, ClinicalEvent};
use crate::observer::{BusNotification, BusObserver};
use crate::routing::Topic;
use crate::{headers, BrokerConsumer, BusError, BusMessage, BusResult, SharedBroker};

const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle of a single subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Successful handler result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The event was processed
    Handled,
    /// The event was not relevant to this handler
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload cannot be processed no matter how often it is retried
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("handler failed: {0}")]
    Failed(String),

    /// A downstream dependency is temporarily unavailable
    #[error("transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Whether an in-place retry may succeed
    pub fn is_retriable(&self) -> bool {
        !matches!(self, HandlerError::InvalidPayload(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(err.to_string())
    }
}

pub type HandlerResult = Result<HandlerOutcome, HandlerError>;

/// Business logic invoked for every event on a subscription
///
/// Delivery is at-least-once: the same event may be handed over more than
/// once, so implementations must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ClinicalEvent) -> HandlerResult;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle(&self, event: &ClinicalEvent) -> HandlerResult {
        (**self).handle(event).await
    }
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an [`EventHandler`]
///
/// The closure receives its own copy of the event.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ClinicalEvent) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ClinicalEvent) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, event: &ClinicalEvent) -> HandlerResult {
        (self.f)(event.clone()).await
    }
}

/// A handler bound to a topic and consumer group
#[derive(Clone)]
pub struct EventSubscription {
    topic: Topic,
    consumer_group: String,
    handler: Arc<dyn EventHandler>,
    retry: Option<RetryConfig>,
}

impl EventSubscription {
    pub fn new(
        topic: Topic,
        consumer_group: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) -> Self {
        Self::from_shared(topic, consumer_group, Arc::new(handler))
    }

    /// Subscribe an already shared handler, e.g. one handler on several topics
    pub fn from_shared(
        topic: Topic,
        consumer_group: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            topic,
            consumer_group: consumer_group.into(),
            handler,
            retry: None,
        }
    }

    /// Override the manager's default handler retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("topic", &self.topic)
            .field("consumer_group", &self.consumer_group)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Control handle for a running subscription
#[derive(Clone)]
pub struct SubscriptionHandle {
    topic: Topic,
    consumer_group: String,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<SubscriptionState>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Stop receiving, let the in-flight message finish, and wait for the task
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(
                    topic = %self.topic,
                    consumer_group = %self.consumer_group,
                    error = %e,
                    "Subscription task terminated abnormally"
                );
            }
        }
    }
}

/// Starts and tracks subscription tasks
#[derive(Clone)]
pub struct SubscriptionManager {
    broker: SharedBroker,
    dead_letters: DeadLetterSink,
    observer: BusObserver,
    connect_retry: RetryConfig,
    handler_retry: RetryConfig,
    handles: Arc<Mutex<Vec<SubscriptionHandle>>>,
}

impl SubscriptionManager {
    pub fn new(broker: SharedBroker, config: &BusConfig, observer: BusObserver) -> Self {
        Self {
            dead_letters: DeadLetterSink::new(broker.clone()),
            broker,
            observer,
            connect_retry: config.connect_retry.clone(),
            handler_retry: config.handler_retry.clone(),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Connect a consumer for the subscription and spawn its task
    pub async fn start(&self, subscription: EventSubscription) -> BusResult<SubscriptionHandle> {
        let EventSubscription {
            topic,
            consumer_group,
            handler,
            retry,
        } = subscription;

        let (state_tx, state_rx) = watch::channel(SubscriptionState::Starting);
        self.notify_state(topic, &consumer_group, SubscriptionState::Starting);

        let broker = self.broker.clone();
        let group = consumer_group.clone();
        let consumer = retry_with_backoff(
            || {
                let broker = broker.clone();
                let group = group.clone();
                async move { broker.consumer(&group, topic.as_str()).await }
            },
            &self.connect_retry,
            "subscription_connect",
        )
        .await
        .map_err(|e| {
            tracing::error!(
                topic = %topic,
                consumer_group = %consumer_group,
                error = %e,
                "Failed to start subscription"
            );
            state_tx.send_replace(SubscriptionState::Stopped);
            self.notify_state(topic, &consumer_group, SubscriptionState::Stopped);
            match e {
                BusError::Connection(_) => e,
                other => BusError::Connection(other.to_string()),
            }
        })?;

        let worker = SubscriptionWorker {
            topic,
            consumer_group: consumer_group.clone(),
            handler,
            retry: retry.unwrap_or_else(|| self.handler_retry.clone()),
            consumer,
            dead_letters: self.dead_letters.clone(),
            observer: self.observer.clone(),
            state: state_tx,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(shutdown_rx));

        let handle = SubscriptionHandle {
            topic,
            consumer_group,
            shutdown: Arc::new(shutdown_tx),
            state: state_rx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        };

        self.lock_handles().push(handle.clone());
        Ok(handle)
    }

    /// Handles of every subscription started by this manager
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        self.lock_handles().clone()
    }

    /// Stop every subscription and wait for each to drain
    pub async fn stop_all(&self) {
        let handles: Vec<SubscriptionHandle> = self.lock_handles().drain(..).collect();
        futures::future::join_all(handles.iter().map(SubscriptionHandle::stop)).await;
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionHandle>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify_state(&self, topic: Topic, consumer_group: &str, state: SubscriptionState) {
        self.observer.notify(BusNotification::SubscriptionState {
            topic: topic.as_str().to_string(),
            consumer_group: consumer_group.to_string(),
            state,
        });
    }
}

struct SubscriptionWorker {
    topic: Topic,
    consumer_group: String,
    handler: Arc<dyn EventHandler>,
    retry: RetryConfig,
    consumer: Box<dyn BrokerConsumer>,
    dead_letters: DeadLetterSink,
    observer: BusObserver,
    state: watch::Sender<SubscriptionState>,
}

impl SubscriptionWorker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.transition(SubscriptionState::Running);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = self.consumer.recv() => next,
            };

            match next {
                Some(Ok(message)) => self.process(message).await,
                Some(Err(e)) => {
                    tracing::warn!(
                        topic = %self.topic,
                        consumer_group = %self.consumer_group,
                        error = %e,
                        "Failed to receive message"
                    );
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                }
                None => {
                    tracing::warn!(
                        topic = %self.topic,
                        consumer_group = %self.consumer_group,
                        "Consumer closed by broker"
                    );
                    break;
                }
            }
        }

        self.transition(SubscriptionState::Draining);
        self.consumer.close().await;
        self.transition(SubscriptionState::Stopped);
    }

    async fn process(&mut self, message: BusMessage) {
        let span = tracing::info_span!(
            "process_clinical_event",
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            consumer_group = %self.consumer_group,
            event_id = %message.header(headers::EVENT_ID).unwrap_or("unknown"),
            tenant_id = %message.header(headers::TENANT_ID).unwrap_or("unknown"),
            correlation_id = %message.header(headers::CORRELATION_ID).unwrap_or("none"),
        );

        self.process_in_span(message).instrument(span).await
    }

    async fn process_in_span(&mut self, message: BusMessage) {
        let result = match parse_event(&message) {
            Ok(event) => self
                .invoke(&event)
                .await
                .map(|outcome| (event.event_id(), outcome)),
            Err(e) => Err(e),
        };

        match result {
            Ok((event_id, outcome)) => {
                tracing::debug!(outcome = ?outcome, "Event handled");
                self.commit(&message).await;
                self.observer.notify(BusNotification::Processed {
                    event_id,
                    topic: message.topic.clone(),
                    consumer_group: self.consumer_group.clone(),
                    partition: message.partition,
                    offset: message.offset,
                });
            }
            Err(error) => {
                tracing::error!(error = %error, "Event processing failed, sending to DLQ");
                self.dead_letters
                    .relay(&message, &error, &self.consumer_group)
                    .await;
                self.commit(&message).await;
                self.observer.notify(BusNotification::DeadLettered {
                    topic: message.topic.clone(),
                    consumer_group: self.consumer_group.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    error,
                });
            }
        }
    }

    async fn invoke(&self, event: &ClinicalEvent) -> Result<HandlerOutcome, String> {
        let handler = &self.handler;

        retry_with_backoff_if(
            || async move {
                match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(HandlerError::Failed(format!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            },
            HandlerError::is_retriable,
            &self.retry,
            &self.consumer_group,
        )
        .await
        .map_err(|e| e.to_string())
    }

    async fn commit(&mut self, message: &BusMessage) {
        if let Err(e) = self.consumer.commit(message).await {
            tracing::warn!(
                error = %e,
                "Failed to commit offset, message may be redelivered"
            );
        }
    }

    fn transition(&self, state: SubscriptionState) {
        self.state.send_replace(state);
        self.observer.notify(BusNotification::SubscriptionState {
            topic: self.topic.as_str().to_string(),
            consumer_group: self.consumer_group.clone(),
            state,
        });
        tracing::info!(
            topic = %self.topic,
            consumer_group = %self.consumer_group,
            state = ?state,
            "Subscription state changed"
        );
    }
}

/// Decode a raw message into an envelope
fn parse_event(message: &BusMessage) -> Result<ClinicalEvent, String> {
    let raw: serde_json::Value = serde_json::from_slice(&message.payload)
        .map_err(|e| format!("malformed event payload: {}", e))?;
    validate_envelope_fields(&raw).map_err(|e| format!("invalid event envelope: {}", e))?;
    serde_json::from_value(raw).map_err(|e| format!("invalid event envelope: {}", e))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventDraft, EventType};
    use crate::producer::ProducerSession;
    use crate::{Broker, InMemoryBroker};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BusConfig {
        BusConfig {
            connect_retry: RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2,
            },
            ..BusConfig::default()
        }
    }

    async fn publish_lab_events(broker: &InMemoryBroker, count: usize) -> Vec<ClinicalEvent> {
        let session = ProducerSession::new(Arc::new(broker.clone()), &config(), BusObserver::new());
        session.connect().await.unwrap();

        let mut events = Vec::new();
        for i in 0..count {
            let draft = EventDraft::new(
                EventType::LabOrderPlaced,
                format!("pat-{}", i),
                "FAC-01",
                "tenant-1",
            );
            events.push(session.publish(draft).await.unwrap());
        }
        events
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_invalid_payload_is_not_retriable() {
        assert!(!HandlerError::InvalidPayload("x".into()).is_retriable());
        assert!(HandlerError::Transient("x".into()).is_retriable());
        assert!(HandlerError::Failed("x".into()).is_retriable());
    }

    #[test]
    fn test_worker_is_shareable_across_awaits() {
        fn assert_sync<T: Sync + ?Sized>() {}
        assert_sync::<dyn BrokerConsumer>();
        assert_sync::<SubscriptionWorker>();
    }

    #[tokio::test]
    async fn test_handled_messages_are_committed() {
        let broker = InMemoryBroker::new();
        publish_lab_events(&broker, 3).await;

        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let manager = SubscriptionManager::new(Arc::new(broker.clone()), &config(), BusObserver::new());
        let handle = manager
            .start(EventSubscription::new(
                Topic::LabEvents,
                "decision-support",
                handler_fn(move |_event| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(HandlerOutcome::Handled)
                    }
                }),
            ))
            .await
            .unwrap();

        wait_until(|| broker.committed_offset("decision-support", "lab-events", 6) == Some(3)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(broker.records("dead-letter-queue").is_empty());

        handle.stop().await;
        assert_eq!(handle.state(), SubscriptionState::Stopped);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        publish_lab_events(&broker, 1).await;

        let manager = SubscriptionManager::new(Arc::new(broker.clone()), &config(), BusObserver::new());
        let handle = manager
            .start(EventSubscription::new(
                Topic::LabEvents,
                "decision-support",
                handler_fn(|_event| async move {
                    if true {
                        panic!("lab interface exploded");
                    }
                    Ok(HandlerOutcome::Handled)
                }),
            ))
            .await
            .unwrap();

        wait_until(|| broker.committed_offset("decision-support", "lab-events", 6) == Some(1)).await;

        let dead = broker.records("dead-letter-queue");
        assert_eq!(dead.len(), 1);
        assert!(dead[0]
            .header(headers::ERROR_MESSAGE)
            .unwrap()
            .contains("lab interface exploded"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered_without_calling_handler() {
        let broker = InMemoryBroker::new();
        broker
            .send(crate::OutboundRecord {
                topic: "lab-events".to_string(),
                partition: Some(0),
                key: Some("pat-1".to_string()),
                payload: b"not json".to_vec(),
                headers: crate::Headers::new(),
            })
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let manager = SubscriptionManager::new(Arc::new(broker.clone()), &config(), BusObserver::new());
        let handle = manager
            .start(
                EventSubscription::new(
                    Topic::LabEvents,
                    "decision-support",
                    handler_fn(move |_event| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(HandlerOutcome::Handled)
                        }
                    }),
                )
                .with_retry(RetryConfig::default().with_max_attempts(3)),
            )
            .await
            .unwrap();

        wait_until(|| broker.committed_offset("decision-support", "lab-events", 0) == Some(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let dead = broker.records("dead-letter-queue");
        assert_eq!(dead.len(), 1);
        assert!(dead[0]
            .header(headers::ERROR_MESSAGE)
            .unwrap()
            .starts_with("malformed event payload"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_with_connection_error() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        let observer = BusObserver::new();
        let mut notifications = observer.subscribe();

        let manager = SubscriptionManager::new(Arc::new(broker.clone()), &config(), observer);
        let result = manager
            .start(EventSubscription::new(
                Topic::LabEvents,
                "decision-support",
                handler_fn(|_event| async move { Ok(HandlerOutcome::Handled) }),
            ))
            .await;

        assert!(matches!(result, Err(BusError::Connection(_))));
        assert!(manager.handles().is_empty());

        let mut last = None;
        while let Ok(notification) = notifications.try_recv() {
            last = Some(notification);
        }
        assert!(matches!(
            last,
            Some(BusNotification::SubscriptionState {
                state: SubscriptionState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_stop_all_drains_every_subscription() {
        let broker = InMemoryBroker::new();
        let manager = SubscriptionManager::new(Arc::new(broker.clone()), &config(), BusObserver::new());

        let mut handles = Vec::new();
        for topic in [Topic::LabEvents, Topic::PatientEvents] {
            handles.push(
                manager
                    .start(EventSubscription::new(
                        topic,
                        "audit",
                        handler_fn(|_event| async move { Ok(HandlerOutcome::Skipped) }),
                    ))
                    .await
                    .unwrap(),
            );
        }

        manager.stop_all().await;
        for handle in &handles {
            assert_eq!(handle.state(), SubscriptionState::Stopped);
        }
        assert_eq!(broker.group_members("audit", "lab-events"), 0);

        // second stop is a no-op
        handles[0].stop().await;
    }
}
