//! Producer session: the process-wide publisher
//!
//! One session is shared (cheaply cloned) by every publish call site in a
//! process. `publish` enriches the draft, routes it, and waits for the broker
//! acknowledgement. Failures propagate to the caller; the bus never stores
//! unsent events.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::config::{BusConfig, ConfigError};
use crate::consumer_retry::{retry_with_backoff, RetryConfig};
use crate::envelope::{ClinicalEvent, EventDraft};
use crate::observer::{BusNotification, BusObserver};
use crate::routing::Route;
use crate::{headers, BusError, BusResult, Headers, OutboundRecord, SharedBroker};

const IDLE: u8 = 0;
const CONNECTED: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// Shared, long-lived publishing client
#[derive(Clone)]
pub struct ProducerSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    broker: SharedBroker,
    source: String,
    source_version: String,
    partitions: u32,
    send_timeout: Duration,
    connect_retry: RetryConfig,
    state: AtomicU8,
    // serializes connect/close transitions
    transition: Mutex<()>,
    // shared by each publish for its whole send, taken exclusively to stop publishing
    sends: RwLock<()>,
    observer: BusObserver,
}

impl ProducerSession {
    pub fn new(broker: SharedBroker, config: &BusConfig, observer: BusObserver) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                broker,
                source: config.service_name.clone(),
                source_version: config.service_version.clone(),
                partitions: config.partitions,
                send_timeout: config.send_timeout,
                connect_retry: config.connect_retry.clone(),
                state: AtomicU8::new(IDLE),
                transition: Mutex::new(()),
                sends: RwLock::new(()),
                observer,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CONNECTED
    }

    /// Connect to the broker
    ///
    /// Idempotent. Retries with exponential backoff, then fails with
    /// [`BusError::Connection`]; callers treat that as fatal at startup.
    /// A broker whose partition count differs from the configured one is
    /// rejected with [`BusError::Config`] before any connection attempt.
    pub async fn connect(&self) -> BusResult<()> {
        let _guard = self.inner.transition.lock().await;

        match self.inner.state.load(Ordering::Acquire) {
            CONNECTED => return Ok(()),
            CLOSING | CLOSED => return Err(BusError::ShuttingDown),
            _ => {}
        }

        if let Some(actual) = self.inner.broker.partition_count() {
            if actual != self.inner.partitions {
                return Err(BusError::Config(ConfigError::InvalidValue {
                    key: "BUS_PARTITIONS",
                    value: self.inner.partitions.to_string(),
                    reason: format!("broker topics have {} partitions", actual),
                }));
            }
        }

        let broker = self.inner.broker.clone();
        retry_with_backoff(
            || {
                let broker = broker.clone();
                async move { broker.connect().await }
            },
            &self.inner.connect_retry,
            "producer_connect",
        )
        .await
        .map_err(|e| match e {
            BusError::Connection(_) => e,
            other => BusError::Connection(other.to_string()),
        })?;

        self.inner.state.store(CONNECTED, Ordering::Release);
        tracing::info!(
            source = %self.inner.source,
            partitions = self.inner.partitions,
            "Producer session connected"
        );
        Ok(())
    }

    /// Publish a clinical event
    ///
    /// Returns the enriched envelope exactly as it was sent. Two calls with
    /// the same draft contents produce two distinct events.
    pub async fn publish(&self, draft: EventDraft) -> BusResult<ClinicalEvent> {
        // held across the send; begin_shutdown and close wait for it
        let _send = self.inner.sends.read().await;

        match self.inner.state.load(Ordering::Acquire) {
            CONNECTED => {}
            CLOSING | CLOSED => return Err(BusError::ShuttingDown),
            _ => return Err(BusError::NotConnected),
        }

        draft.validate().map_err(BusError::InvalidEvent)?;

        let event = draft.enrich(&self.inner.source, &self.inner.source_version);
        let route = Route::new(
            event.event_type().as_str(),
            event.facility_id(),
            event.patient_id(),
            self.inner.partitions,
        );

        let record = OutboundRecord {
            topic: route.topic.as_str().to_string(),
            partition: Some(route.partition),
            key: Some(route.key),
            payload: serde_json::to_vec(&event)?,
            headers: Self::headers_for(&event),
        };

        let sent = match tokio::time::timeout(self.inner.send_timeout, self.inner.broker.send(record)).await {
            Ok(sent) => sent,
            Err(_) => Err(BusError::Publish(format!(
                "broker did not acknowledge within {:?}",
                self.inner.send_timeout
            ))),
        };

        let receipt = sent.map_err(|e| {
            tracing::error!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                topic = %route.topic,
                partition = route.partition,
                tenant_id = %event.tenant_id(),
                error = %e,
                "Failed to publish clinical event"
            );
            match e {
                BusError::Publish(_) => e,
                other => BusError::Publish(other.to_string()),
            }
        })?;

        tracing::debug!(
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            topic = %route.topic,
            partition = receipt.partition,
            offset = receipt.offset,
            correlation_id = %event.correlation_id(),
            "Published clinical event"
        );

        self.inner.observer.notify(BusNotification::Published {
            event_id: event.event_id(),
            event_type: event.event_type().clone(),
            topic: route.topic.as_str().to_string(),
            partition: receipt.partition,
            offset: receipt.offset,
        });

        Ok(event)
    }

    /// Reject every publish from now on, without flushing yet
    ///
    /// Waits for sends already past the state check. Idempotent; call
    /// [`close`](Self::close) afterwards to flush.
    pub async fn begin_shutdown(&self) {
        let _guard = self.inner.transition.lock().await;
        let _sends = self.inner.sends.write().await;

        let state = self.inner.state.load(Ordering::Acquire);
        if state == CLOSING || state == CLOSED {
            return;
        }

        self.inner.state.store(CLOSING, Ordering::Release);
        tracing::info!(source = %self.inner.source, "Producer session no longer accepting publishes");
    }

    /// Stop accepting publishes and flush in-flight sends
    ///
    /// Idempotent.
    pub async fn close(&self) -> BusResult<()> {
        let _guard = self.inner.transition.lock().await;

        {
            let _sends = self.inner.sends.write().await;
            if self.inner.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
                return Ok(());
            }
        }

        self.inner.broker.flush().await?;
        tracing::info!(source = %self.inner.source, "Producer session closed");
        Ok(())
    }

    /// Transport headers for an envelope
    ///
    /// `region` is only present when the event carries one.
    pub fn headers_for(event: &ClinicalEvent) -> Headers {
        let mut headers = Headers::new();
        headers.insert(headers::EVENT_ID.to_string(), event.event_id().to_string());
        headers.insert(headers::EVENT_TYPE.to_string(), event.event_type().to_string());
        headers.insert(headers::PATIENT_ID.to_string(), event.patient_id().to_string());
        headers.insert(headers::FACILITY_ID.to_string(), event.facility_id().to_string());
        headers.insert(headers::TENANT_ID.to_string(), event.tenant_id().to_string());
        headers.insert(headers::TIMESTAMP.to_string(), event.timestamp().to_rfc3339());
        headers.insert(
            headers::CORRELATION_ID.to_string(),
            event.correlation_id().to_string(),
        );
        headers.insert(headers::SOURCE.to_string(), event.source().to_string());
        if let Some(region) = event.region() {
            headers.insert(headers::REGION.to_string(), region.to_string());
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use crate::{Broker, BrokerConsumer, DeliveryReceipt, InMemoryBroker};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn config() -> BusConfig {
        BusConfig {
            service_name: "registration".to_string(),
            service_version: "2.0.0".to_string(),
            connect_retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2,
            },
            ..BusConfig::default()
        }
    }

    fn draft() -> EventDraft {
        EventDraft::new(EventType::PatientRegistered, "pat-1", "FAC-01", "tenant-1")
    }

    /// Acknowledges sends after a delay and records flushes that overtake them
    struct SlowBroker {
        log: InMemoryBroker,
        delay: Duration,
        sending: AtomicBool,
        flushed_mid_send: AtomicBool,
    }

    impl SlowBroker {
        fn new(delay: Duration) -> Self {
            Self {
                log: InMemoryBroker::new(),
                delay,
                sending: AtomicBool::new(false),
                flushed_mid_send: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Broker for SlowBroker {
        async fn connect(&self) -> BusResult<()> {
            self.log.connect().await
        }

        async fn send(&self, record: OutboundRecord) -> BusResult<DeliveryReceipt> {
            self.sending.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let receipt = self.log.send(record).await;
            self.sending.store(false, Ordering::SeqCst);
            receipt
        }

        async fn consumer(&self, group_id: &str, topic: &str) -> BusResult<Box<dyn BrokerConsumer>> {
            self.log.consumer(group_id, topic).await
        }

        async fn flush(&self) -> BusResult<()> {
            if self.sending.load(Ordering::SeqCst) {
                self.flushed_mid_send.store(true, Ordering::SeqCst);
            }
            self.log.flush().await
        }

        fn partition_count(&self) -> Option<u32> {
            self.log.partition_count()
        }
    }

    async fn connected(broker: &InMemoryBroker) -> ProducerSession {
        let session = ProducerSession::new(Arc::new(broker.clone()), &config(), BusObserver::new());
        assert_ok!(session.connect().await);
        session
    }

    #[tokio::test]
    async fn test_publish_before_connect_is_rejected() {
        let broker = InMemoryBroker::new();
        let session = ProducerSession::new(Arc::new(broker.clone()), &config(), BusObserver::new());

        assert!(matches!(session.publish(draft()).await, Err(BusError::NotConnected)));
        assert!(broker.records("patient-events").is_empty());
    }

    #[tokio::test]
    async fn test_publish_routes_and_stamps_headers() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;

        let event = session
            .publish(draft().with_region(Some("eu-west".to_string())))
            .await
            .unwrap();

        let records = broker.partition_records("patient-events", 6);
        assert_eq!(records.len(), 1);

        let sent = &records[0];
        assert_eq!(sent.key.as_deref(), Some("pat-1"));
        assert_eq!(sent.header(headers::EVENT_ID), Some(event.event_id().to_string().as_str()));
        assert_eq!(sent.header(headers::EVENT_TYPE), Some("patient_registered"));
        assert_eq!(sent.header(headers::FACILITY_ID), Some("FAC-01"));
        assert_eq!(sent.header(headers::SOURCE), Some("registration"));
        assert_eq!(sent.header(headers::REGION), Some("eu-west"));
        assert_eq!(
            sent.header(headers::CORRELATION_ID),
            Some(event.event_id().to_string().as_str())
        );

        let decoded: ClinicalEvent = serde_json::from_slice(&sent.payload).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.source_version(), "2.0.0");
    }

    #[tokio::test]
    async fn test_region_header_absent_when_unset() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;

        session.publish(draft()).await.unwrap();
        let sent = &broker.records("patient-events")[0];
        assert_eq!(sent.header(headers::REGION), None);
    }

    #[tokio::test]
    async fn test_invalid_draft_never_reaches_broker() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;

        let bad = EventDraft::new(EventType::PatientRegistered, "pat-1", "FAC-01", "");
        assert!(matches!(session.publish(bad).await, Err(BusError::InvalidEvent(_))));
        assert!(broker.records("patient-events").is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_propagates_as_publish_error() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        broker.fail_topic("patient-events");

        let result = session.publish(draft()).await;
        assert!(matches!(result, Err(BusError::Publish(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        let session = ProducerSession::new(Arc::new(broker.clone()), &config(), BusObserver::new());

        let result = session.connect().await;
        assert!(matches!(result, Err(BusError::Connection(_))));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_connect_and_close_are_idempotent() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;
        assert_ok!(session.connect().await);

        assert_ok!(session.close().await);
        assert_ok!(session.close().await);

        assert!(matches!(session.publish(draft()).await, Err(BusError::ShuttingDown)));
        assert_err!(session.connect().await);
    }

    #[tokio::test]
    async fn test_published_notification() {
        let broker = InMemoryBroker::new();
        let observer = BusObserver::new();
        let mut notifications = observer.subscribe();
        let session = ProducerSession::new(Arc::new(broker.clone()), &config(), observer);
        session.connect().await.unwrap();

        let event = session.publish(draft()).await.unwrap();

        match notifications.recv().await.unwrap() {
            BusNotification::Published { event_id, topic, partition, offset, .. } => {
                assert_eq!(event_id, event.event_id());
                assert_eq!(topic, "patient-events");
                assert_eq!(partition, 6);
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_begin_shutdown_rejects_publishes_before_flush() {
        let broker = InMemoryBroker::new();
        let session = connected(&broker).await;

        session.begin_shutdown().await;
        session.begin_shutdown().await;

        assert!(matches!(session.publish(draft()).await, Err(BusError::ShuttingDown)));
        assert!(!session.is_connected());
        assert_err!(session.connect().await);
        assert_ok!(session.close().await);
        assert!(broker.records("patient-events").is_empty());
    }

    #[tokio::test]
    async fn test_close_waits_for_send_in_flight() {
        let broker = Arc::new(SlowBroker::new(Duration::from_millis(200)));
        let session = ProducerSession::new(broker.clone(), &config(), BusObserver::new());
        assert_ok!(session.connect().await);

        let publishing = tokio::spawn({
            let session = session.clone();
            async move { session.publish(draft()).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !broker.sending.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("send never started");

        assert_ok!(session.close().await);
        assert!(!broker.flushed_mid_send.load(Ordering::SeqCst));

        assert_ok!(publishing.await.unwrap());
        assert_eq!(broker.log.records("patient-events").len(), 1);
    }

    #[tokio::test]
    async fn test_connect_rejects_partition_mismatch() {
        let broker = InMemoryBroker::with_partitions(8);
        let session = ProducerSession::new(Arc::new(broker), &config(), BusObserver::new());

        match session.connect().await {
            Err(BusError::Config(ConfigError::InvalidValue { key, .. })) => {
                assert_eq!(key, "BUS_PARTITIONS")
            }
            other => panic!("expected partition mismatch, got {:?}", other.err()),
        }
        assert!(!session.is_connected());
    }
}
