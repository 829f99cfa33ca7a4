//! Bus runtime: explicit owner of the producer session and subscriptions
//!
//! Services build one runtime at startup, register their subscriptions, call
//! [`BusRuntime::start`], and call [`BusRuntime::stop`] on shutdown. Stop
//! rejects new publishes first, drains every subscription, then flushes and
//! closes the producer session.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{BrokerKind, BusConfig};
use crate::inmemory_bus::InMemoryBroker;
use crate::observer::BusObserver;
use crate::producer::ProducerSession;
use crate::subscription::{EventSubscription, SubscriptionManager};
use crate::{BusError, BusResult, SharedBroker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    Running,
    Stopped,
}

/// Lifecycle object shared by everything that publishes or subscribes
#[derive(Clone)]
pub struct BusRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: BusConfig,
    broker: SharedBroker,
    observer: BusObserver,
    producer: ProducerSession,
    subscriptions: SubscriptionManager,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    state: RuntimeState,
    pending: Vec<EventSubscription>,
}

impl BusRuntime {
    /// Wrap an existing broker
    ///
    /// `config.partitions` must match the broker's topic partition count;
    /// `start` fails with [`BusError::Config`] otherwise.
    pub fn new(broker: SharedBroker, config: BusConfig) -> Self {
        let observer = BusObserver::new();
        let producer = ProducerSession::new(broker.clone(), &config, observer.clone());
        let subscriptions = SubscriptionManager::new(broker.clone(), &config, observer.clone());

        Self {
            inner: Arc::new(RuntimeInner {
                config,
                broker,
                observer,
                producer,
                subscriptions,
                lifecycle: Mutex::new(Lifecycle {
                    state: RuntimeState::Created,
                    pending: Vec::new(),
                }),
            }),
        }
    }

    /// Build the broker selected by `BROKER_TYPE` and wrap it in a runtime
    pub fn from_config(config: BusConfig) -> BusResult<Self> {
        let broker: SharedBroker = match config.broker {
            BrokerKind::InMemory => Arc::new(InMemoryBroker::with_partitions(config.partitions)),
            #[cfg(feature = "kafka")]
            BrokerKind::Kafka => Arc::new(crate::kafka_bus::KafkaBroker::new(&config)?),
            #[cfg(not(feature = "kafka"))]
            BrokerKind::Kafka => {
                return Err(BusError::Config(crate::ConfigError::InvalidValue {
                    key: "BROKER_TYPE",
                    value: "kafka".to_string(),
                    reason: "built without the `kafka` feature".to_string(),
                }))
            }
        };

        tracing::info!(broker = ?config.broker, "Event bus broker selected");
        Ok(Self::new(broker, config))
    }

    pub fn producer(&self) -> &ProducerSession {
        &self.inner.producer
    }

    pub fn observer(&self) -> &BusObserver {
        &self.inner.observer
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.inner.broker
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub async fn state(&self) -> RuntimeState {
        self.inner.lifecycle.lock().await.state
    }

    /// Add a subscription
    ///
    /// Before `start` it is queued; on a running bus it starts immediately.
    pub async fn register(&self, subscription: EventSubscription) -> BusResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        match lifecycle.state {
            RuntimeState::Created => {
                lifecycle.pending.push(subscription);
                Ok(())
            }
            RuntimeState::Running => {
                self.inner.subscriptions.start(subscription).await?;
                Ok(())
            }
            RuntimeState::Stopped => Err(BusError::ShuttingDown),
        }
    }

    /// Connect the producer session and start every registered subscription
    ///
    /// Idempotent. Any failure here is fatal: whatever was started is torn
    /// down again and the runtime ends up stopped.
    pub async fn start(&self) -> BusResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        match lifecycle.state {
            RuntimeState::Running => return Ok(()),
            RuntimeState::Stopped => return Err(BusError::ShuttingDown),
            RuntimeState::Created => {}
        }

        let pending: Vec<EventSubscription> = lifecycle.pending.drain(..).collect();
        let started = self.start_all(pending).await;

        match started {
            Ok(count) => {
                lifecycle.state = RuntimeState::Running;
                tracing::info!(
                    subscriptions = count,
                    source = %self.inner.config.service_name,
                    "Event bus started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Event bus failed to start");
                self.shutdown().await;
                lifecycle.state = RuntimeState::Stopped;
                Err(e)
            }
        }
    }

    /// Stop publishing, drain subscriptions, then close the producer session
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.state == RuntimeState::Stopped {
            return;
        }

        lifecycle.pending.clear();
        self.shutdown().await;
        lifecycle.state = RuntimeState::Stopped;
        tracing::info!("Event bus stopped");
    }

    async fn start_all(&self, pending: Vec<EventSubscription>) -> BusResult<usize> {
        self.inner.producer.connect().await?;

        let count = pending.len();
        for subscription in pending {
            self.inner.subscriptions.start(subscription).await?;
        }
        Ok(count)
    }

    async fn shutdown(&self) {
        self.inner.producer.begin_shutdown().await;
        self.inner.subscriptions.stop_all().await;

        if let Err(e) = self.inner.producer.close().await {
            tracing::warn!(error = %e, "Failed to flush producer session on shutdown");
        }
    }
}
