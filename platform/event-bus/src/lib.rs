//! # Clinical Event Bus
//!
//! Publish/subscribe backbone shared by the clinical, medication, lab, device,
//! billing, audit, notification, and interoperability services.
//!
//! ## Guarantees
//!
//! - **Per-facility ordering**: every event for a facility lands on the same
//!   partition (see [`partition_for`]), keyed by patient id.
//! - **At-least-once delivery**: offsets are committed only after a handler
//!   finishes. Handlers must be idempotent.
//! - **Fault isolation**: a failing handler never blocks its partition. The
//!   message is relayed to `dead-letter-queue` and the offset still advances.
//!
//! ## Brokers
//!
//! - **KafkaBroker**: Production implementation on rdkafka (`kafka` feature)
//! - **InMemoryBroker**: Test/dev implementation, a partitioned in-process log
//!   with consumer groups and committed offsets
//!
//! ## Usage
//!
//! ```rust,no_run
//! use clinical_event_bus::{
//!     handler_fn, BusConfig, BusRuntime, EventDraft, EventSubscription, EventType,
//!     HandlerOutcome, InMemoryBroker, Topic,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BusConfig::from_env()?;
//! let runtime = BusRuntime::new(Arc::new(InMemoryBroker::new()), config);
//!
//! runtime
//!     .register(EventSubscription::new(
//!         Topic::PatientEvents,
//!         "records-service",
//!         handler_fn(|event| async move {
//!             tracing::info!(event_id = %event.event_id(), "patient event");
//!             Ok(HandlerOutcome::Handled)
//!         }),
//!     ))
//!     .await?;
//! runtime.start().await?;
//!
//! let draft = EventDraft::new(EventType::PatientRegistered, "pat-1", "FAC-01", "tenant-1");
//! runtime.producer().publish(draft).await?;
//!
//! runtime.stop().await;
//! # Ok(())
//! # }
//! ```

mod config;
pub mod consumer_retry;
mod dlq;
mod envelope;
pub mod helpers;
mod inmemory_bus;
#[cfg(feature = "kafka")]
mod kafka_bus;
mod observer;
mod payloads;
mod producer;
mod routing;
mod runtime;
mod subscription;

pub use config::{BrokerKind, BusConfig, ConfigError};
pub use consumer_retry::RetryConfig;
pub use dlq::DeadLetterSink;
pub use envelope::{validate_envelope_fields, ActorContext, ClinicalEvent, EventDraft, EventType};
pub use inmemory_bus::InMemoryBroker;
#[cfg(feature = "kafka")]
pub use kafka_bus::KafkaBroker;
pub use observer::{BusNotification, BusObserver};
pub use payloads::*;
pub use producer::ProducerSession;
pub use routing::{partition_for, topic_for, Route, Topic, DEFAULT_PARTITIONS};
pub use runtime::{BusRuntime, RuntimeState};
pub use subscription::{
    handler_fn, EventHandler, EventSubscription, FnHandler, HandlerError, HandlerOutcome, HandlerResult,
    SubscriptionHandle, SubscriptionManager, SubscriptionState,
};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Message header set. Ordered so relayed copies are byte-stable.
pub type Headers = BTreeMap<String, String>;

/// Header names attached to every published event
pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const PATIENT_ID: &str = "patient-id";
    pub const FACILITY_ID: &str = "facility-id";
    pub const TENANT_ID: &str = "tenant-id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const SOURCE: &str = "source";
    pub const REGION: &str = "region";

    // Dead-letter annotations
    pub const ERROR_MESSAGE: &str = "error-message";
    pub const FAILED_AT: &str = "failed-at";
    pub const ORIGINAL_TOPIC: &str = "original-topic";
    pub const ORIGINAL_PARTITION: &str = "original-partition";
    pub const ORIGINAL_OFFSET: &str = "original-offset";
    pub const CONSUMER_GROUP: &str = "consumer-group";
}

/// A message received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The topic this message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset of the message within its partition
    pub offset: i64,
    /// Message key (the patient id for clinical events)
    pub key: Option<String>,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl BusMessage {
    /// Create a new bus message at partition 0, offset 0
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: None,
            payload,
            headers: Headers::new(),
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set where the message sits in the log
    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    /// Look up a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A record handed to the broker for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    /// Explicit partition; `None` lets the broker choose
    pub partition: Option<i32>,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Broker acknowledgement for a delivered record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe to topic: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("producer session is not connected")]
    NotConnected,

    #[error("event bus is shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Transport seam between the bus and a partitioned append-log broker
///
/// Implementations own the network session. `send` must be safe to call
/// concurrently from many tasks.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish (or verify) connectivity to the broker
    ///
    /// Called once at startup by the producer session, wrapped in the
    /// connection retry policy.
    async fn connect(&self) -> BusResult<()>;

    /// Deliver a record and wait for the broker acknowledgement
    async fn send(&self, record: OutboundRecord) -> BusResult<DeliveryReceipt>;

    /// Open an independent consumer session for `topic` in `group_id`
    ///
    /// Members of the same group divide the topic's partitions among
    /// themselves. Consumption resumes from the group's committed offsets.
    async fn consumer(&self, group_id: &str, topic: &str) -> BusResult<Box<dyn BrokerConsumer>>;

    /// Wait for in-flight sends to be acknowledged
    async fn flush(&self) -> BusResult<()>;

    /// Fixed partition count of every topic, when the broker knows it
    ///
    /// The producer session refuses to connect when this disagrees with its
    /// configured partition count.
    fn partition_count(&self) -> Option<u32> {
        None
    }
}

/// A single consumer-group member reading one topic
///
/// The subscription worker owning a consumer is borrowed across awaits inside
/// a spawned task, so implementations must be `Sync` as well as `Send`.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Receive the next message
    ///
    /// Returns `None` once the consumer is closed. Must be cancel-safe: a
    /// dropped `recv` future never loses a message.
    async fn recv(&mut self) -> Option<BusResult<BusMessage>>;

    /// Commit the offset following `message` for this consumer's group
    async fn commit(&mut self, message: &BusMessage) -> BusResult<()>;

    /// Leave the consumer group and release the session
    async fn close(&mut self);
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}

/// Shared handle to a broker implementation
pub type SharedBroker = Arc<dyn Broker>;
