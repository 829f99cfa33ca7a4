//! Typed bus notifications
//!
//! Observers receive a [`BusNotification`] for every publish, every processed
//! message, every dead-letter diversion, and every subscription state change.
//! Delivery is best-effort over a broadcast channel: slow observers lag and
//! miss notifications rather than slowing the bus down.

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::envelope::EventType;
use crate::subscription::SubscriptionState;

#[derive(Debug, Clone, PartialEq)]
pub enum BusNotification {
    Published {
        event_id: Uuid,
        event_type: EventType,
        topic: String,
        partition: i32,
        offset: i64,
    },
    Processed {
        event_id: Uuid,
        topic: String,
        consumer_group: String,
        partition: i32,
        offset: i64,
    },
    DeadLettered {
        topic: String,
        consumer_group: String,
        partition: i32,
        offset: i64,
        error: String,
    },
    SubscriptionState {
        topic: String,
        consumer_group: String,
        state: SubscriptionState,
    },
}

/// Fan-out point for [`BusNotification`]s
#[derive(Clone)]
pub struct BusObserver {
    sender: broadcast::Sender<BusNotification>,
}

impl BusObserver {
    /// The observer buffers 1024 notifications per receiver
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit a notification; dropped silently when nobody listens
    pub fn notify(&self, notification: BusNotification) {
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusNotification> {
        self.sender.subscribe()
    }

    /// Notifications as a stream, skipping over lag
    pub fn stream(&self) -> BoxStream<'static, BusNotification> {
        let mut receiver = self.sender.subscribe();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(notification) => yield notification,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Bus observer lagged, notifications skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        stream.boxed()
    }
}

impl Default for BusObserver {
    fn default() -> Self {
        Self::new()
    }
}
