//! Dead Letter Queue (DLQ) relay
//!
//! Messages whose handler failed are copied to the `dead-letter-queue` topic
//! with their original key, value, and headers, annotated with the failure.
//! Nothing consumes the DLQ automatically; it is an inspection point for
//! operators.

use chrono::{SecondsFormat, Utc};

use crate::headers;
use crate::routing::Topic;
use crate::{BusMessage, OutboundRecord, SharedBroker};

/// Best-effort writer to the dead-letter topic
#[derive(Clone)]
pub struct DeadLetterSink {
    broker: SharedBroker,
}

impl DeadLetterSink {
    pub fn new(broker: SharedBroker) -> Self {
        Self { broker }
    }

    /// Build the dead-letter record for a failed message
    pub fn dead_letter_record(message: &BusMessage, error: &str, consumer_group: &str) -> OutboundRecord {
        let error = error.trim();
        let error = if error.is_empty() { "unknown processing error" } else { error };

        let mut annotated = message.headers.clone();
        annotated.insert(headers::ERROR_MESSAGE.to_string(), error.to_string());
        annotated.insert(
            headers::FAILED_AT.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        annotated.insert(headers::ORIGINAL_TOPIC.to_string(), message.topic.clone());
        annotated.insert(
            headers::ORIGINAL_PARTITION.to_string(),
            message.partition.to_string(),
        );
        annotated.insert(headers::ORIGINAL_OFFSET.to_string(), message.offset.to_string());
        annotated.insert(headers::CONSUMER_GROUP.to_string(), consumer_group.to_string());

        OutboundRecord {
            topic: Topic::DeadLetterQueue.as_str().to_string(),
            partition: None,
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers: annotated,
        }
    }

    /// Relay a failed message to the DLQ
    ///
    /// Never fails: a write error is logged and the message is dropped from
    /// the DLQ's point of view. Returns whether the write was acknowledged.
    pub async fn relay(&self, message: &BusMessage, error: &str, consumer_group: &str) -> bool {
        let record = Self::dead_letter_record(message, error, consumer_group);

        match self.broker.send(record).await {
            Ok(receipt) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    consumer_group = %consumer_group,
                    event_id = %message.header(headers::EVENT_ID).unwrap_or("unknown"),
                    tenant_id = %message.header(headers::TENANT_ID).unwrap_or("unknown"),
                    correlation_id = %message.header(headers::CORRELATION_ID).unwrap_or("none"),
                    dlq_partition = receipt.partition,
                    dlq_offset = receipt.offset,
                    error = %error,
                    "Event moved to DLQ after processing failure"
                );
                true
            }
            Err(dlq_err) => {
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    consumer_group = %consumer_group,
                    event_id = %message.header(headers::EVENT_ID).unwrap_or("unknown"),
                    error = %error,
                    dlq_error = %dlq_err,
                    "Failed to write to DLQ - event may be lost!"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Headers, InMemoryBroker};
    use std::sync::Arc;

    fn failed_message() -> BusMessage {
        let mut original = Headers::new();
        original.insert(headers::EVENT_ID.to_string(), "evt-1".to_string());
        original.insert(headers::TENANT_ID.to_string(), "tenant-1".to_string());

        BusMessage::new("lab-events", b"{\"eventId\":\"evt-1\"}".to_vec())
            .with_key("pat-1")
            .with_headers(original)
            .with_position(6, 41)
    }

    #[tokio::test]
    async fn test_relay_preserves_original_and_annotates() {
        let broker = InMemoryBroker::new();
        let sink = DeadLetterSink::new(Arc::new(broker.clone()));
        let message = failed_message();

        assert!(sink.relay(&message, "lab system timeout", "decision-support").await);

        let dead = broker.records("dead-letter-queue");
        assert_eq!(dead.len(), 1);

        let relayed = &dead[0];
        assert_eq!(relayed.key.as_deref(), Some("pat-1"));
        assert_eq!(relayed.payload, message.payload);
        assert_eq!(relayed.header(headers::EVENT_ID), Some("evt-1"));
        assert_eq!(relayed.header(headers::TENANT_ID), Some("tenant-1"));
        assert_eq!(relayed.header(headers::ERROR_MESSAGE), Some("lab system timeout"));
        assert_eq!(relayed.header(headers::ORIGINAL_TOPIC), Some("lab-events"));
        assert_eq!(relayed.header(headers::ORIGINAL_PARTITION), Some("6"));
        assert_eq!(relayed.header(headers::ORIGINAL_OFFSET), Some("41"));

        let failed_at = relayed.header(headers::FAILED_AT).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(failed_at).is_ok());
    }

    #[test]
    fn test_blank_error_is_replaced() {
        let record = DeadLetterSink::dead_letter_record(&failed_message(), "  ", "g");
        assert_eq!(
            record.headers.get(headers::ERROR_MESSAGE).map(String::as_str),
            Some("unknown processing error")
        );
    }

    #[tokio::test]
    async fn test_relay_failure_is_swallowed() {
        let broker = InMemoryBroker::new();
        broker.fail_topic("dead-letter-queue");
        let sink = DeadLetterSink::new(Arc::new(broker.clone()));

        assert!(!sink.relay(&failed_message(), "boom", "g").await);
        assert!(broker.records("dead-letter-queue").is_empty());
    }
}
