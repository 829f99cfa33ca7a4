//! Kafka implementation of the Broker trait
//!
//! Producer: idempotent (`enable.idempotence=true`, `acks=all`) with the
//! configured compression codec. Consumers: one `StreamConsumer` per
//! subscription with auto-commit disabled; offsets are committed explicitly
//! after each message is handled or dead-lettered.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;

use crate::config::BusConfig;
use crate::{
    Broker, BrokerConsumer, BusError, BusMessage, BusResult, DeliveryReceipt, Headers,
    OutboundRecord,
};

/// Kafka-backed broker
#[derive(Clone)]
pub struct KafkaBroker {
    producer: FutureProducer,
    base: ClientConfig,
    send_timeout: Duration,
}

impl KafkaBroker {
    /// Create the producer client
    ///
    /// No network I/O happens here; [`Broker::connect`] verifies the cluster
    /// is reachable.
    pub fn new(config: &BusConfig) -> BusResult<Self> {
        let base = client_config(config);

        let mut producer_config = base.clone();
        producer_config
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("compression.type", config.compression.as_str())
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .set(
                "retry.backoff.ms",
                config.connect_retry.initial_backoff.as_millis().to_string(),
            );

        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| BusError::Connection(format!("failed to create Kafka producer: {}", e)))?;

        tracing::info!(
            brokers = %config.kafka_brokers,
            client_id = %config.client_id,
            compression = %config.compression,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            base,
            send_timeout: config.send_timeout,
        })
    }
}

fn client_config(config: &BusConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.kafka_brokers.as_str())
        .set("client.id", config.client_id.as_str());

    let protocol = match (config.ssl, config.sasl.is_some()) {
        (true, true) => "SASL_SSL",
        (true, false) => "SSL",
        (false, true) => "SASL_PLAINTEXT",
        (false, false) => "PLAINTEXT",
    };
    client.set("security.protocol", protocol);

    if let Some(sasl) = &config.sasl {
        client
            .set("sasl.mechanism", sasl.mechanism.as_str())
            .set("sasl.username", sasl.username.as_str())
            .set("sasl.password", sasl.password.as_str());
    }

    client
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn connect(&self) -> BusResult<()> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;

        let brokers = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| BusError::Internal(format!("metadata task failed: {}", e)))?
        .map_err(|e| BusError::Connection(format!("failed to reach Kafka cluster: {}", e)))?;

        tracing::info!(brokers = brokers, "Connected to Kafka cluster");
        Ok(())
    }

    async fn send(&self, record: OutboundRecord) -> BusResult<DeliveryReceipt> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let mut future_record: FutureRecord<'_, str, Vec<u8>> = FutureRecord::to(&record.topic)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }

        match self
            .producer
            .send(future_record, Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(DeliveryReceipt { partition, offset }),
            Err((e, _)) => Err(BusError::Publish(format!(
                "failed to publish to Kafka topic {}: {}",
                record.topic, e
            ))),
        }
    }

    async fn consumer(&self, group_id: &str, topic: &str) -> BusResult<Box<dyn BrokerConsumer>> {
        let mut consumer_config = self.base.clone();
        consumer_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");

        let consumer: StreamConsumer = consumer_config
            .create()
            .map_err(|e| BusError::Subscribe(format!("failed to create Kafka consumer: {}", e)))?;

        consumer.subscribe(&[topic]).map_err(|e| {
            BusError::Subscribe(format!("failed to subscribe to Kafka topic {}: {}", topic, e))
        })?;

        tracing::info!(topic = %topic, consumer_group = %group_id, "Kafka consumer subscribed");

        Ok(Box::new(KafkaConsumer {
            consumer,
            closed: false,
        }))
    }

    async fn flush(&self) -> BusResult<()> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;

        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BusError::Internal(format!("flush task failed: {}", e)))?
            .map_err(|e| BusError::Publish(format!("failed to flush Kafka producer: {}", e)))
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
    closed: bool,
}

fn to_bus_message(message: &BorrowedMessage<'_>) -> BusMessage {
    let mut headers = Headers::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    BusMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn recv(&mut self) -> Option<BusResult<BusMessage>> {
        if self.closed {
            return None;
        }

        match self.consumer.recv().await {
            Ok(message) => Some(Ok(to_bus_message(&message))),
            Err(e) => Some(Err(BusError::Subscribe(format!("Kafka receive failed: {}", e)))),
        }
    }

    async fn commit(&mut self, message: &BusMessage) -> BusResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|e| BusError::Internal(format!("invalid commit position: {}", e)))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BusError::Internal(format!("failed to commit offset: {}", e)))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.consumer.unsubscribe();
            self.closed = true;
        }
    }
}
