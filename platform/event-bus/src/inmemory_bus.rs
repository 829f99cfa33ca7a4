//! In-memory implementation of the Broker trait for testing and development

use crate::routing::{partition_for, DEFAULT_PARTITIONS};
use crate::{
    Broker, BrokerConsumer, BusError, BusMessage, BusResult, DeliveryReceipt, OutboundRecord,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Broker implementation backed by an in-process partitioned log
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without a Kafka cluster
/// - Integration tests that need to inspect committed offsets and the DLQ
///
/// Every topic has the same fixed number of partitions. Records are retained
/// for the lifetime of the broker. Consumer groups track a committed offset
/// per partition, and members of a group split partitions round-robin by
/// join order (partition `p` belongs to member `p % members`).
///
/// # Example
/// ```rust
/// use clinical_event_bus::{Broker, BrokerConsumer, InMemoryBroker, OutboundRecord};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let mut consumer = broker.consumer("audit", "compliance-events").await?;
///
/// broker
///     .send(OutboundRecord {
///         topic: "compliance-events".to_string(),
///         partition: Some(3),
///         key: Some("pat-1".to_string()),
///         payload: b"{}".to_vec(),
///         headers: Default::default(),
///     })
///     .await?;
///
/// let msg = consumer.recv().await.unwrap()?;
/// assert_eq!(msg.partition, 3);
/// consumer.commit(&msg).await?;
/// assert_eq!(broker.committed_offset("audit", "compliance-events", 3), Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    partitions: u32,
    state: Mutex<State>,
    // Woken on every append, commit-relevant membership change, and close
    activity: Notify,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<BusMessage>>>,
    // (group, topic, partition) -> next offset to read
    committed: HashMap<(String, String, i32), i64>,
    // (group, topic) -> member ids in join order
    members: HashMap<(String, String), Vec<u64>>,
    next_member_id: u64,
    unavailable: bool,
    failing_topics: HashSet<String>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InMemoryBroker {
    /// Create a broker with the default partition count (16)
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Create a broker whose topics all have `partitions` partitions
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(State::default()),
                activity: Notify::new(),
            }),
        }
    }

    pub fn partitions(&self) -> u32 {
        self.inner.partitions
    }

    /// Simulate the whole cluster being unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.state().unavailable = unavailable;
    }

    /// Make every send to `topic` fail until [`restore_topic`](Self::restore_topic)
    pub fn fail_topic(&self, topic: &str) {
        self.inner.state().failing_topics.insert(topic.to_string());
    }

    pub fn restore_topic(&self, topic: &str) {
        self.inner.state().failing_topics.remove(topic);
    }

    /// All records of a topic, partition by partition, in offset order
    pub fn records(&self, topic: &str) -> Vec<BusMessage> {
        self.inner
            .state()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of a single partition in offset order
    pub fn partition_records(&self, topic: &str, partition: i32) -> Vec<BusMessage> {
        self.inner
            .state()
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Next offset the group will read on this partition, if it ever committed
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .state()
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Number of live members in a consumer group for a topic
    pub fn group_members(&self, group_id: &str, topic: &str) -> usize {
        self.inner
            .state()
            .members
            .get(&(group_id.to_string(), topic.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> BusResult<()> {
        if self.inner.state().unavailable {
            return Err(BusError::Connection("in-memory broker unavailable".to_string()));
        }
        Ok(())
    }

    async fn send(&self, record: OutboundRecord) -> BusResult<DeliveryReceipt> {
        let partitions = self.inner.partitions;
        let partition = record.partition.unwrap_or_else(|| {
            record
                .key
                .as_deref()
                .map(|key| partition_for(key, partitions))
                .unwrap_or(0)
        });

        if partition < 0 || partition as u32 >= partitions {
            return Err(BusError::Publish(format!(
                "partition {} out of range for topic {} ({} partitions)",
                partition, record.topic, partitions
            )));
        }

        let receipt = {
            let mut state = self.inner.state();
            if state.unavailable {
                return Err(BusError::Publish("in-memory broker unavailable".to_string()));
            }
            if state.failing_topics.contains(&record.topic) {
                return Err(BusError::Publish(format!(
                    "topic {} is rejecting writes",
                    record.topic
                )));
            }

            let log = state
                .topics
                .entry(record.topic.clone())
                .or_insert_with(|| vec![Vec::new(); partitions as usize]);
            let slot = &mut log[partition as usize];
            let offset = slot.len() as i64;

            let mut message = BusMessage::new(record.topic, record.payload)
                .with_headers(record.headers)
                .with_position(partition, offset);
            message.key = record.key;
            slot.push(message);

            DeliveryReceipt { partition, offset }
        };

        self.inner.activity.notify_waiters();
        Ok(receipt)
    }

    async fn consumer(&self, group_id: &str, topic: &str) -> BusResult<Box<dyn BrokerConsumer>> {
        let member_id = {
            let mut state = self.inner.state();
            if state.unavailable {
                return Err(BusError::Connection("in-memory broker unavailable".to_string()));
            }
            state.next_member_id += 1;
            let member_id = state.next_member_id;
            state
                .members
                .entry((group_id.to_string(), topic.to_string()))
                .or_default()
                .push(member_id);
            member_id
        };

        // existing members give up partitions to the newcomer
        self.inner.activity.notify_waiters();

        Ok(Box::new(InMemoryConsumer {
            inner: self.inner.clone(),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            member_id,
            positions: HashMap::new(),
            cursor: 0,
            closed: false,
        }))
    }

    async fn flush(&self) -> BusResult<()> {
        Ok(())
    }

    fn partition_count(&self) -> Option<u32> {
        Some(self.inner.partitions)
    }
}

/// One consumer-group member over the in-memory log
struct InMemoryConsumer {
    inner: Arc<Inner>,
    group_id: String,
    topic: String,
    member_id: u64,
    // partition -> next offset this member will read
    positions: HashMap<i32, i64>,
    // round-robin start point across assigned partitions
    cursor: usize,
    closed: bool,
}

impl InMemoryConsumer {
    fn group_key(&self) -> (String, String) {
        (self.group_id.clone(), self.topic.clone())
    }

    /// Take the next available record, rebalancing first
    fn poll_next(&mut self) -> Option<BusMessage> {
        let state = self.inner.state();
        let partitions = self.inner.partitions as i32;

        let members = state.members.get(&self.group_key())?;
        let index = members.iter().position(|id| *id == self.member_id)?;
        let member_count = members.len();

        let assigned: Vec<i32> = (0..partitions)
            .filter(|p| (*p as usize) % member_count == index)
            .collect();

        self.positions.retain(|partition, _| assigned.contains(partition));
        for partition in &assigned {
            if !self.positions.contains_key(partition) {
                let committed = state
                    .committed
                    .get(&(self.group_id.clone(), self.topic.clone(), *partition))
                    .copied()
                    .unwrap_or(0);
                self.positions.insert(*partition, committed);
            }
        }

        let log = state.topics.get(&self.topic)?;

        for step in 0..assigned.len() {
            let partition = assigned[(self.cursor + step) % assigned.len()];
            let position = self.positions.get(&partition).copied().unwrap_or(0);

            if let Some(message) = log[partition as usize].get(position as usize) {
                self.positions.insert(partition, position + 1);
                self.cursor = (self.cursor + step + 1) % assigned.len();
                return Some(message.clone());
            }
        }

        None
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn recv(&mut self) -> Option<BusResult<BusMessage>> {
        loop {
            if self.closed {
                return None;
            }

            // Register interest before checking so an append between the
            // check and the await is not missed.
            let inner = self.inner.clone();
            let notified = inner.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.poll_next() {
                return Some(Ok(message));
            }

            notified.await;
        }
    }

    async fn commit(&mut self, message: &BusMessage) -> BusResult<()> {
        let mut state = self.inner.state();
        if state.unavailable {
            return Err(BusError::Internal("commit failed: broker unavailable".to_string()));
        }
        state.committed.insert(
            (self.group_id.clone(), message.topic.clone(), message.partition),
            message.offset + 1,
        );
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        {
            let mut state = self.inner.state();
            if let Some(members) = state.members.get_mut(&self.group_key()) {
                members.retain(|id| *id != self.member_id);
            }
        }

        // survivors pick up the released partitions
        self.inner.activity.notify_waiters();
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            let mut state = self.inner.state();
            if let Some(members) = state.members.get_mut(&self.group_key()) {
                members.retain(|id| *id != self.member_id);
            }
            drop(state);
            self.inner.activity.notify_waiters();
        }
    }
}
