use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use super::{
    ConsumerDriver, DriverError, ProducerDriver, RebalanceHandler, Transport,
};
use crate::consumer::{Consumer, ConsumerOptions, StreamProcessor};
use crate::producer::{Delivery, Producer};
use crate::types::{Message, OffsetAndMetadata, ProducerRecord, RecordMetadata, TopicPartition};

/// In-process broker backing the `memory://` transport: per-partition record
/// vectors plus per-group committed offsets. Used by tests and local runs
/// where a real cluster would get in the way; group rebalances are driven by
/// hand through the consumer driver.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<(String, TopicPartition), OffsetAndMetadata>,
}

#[derive(Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Option<Bytes>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    /// Appends a record, creating a single-partition topic on first use.
    /// Keyed records land on a key-hashed partition, like any log that wants
    /// per-key ordering.
    pub fn produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> RecordMetadata {
        let metadata = {
            let mut state = self.lock();
            let log = state
                .topics
                .entry(topic.to_owned())
                .or_insert_with(|| vec![Vec::new()]);
            let index = match partition {
                Some(partition) => partition as usize % log.len(),
                None => match &key {
                    Some(key) => {
                        let mut hasher = DefaultHasher::new();
                        key.hash(&mut hasher);
                        hasher.finish() as usize % log.len()
                    }
                    None => 0,
                },
            };
            let offset = log[index].len() as i64;
            log[index].push(StoredRecord { key, value });
            RecordMetadata {
                partition: index as i32,
                offset,
            }
        };
        self.notify.notify_waiters();
        metadata
    }

    pub fn partitions(&self, topic: &str) -> Vec<TopicPartition> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .map(|log| {
                (0..log.len() as i32)
                    .map(|partition| TopicPartition::new(topic, partition))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn end_offset(&self, tp: &TopicPartition) -> i64 {
        let state = self.lock();
        state
            .topics
            .get(&tp.topic)
            .and_then(|log| log.get(tp.partition as usize))
            .map(|records| records.len() as i64)
            .unwrap_or(0)
    }

    /// Committed offset for a group, in inclusive processed form.
    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.lock();
        state
            .committed
            .get(&(group.to_owned(), tp.clone()))
            .map(|oam| oam.offset)
    }

    fn commit(&self, group: &str, offsets: &HashMap<TopicPartition, OffsetAndMetadata>) {
        let mut state = self.lock();
        for (tp, oam) in offsets {
            state
                .committed
                .insert((group.to_owned(), tp.clone()), oam.clone());
        }
    }

    fn fetch(&self, tp: &TopicPartition, offset: i64) -> Option<Message> {
        let state = self.lock();
        let record = state
            .topics
            .get(&tp.topic)?
            .get(tp.partition as usize)?
            .get(offset as usize)?;
        Some(Message {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            key: record.key.clone(),
            value: record.value.clone(),
        })
    }

    fn read_to_end(&self, topic: &str) -> Vec<Message> {
        let state = self.lock();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (partition, records) in log.iter().enumerate() {
            for (offset, record) in records.iter().enumerate() {
                out.push(Message {
                    topic: topic.to_owned(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: record.key.clone(),
                    value: record.value.clone(),
                });
            }
        }
        out
    }
}

pub struct MemoryConsumerDriver {
    broker: Arc<MemoryBroker>,
    group: String,
    inner: Mutex<DriverState>,
    closed: AtomicBool,
}

#[derive(Default)]
struct DriverState {
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    handler: Option<Arc<dyn RebalanceHandler>>,
}

impl MemoryConsumerDriver {
    pub fn new(broker: Arc<MemoryBroker>, group: impl Into<String>) -> Self {
        Self {
            broker,
            group: group.into(),
            inner: Mutex::new(DriverState::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DriverState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_assigned(&self) -> Option<Message> {
        let mut inner = self.lock();
        let assignment = inner.assignment.clone();
        for tp in assignment {
            let position = inner.positions.get(&tp).copied().unwrap_or(0);
            if let Some(message) = self.broker.fetch(&tp, position) {
                inner.positions.insert(tp, position + 1);
                return Some(message);
            }
        }
        None
    }

    /// Hands partitions to this member, resuming right above the group's
    /// committed offset. Tests drive group rebalances through this and
    /// [`Self::revoke`].
    pub async fn assign(&self, tps: &[TopicPartition]) {
        {
            let mut inner = self.lock();
            for tp in tps {
                if !inner.assignment.contains(tp) {
                    inner.assignment.push(tp.clone());
                }
                let resume = self
                    .broker
                    .committed(&self.group, tp)
                    .map(|offset| offset + 1)
                    .unwrap_or(0);
                inner.positions.insert(tp.clone(), resume);
            }
        }
        let handler = self.lock().handler.clone();
        if let Some(handler) = handler {
            handler.on_partitions_assigned(tps).await;
        }
        self.broker.notify.notify_waiters();
    }

    /// Takes partitions away. The handler runs before the assignment is
    /// dropped, so the consumer can flush commits first.
    pub async fn revoke(&self, tps: &[TopicPartition]) {
        let handler = self.lock().handler.clone();
        if let Some(handler) = handler {
            handler.on_partitions_revoked(tps).await;
        }
        let mut inner = self.lock();
        inner.assignment.retain(|tp| !tps.contains(tp));
        for tp in tps {
            inner.positions.remove(tp);
        }
    }
}

#[async_trait]
impl ConsumerDriver for MemoryConsumerDriver {
    async fn subscribe(
        &self,
        topics: &[String],
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<(), DriverError> {
        self.lock().handler = Some(handler);
        let tps: Vec<TopicPartition> = topics
            .iter()
            .flat_map(|topic| self.broker.partitions(topic))
            .collect();
        self.assign(&tps).await;
        Ok(())
    }

    async fn recv(&self) -> Result<Message, DriverError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(DriverError::Closed);
            }
            let mut notified = std::pin::pin!(self.broker.notify.notified());
            notified.as_mut().enable();
            if let Some(message) = self.poll_assigned() {
                return Ok(message);
            }
            notified.await;
        }
    }

    async fn commit(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), DriverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::Closed);
        }
        self.broker.commit(&self.group, offsets);
        Ok(())
    }

    async fn committed_offset(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError> {
        Ok(self.broker.committed(&self.group, tp))
    }

    async fn topic_metadata(&self, _topic: &str) -> Result<String, DriverError> {
        Ok(String::new())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::Release);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

pub struct MemoryProducerDriver {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl ProducerDriver for MemoryProducerDriver {
    fn send(&self, record: ProducerRecord) -> Result<Delivery, DriverError> {
        let metadata =
            self.broker
                .produce(&record.topic, record.partition, record.key, record.value);
        Ok(Delivery::resolved(metadata))
    }

    async fn flush(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Transport bound to an in-process broker.
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
        }
    }

    pub fn with_broker(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Like [`Transport::create_consumer`], but also hands back the driver so
    /// callers can steer rebalances.
    pub fn create_consumer_with_driver(
        &self,
        options: ConsumerOptions,
        processor: Arc<dyn StreamProcessor>,
    ) -> (Consumer, Arc<MemoryConsumerDriver>) {
        let driver = Arc::new(MemoryConsumerDriver::new(
            self.broker.clone(),
            options.group_id.clone(),
        ));
        let consumer = Consumer::new(driver.clone(), options, processor);
        (consumer, driver)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn create_consumer(
        &self,
        options: ConsumerOptions,
        processor: Arc<dyn StreamProcessor>,
    ) -> Result<Consumer, DriverError> {
        let (consumer, _) = self.create_consumer_with_driver(options, processor);
        Ok(consumer)
    }

    fn create_producer(&self) -> Result<Producer, DriverError> {
        Ok(Producer::new(Arc::new(MemoryProducerDriver {
            broker: self.broker.clone(),
        })))
    }

    async fn read_to_end(&self, topic: &str) -> Result<Vec<Message>, DriverError> {
        Ok(self.broker.read_to_end(topic))
    }
}
