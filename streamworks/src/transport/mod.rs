use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use envconfig::Envconfig;
use thiserror::Error;

use crate::config::{KafkaConfig, RuntimeConfig};
use crate::consumer::{Consumer, ConsumerOptions, StreamProcessor};
use crate::producer::{Delivery, Producer};
use crate::types::{Message, OffsetAndMetadata, ProducerRecord, TopicPartition};

pub mod kafka;
pub mod memory;

/// Errors surfaced by broker drivers.
///
/// Transient errors are retried by the commit loop at its next tick; fatal
/// errors tear the consumer down.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transient driver error: {0}")]
    Transient(String),
    #[error("fatal driver error: {0}")]
    Fatal(String),
    #[error("driver closed")]
    Closed,
}

impl DriverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Fatal(_) | DriverError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no transport registered for scheme {0:?}")]
    UnknownScheme(String),
    #[error("invalid broker url {0:?}")]
    InvalidUrl(String),
    #[error("failed to load driver configuration: {0}")]
    Config(#[from] envconfig::Error),
}

/// Callbacks a driver fires around consumer-group partition moves. Revocation
/// returns only after the handler is done, so the consumer gets to flush its
/// commits before the broker hands the partitions elsewhere.
#[async_trait]
pub trait RebalanceHandler: Send + Sync {
    async fn on_partitions_revoked(&self, tps: &[TopicPartition]);
    async fn on_partitions_assigned(&self, tps: &[TopicPartition]);
}

/// The contract this crate requires from a broker's consumer side. Offsets
/// cross this boundary in inclusive processed form ("everything at or below
/// N is done"); drivers translate to their broker's own convention.
#[async_trait]
pub trait ConsumerDriver: Send + Sync {
    async fn subscribe(
        &self,
        topics: &[String],
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<(), DriverError>;

    /// Next message from any assigned partition; within a partition,
    /// delivery is in offset order.
    async fn recv(&self) -> Result<Message, DriverError>;

    async fn commit(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), DriverError>;

    /// The durably committed offset for this consumer group, if any.
    async fn committed_offset(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError>;

    /// Opaque per-topic metadata, forwarded verbatim with commits.
    async fn topic_metadata(&self, topic: &str) -> Result<String, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}

/// The contract this crate requires from a broker's producer side.
#[async_trait]
pub trait ProducerDriver: Send + Sync {
    /// Accepts the record into the transmission queue. The returned delivery
    /// resolves once the broker acknowledges durability.
    fn send(&self, record: ProducerRecord) -> Result<Delivery, DriverError>;

    async fn flush(&self) -> Result<(), DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}

/// Factory binding a broker to consumer/producer pairs. The transport is the
/// only place that knows which driver backs a URL.
impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Transport").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn create_consumer(
        &self,
        options: ConsumerOptions,
        processor: Arc<dyn StreamProcessor>,
    ) -> Result<Consumer, DriverError>;

    fn create_producer(&self) -> Result<Producer, DriverError>;

    /// Replays a topic from its earliest offset to the current end of log.
    /// Table recovery runs on this before serving reads.
    async fn read_to_end(&self, topic: &str) -> Result<Vec<Message>, DriverError>;
}

/// Resolves the configured broker URL to a transport by scheme.
pub fn by_url(config: &RuntimeConfig) -> Result<Arc<dyn Transport>, TransportError> {
    let (scheme, rest) = config
        .broker_url
        .split_once("://")
        .ok_or_else(|| TransportError::InvalidUrl(config.broker_url.clone()))?;
    match scheme {
        "kafka" => {
            let kafka = KafkaConfig::init_from_env()?;
            Ok(Arc::new(kafka::KafkaTransport::new(
                config.clone(),
                kafka,
                rest.to_owned(),
            )))
        }
        "memory" => Ok(Arc::new(memory::MemoryTransport::new())),
        other => Err(TransportError::UnknownScheme(other.to_owned())),
    }
}
