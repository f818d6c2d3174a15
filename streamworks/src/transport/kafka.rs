use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use health::HealthHandle;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer as _, ConsumerContext, Rebalance};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use super::{
    ConsumerDriver, DriverError, ProducerDriver, RebalanceHandler, Transport,
};
use crate::config::{KafkaConfig, RuntimeConfig};
use crate::consumer::{Consumer, ConsumerOptions, StreamProcessor};
use crate::producer::{Delivery, Producer};
use crate::types::{Message, OffsetAndMetadata, ProducerRecord, RecordMetadata, TopicPartition};

const BROKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps librdkafka errors onto the retry policy: a handful of conditions are
/// hopeless, everything else is worth another tick.
fn classify(err: KafkaError) -> DriverError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::UnsupportedVersion,
        ) => DriverError::Fatal(err.to_string()),
        _ => DriverError::Transient(err.to_string()),
    }
}

fn join_error(err: tokio::task::JoinError) -> DriverError {
    DriverError::Transient(format!("broker call aborted: {err}"))
}

/// Client context shared by the drivers: reports liveness when librdkafka's
/// poll loop emits statistics, and forwards rebalance events to the handler
/// registered at subscribe time.
pub struct StreamClientContext {
    liveness: Option<HealthHandle>,
    rebalance: RwLock<Option<Arc<dyn RebalanceHandler>>>,
}

impl StreamClientContext {
    fn new(liveness: Option<HealthHandle>) -> Self {
        Self {
            liveness,
            rebalance: RwLock::new(None),
        }
    }

    fn set_rebalance_handler(&self, handler: Arc<dyn RebalanceHandler>) {
        *self
            .rebalance
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn dispatch(&self, revoked: bool, tps: Vec<TopicPartition>) {
        let handler = self
            .rebalance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else { return };
        let fut = async move {
            if revoked {
                handler.on_partitions_revoked(&tps).await;
            } else {
                handler.on_partitions_assigned(&tps).await;
            }
        };
        // Rebalance callbacks fire from inside the consumer poll. Block the
        // calling thread until the handler is done, so revoked partitions
        // are flushed before the broker hands them elsewhere.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
            Err(_) => futures::executor::block_on(fut),
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

impl rdkafka::ClientContext for StreamClientContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }
    }
}

impl ConsumerContext for StreamClientContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            self.dispatch(true, partitions_of(tpl));
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => self.dispatch(false, partitions_of(tpl)),
            Rebalance::Revoke(_) => {}
            Rebalance::Error(err) => warn!("rebalance error: {err}"),
        }
    }
}

pub struct KafkaConsumerDriver {
    consumer: Arc<StreamConsumer<StreamClientContext>>,
}

#[async_trait]
impl ConsumerDriver for KafkaConsumerDriver {
    async fn subscribe(
        &self,
        topics: &[String],
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<(), DriverError> {
        self.consumer.context().set_rebalance_handler(handler);
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(classify)
    }

    async fn recv(&self) -> Result<Message, DriverError> {
        let message = self.consumer.recv().await.map_err(classify)?;
        Ok(Message {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            value: message.payload().map(Bytes::copy_from_slice),
        })
    }

    async fn commit(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), DriverError> {
        let mut tpl = TopicPartitionList::new();
        for (tp, oam) in offsets {
            // The broker tracks the next offset to read; the core speaks in
            // inclusive processed offsets.
            tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(oam.offset + 1))
                .map_err(classify)?;
        }
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(join_error)?
            .map_err(classify)
    }

    async fn committed_offset(&self, tp: &TopicPartition) -> Result<Option<i64>, DriverError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&tp.topic, tp.partition);
        let consumer = self.consumer.clone();
        let committed = tokio::task::spawn_blocking(move || {
            consumer.committed_offsets(tpl, BROKER_TIMEOUT)
        })
        .await
        .map_err(join_error)?
        .map_err(classify)?;
        Ok(committed.elements().first().and_then(|elem| {
            match elem.offset() {
                // A stored position of n means everything below n is done.
                Offset::Offset(n) if n > 0 => Some(n - 1),
                _ => None,
            }
        }))
    }

    async fn topic_metadata(&self, _topic: &str) -> Result<String, DriverError> {
        // Commit metadata is opaque to the broker; nothing to attach here.
        Ok(String::new())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

pub struct KafkaProducerDriver {
    producer: FutureProducer<StreamClientContext>,
}

#[async_trait]
impl ProducerDriver for KafkaProducerDriver {
    fn send(&self, record: ProducerRecord) -> Result<Delivery, DriverError> {
        let (slot, delivery) = Delivery::pending();
        let ack = self
            .producer
            .send_result(FutureRecord {
                topic: &record.topic,
                partition: record.partition,
                payload: record.value.as_deref(),
                key: record.key.as_deref(),
                timestamp: None,
                headers: None,
            })
            .map_err(|(err, _)| classify(err))?;
        tokio::spawn(async move {
            match ack.await {
                Ok(Ok((partition, offset))) => {
                    slot.resolve(Ok(RecordMetadata { partition, offset }));
                }
                Ok(Err((err, _))) => slot.resolve(Err(classify(err))),
                Err(_) => {
                    // Cancelled due to timeout while retrying
                    slot.resolve(Err(DriverError::Transient(
                        "delivery canceled before broker ack".to_owned(),
                    )));
                }
            }
        });
        Ok(delivery)
    }

    async fn flush(&self) -> Result<(), DriverError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Duration::from_secs(30)))
            .await
            .map_err(join_error)?
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.flush().await
    }
}

/// Transport bound to a Kafka cluster, resolved from `kafka://` URLs.
pub struct KafkaTransport {
    app: RuntimeConfig,
    kafka: KafkaConfig,
    hosts: String,
    liveness: Option<HealthHandle>,
}

impl KafkaTransport {
    pub fn new(app: RuntimeConfig, kafka: KafkaConfig, hosts: String) -> Self {
        Self {
            app,
            kafka,
            hosts,
            liveness: None,
        }
    }

    /// Drivers created after this report liveness through the handle on
    /// every statistics callback.
    pub fn liveness(mut self, handle: HealthHandle) -> Self {
        self.liveness = Some(handle);
        self
    }

    fn base_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.hosts)
            .set("statistics.interval.ms", "10000");
        if self.kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }

    fn consumer_for_group(
        &self,
        group_id: &str,
    ) -> Result<StreamConsumer<StreamClientContext>, DriverError> {
        let mut client_config = self.base_config();
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.kafka.kafka_offset_reset);
        debug!("rdkafka consumer configuration: {:?}", client_config);
        client_config
            .create_with_context(StreamClientContext::new(self.liveness.clone()))
            .map_err(classify)
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn create_consumer(
        &self,
        options: ConsumerOptions,
        processor: Arc<dyn StreamProcessor>,
    ) -> Result<Consumer, DriverError> {
        let consumer = self.consumer_for_group(&options.group_id)?;
        let driver = Arc::new(KafkaConsumerDriver {
            consumer: Arc::new(consumer),
        });
        Ok(Consumer::new(driver, options, processor))
    }

    fn create_producer(&self) -> Result<Producer, DriverError> {
        let mut client_config = self.base_config();
        client_config
            .set(
                "linger.ms",
                self.kafka.kafka_producer_linger_ms.to_string(),
            )
            .set(
                "message.timeout.ms",
                self.kafka.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                self.kafka.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (self.kafka.kafka_producer_queue_mib * 1024).to_string(),
            );
        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer<StreamClientContext> = client_config
            .create_with_context(StreamClientContext::new(self.liveness.clone()))
            .map_err(classify)?;
        Ok(Producer::new(Arc::new(KafkaProducerDriver { producer })))
    }

    /// Replays a topic front to back with a throwaway assigned consumer; the
    /// table recovery path runs on this before serving reads.
    async fn read_to_end(&self, topic: &str) -> Result<Vec<Message>, DriverError> {
        let group_id = format!("{}-recovery", self.app.app_id);
        let consumer = Arc::new(self.consumer_for_group(&group_id)?);

        let ends: HashMap<i32, i64> = {
            let consumer = consumer.clone();
            let topic = topic.to_owned();
            tokio::task::spawn_blocking(move || -> Result<HashMap<i32, i64>, DriverError> {
                let metadata = consumer
                    .fetch_metadata(Some(&topic), BROKER_TIMEOUT)
                    .map_err(classify)?;
                let Some(topic_metadata) = metadata
                    .topics()
                    .iter()
                    .find(|candidate| candidate.name() == topic)
                else {
                    return Ok(HashMap::new());
                };
                let mut tpl = TopicPartitionList::new();
                let mut ends = HashMap::new();
                for partition in topic_metadata.partitions() {
                    let (_low, high) = consumer
                        .fetch_watermarks(&topic, partition.id(), BROKER_TIMEOUT)
                        .map_err(classify)?;
                    if high > 0 {
                        ends.insert(partition.id(), high);
                        tpl.add_partition_offset(&topic, partition.id(), Offset::Beginning)
                            .map_err(classify)?;
                    }
                }
                if !ends.is_empty() {
                    consumer.assign(&tpl).map_err(classify)?;
                }
                Ok(ends)
            })
            .await
            .map_err(join_error)??
        };

        let mut remaining = ends;
        let mut out = Vec::new();
        while !remaining.is_empty() {
            let message = consumer.recv().await.map_err(classify)?;
            let partition = message.partition();
            let offset = message.offset();
            out.push(Message {
                topic: message.topic().to_owned(),
                partition,
                offset,
                key: message.key().map(Bytes::copy_from_slice),
                value: message.payload().map(Bytes::copy_from_slice),
            });
            if let Some(&end) = remaining.get(&partition) {
                if offset + 1 >= end {
                    remaining.remove(&partition);
                }
            }
        }
        consumer.unsubscribe();
        info!(topic, records = out.len(), "replayed topic to end of log");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_classified() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert!(classify(err).is_fatal());

        let err = KafkaError::MessageProduction(RDKafkaErrorCode::BrokerNotAvailable);
        assert!(!classify(err).is_fatal());
    }
}
