use async_trait::async_trait;
use metrics::counter;

use crate::types::{Message, TopicPartition};

/// Observer hooks for the message lifecycle.
///
/// `on_message_in` fires after a message was tracked and before the stream
/// processor sees it. `on_message_out` fires once the offset was acked,
/// drained off the consumer's recently-acked queue by a dedicated task so
/// that slow sensor sinks never stall commits.
#[async_trait]
pub trait Sensors: Send + Sync {
    async fn on_message_in(
        &self,
        consumer_id: usize,
        tp: &TopicPartition,
        offset: i64,
        message: &Message,
    );

    async fn on_message_out(&self, consumer_id: usize, tp: &TopicPartition, offset: i64);
}

/// Default sensor sink: exports the message flow as counters.
#[derive(Default)]
pub struct MetricsSensors;

#[async_trait]
impl Sensors for MetricsSensors {
    async fn on_message_in(
        &self,
        _consumer_id: usize,
        tp: &TopicPartition,
        _offset: i64,
        _message: &Message,
    ) {
        counter!("stream_messages_in_total", "topic" => tp.topic.clone()).increment(1);
    }

    async fn on_message_out(&self, _consumer_id: usize, tp: &TopicPartition, _offset: i64) {
        counter!("stream_messages_out_total", "topic" => tp.topic.clone()).increment(1);
    }
}
