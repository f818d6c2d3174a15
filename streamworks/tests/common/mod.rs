use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use streamworks::consumer::{ConsumerOptions, StreamProcessor};
use streamworks::message::MessageHandle;
use streamworks::sensors::Sensors;
use streamworks::transport::memory::MemoryBroker;
use streamworks::transport::{ConsumerDriver, DriverError, RebalanceHandler};
use streamworks::types::{Message, OffsetAndMetadata, TopicPartition};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        drop(
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "warn".into()),
                )
                .try_init(),
        );
    });
}

/// Sensor sink recording the lifecycle events it sees, in order. Processors
/// built by [`recording_processor`] append to the same log so tests can
/// assert cross-hook ordering.
#[derive(Default)]
pub struct RecordingSensors {
    events: Mutex<Vec<(String, TopicPartition, i64)>>,
}

impl RecordingSensors {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, kind: &str, tp: &TopicPartition, offset: i64) {
        self.events
            .lock()
            .unwrap()
            .push((kind.to_owned(), tp.clone(), offset));
    }

    pub fn events(&self) -> Vec<(String, TopicPartition, i64)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| k == kind)
            .count()
    }
}

#[async_trait]
impl Sensors for RecordingSensors {
    async fn on_message_in(
        &self,
        _consumer_id: usize,
        tp: &TopicPartition,
        offset: i64,
        _message: &Message,
    ) {
        self.record("in", tp, offset);
    }

    async fn on_message_out(&self, _consumer_id: usize, tp: &TopicPartition, offset: i64) {
        self.record("out", tp, offset);
    }
}

/// Processor that drops every handle as soon as the callback returns, the
/// immediate-release case.
pub struct DropProcessor;

#[async_trait]
impl StreamProcessor for DropProcessor {
    async fn on_message(&self, _message: MessageHandle) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Processor that parks message handles so the test controls release order,
/// standing in for derived work of varying lifetime.
pub struct HoldProcessor {
    /// Offsets to park; `None` parks everything.
    hold: Option<Vec<i64>>,
    held: Mutex<HashMap<i64, MessageHandle>>,
}

impl HoldProcessor {
    pub fn holding(offsets: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            hold: Some(offsets.to_vec()),
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn holding_all() -> Arc<Self> {
        Arc::new(Self {
            hold: None,
            held: Mutex::new(HashMap::new()),
        })
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Drops the parked handle for an offset, releasing the message.
    pub fn release(&self, offset: i64) {
        self.held.lock().unwrap().remove(&offset);
    }
}

#[async_trait]
impl StreamProcessor for HoldProcessor {
    async fn on_message(&self, message: MessageHandle) -> anyhow::Result<()> {
        let offset = message.offset();
        let park = match &self.hold {
            Some(offsets) => offsets.contains(&offset),
            None => true,
        };
        if park {
            self.held.lock().unwrap().insert(offset, message);
        }
        Ok(())
    }
}

/// Processor that records its invocation into the shared sensor log before
/// dropping the handle.
pub struct CallbackRecorder {
    sensors: Arc<RecordingSensors>,
}

pub fn recording_processor(sensors: Arc<RecordingSensors>) -> Arc<CallbackRecorder> {
    Arc::new(CallbackRecorder { sensors })
}

#[async_trait]
impl StreamProcessor for CallbackRecorder {
    async fn on_message(&self, message: MessageHandle) -> anyhow::Result<()> {
        self.sensors
            .record("callback", message.tp(), message.offset());
        Ok(())
    }
}

/// Driver whose receive path fails fatally, for exercising the autonomous
/// collapse to Stopped. Records the commits and the close it sees.
#[derive(Default)]
pub struct FatalRecvDriver {
    committed: Mutex<HashMap<TopicPartition, i64>>,
    closed: AtomicBool,
}

impl FatalRecvDriver {
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.committed.lock().unwrap().get(tp).copied()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ConsumerDriver for FatalRecvDriver {
    async fn subscribe(
        &self,
        _topics: &[String],
        _handler: Arc<dyn RebalanceHandler>,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn recv(&self) -> Result<Message, DriverError> {
        Err(DriverError::Fatal("broker connection lost".to_owned()))
    }

    async fn commit(
        &self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<(), DriverError> {
        let mut committed = self.committed.lock().unwrap();
        for (tp, oam) in offsets {
            committed.insert(tp.clone(), oam.offset);
        }
        Ok(())
    }

    async fn committed_offset(&self, _tp: &TopicPartition) -> Result<Option<i64>, DriverError> {
        Ok(None)
    }

    async fn topic_metadata(&self, _topic: &str) -> Result<String, DriverError> {
        Ok(String::new())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

pub fn options(topics: &[&str], sensors: Arc<RecordingSensors>) -> ConsumerOptions {
    ConsumerOptions::new("test-group", topics.iter().map(|t| t.to_string()).collect())
        // Long enough that only explicit maybe_commit calls advance, unless
        // a test opts into the loop.
        .commit_interval(Duration::from_secs(600))
        .sensors(sensors)
}

pub fn produce_values(broker: &MemoryBroker, topic: &str, count: usize) {
    for i in 0..count {
        broker.produce(
            topic,
            Some(0),
            None,
            Some(bytes::Bytes::from(i.to_string())),
        );
    }
}

/// Polls an assertion into existence; the cooperative loops need a few
/// scheduler passes to drain releases and sensors.
pub async fn wait_until<F>(check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached within deadline");
}
