use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::transport::{DriverError, ProducerDriver};
use crate::types::{ProducerRecord, RecordMetadata};

/// Resolves once the broker acknowledges durability of a produced record.
///
/// Returned by [`Producer::send`] so callers choose between fire-and-forget
/// (drop it, or watch it from a spawned task) and awaiting inline.
pub struct Delivery {
    rx: oneshot::Receiver<Result<RecordMetadata, DriverError>>,
}

impl Delivery {
    /// An unresolved delivery plus the slot a driver resolves it through.
    pub fn pending() -> (DeliverySlot, Delivery) {
        let (tx, rx) = oneshot::channel();
        (DeliverySlot { tx }, Delivery { rx })
    }

    /// A delivery that already carries its broker acknowledgement; used by
    /// drivers whose enqueue is synchronous.
    pub fn resolved(metadata: RecordMetadata) -> Delivery {
        let (slot, delivery) = Delivery::pending();
        slot.resolve(Ok(metadata));
        delivery
    }

    /// Waits for the broker acknowledgement.
    pub async fn wait(self) -> Result<RecordMetadata, DriverError> {
        match self.rx.await {
            Ok(result) => result,
            // The driver dropped the slot without resolving it.
            Err(_) => Err(DriverError::Closed),
        }
    }
}

pub struct DeliverySlot {
    tx: oneshot::Sender<Result<RecordMetadata, DriverError>>,
}

impl DeliverySlot {
    pub fn resolve(self, result: Result<RecordMetadata, DriverError>) {
        drop(self.tx.send(result));
    }
}

/// Send primitives over a producer driver.
///
/// No retry logic lives here; transient failures are the driver's business.
/// Callers hand over ready-made byte buffers, serialization happens upstream.
#[derive(Clone)]
pub struct Producer {
    driver: Arc<dyn ProducerDriver>,
}

impl Producer {
    pub fn new(driver: Arc<dyn ProducerDriver>) -> Self {
        Self { driver }
    }

    /// Enqueues a record for transmission and returns its delivery. The
    /// record is accepted into the producer queue when this returns; broker
    /// durability is what the delivery resolves on.
    pub fn send(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<Delivery, DriverError> {
        self.driver.send(ProducerRecord {
            topic: topic.to_owned(),
            partition: None,
            key,
            value,
        })
    }

    /// Sends and waits for the broker acknowledgement inline.
    pub async fn send_and_wait(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Result<RecordMetadata, DriverError> {
        self.send(topic, key, value)?.wait().await
    }

    pub async fn flush(&self) -> Result<(), DriverError> {
        self.driver.flush().await
    }

    pub async fn close(&self) -> Result<(), DriverError> {
        self.driver.close().await
    }
}
