use std::ops::Deref;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use crate::types::{Message, TopicPartition};

/// Posted on the consumer's release channel when the last handle to an
/// in-flight message drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Release {
    pub tp: TopicPartition,
    pub offset: i64,
}

/// Counted handle to an in-flight message.
///
/// The stream processor receives one per delivered message and clones it into
/// whatever derived work the message spawns. When the last clone drops, the
/// owning consumer is notified and the offset becomes eligible for acking.
/// Explicit ack bookkeeping is never needed on the processor side.
#[derive(Clone)]
pub struct MessageHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    message: Message,
    tp: TopicPartition,
    releases: mpsc::UnboundedSender<Release>,
}

impl MessageHandle {
    pub(crate) fn new(message: Message, releases: mpsc::UnboundedSender<Release>) -> Self {
        let tp = message.tp();
        Self {
            inner: Arc::new(HandleInner {
                message,
                tp,
                releases,
            }),
        }
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn tp(&self) -> &TopicPartition {
        &self.inner.tp
    }

    pub fn offset(&self) -> i64 {
        self.inner.message.offset
    }

    pub(crate) fn downgrade(&self) -> MessageRef {
        MessageRef {
            tp: self.inner.tp.clone(),
            offset: self.inner.message.offset,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Deref for MessageHandle {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.inner.message
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // The consumer may already be gone on shutdown; the release is then
        // moot and the send error ignored.
        drop(self.releases.send(Release {
            tp: self.tp.clone(),
            offset: self.message.offset,
        }));
    }
}

/// Weak view of an in-flight message, kept by the consumer for introspection.
/// Remembers the partition and offset even after the message itself is gone.
pub(crate) struct MessageRef {
    pub tp: TopicPartition,
    #[allow(dead_code)]
    pub offset: i64,
    inner: Weak<HandleInner>,
}

impl MessageRef {
    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(offset: i64) -> Message {
        Message {
            topic: "t".into(),
            partition: 0,
            offset,
            key: None,
            value: None,
        }
    }

    #[tokio::test]
    async fn release_fires_once_when_last_clone_drops() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = MessageHandle::new(message(7), tx);
        let derived = handle.clone();
        let more = derived.clone();

        drop(handle);
        drop(derived);
        assert!(rx.try_recv().is_err());

        drop(more);
        let release = rx.try_recv().expect("release after last drop");
        assert_eq!(release.offset, 7);
        assert_eq!(release.tp, TopicPartition::new("t", 0));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn weak_ref_observes_liveness() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = MessageHandle::new(message(0), tx);
        let weak = handle.downgrade();
        assert!(!weak.is_released());
        drop(handle);
        assert!(weak.is_released());
    }
}
