//! Offset-tracking consumer core for partitioned, append-only message logs.
//!
//! Messages are delivered in offset order but finish out of order, because
//! each one fans out into derived work with its own lifetime. The consumer
//! tracks releases through counted message handles, folds acked offsets into
//! gap-aware per-partition sets, and periodically commits the longest
//! consecutive run back to the broker, so a restart resumes exactly where
//! processing actually got to. Tables mirror every mutation of a keyed view
//! onto a derived changelog topic and rebuild themselves by replay.
//!
//! Broker specifics stay behind the [`transport`] driver traits; `kafka://`
//! and `memory://` transports ship in-tree.

pub mod ackset;
pub mod config;
pub mod consumer;
pub mod message;
pub mod producer;
pub mod sensors;
pub mod stores;
pub mod table;
pub mod transport;
pub mod types;

pub use config::RuntimeConfig;
pub use consumer::{Consumer, ConsumerOptions, ConsumerState, StreamProcessor};
pub use message::MessageHandle;
pub use producer::{Delivery, Producer};
pub use table::{Table, TableSpec};
pub use types::{Message, TopicPartition};
