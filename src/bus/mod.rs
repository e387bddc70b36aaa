//! Bus - partitioned, at-least-once, ordered-per-partition messaging
//!
//! Producers choose a partition by key; consumers in a group pull
//! batches and commit offsets only after their durable side effects
//! land. Redelivery after a crash is expected; every consumer in this
//! repo is idempotent.
//!
//! Two implementations:
//! - [`kafka`] - production, over rdkafka with manual offset commit.
//! - [`memory`] - per-partition FIFO queues for tests; uncommitted
//!   reads can be rewound to simulate redelivery.

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaConsumer, KafkaProducer};
pub use memory::MemoryBus;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Topic names. Keys are listed next to each topic because ordering
/// guarantees only hold per partition, i.e. per key.
pub mod topics {
    /// Pending orders from successful deducts; key = user_id
    pub const ORDER_EVENTS: &str = "order_events";
    /// Group messages awaiting member fan-out; key = group_id
    pub const GROUP_MSG: &str = "group_msg";
    /// Messages for offline recipients; key = recipient user_id
    pub const OFFLINE_MSG: &str = "offline_msg";
    /// Group membership changes; key = group_id
    pub const MEMBERSHIP_CHANGE: &str = "membership_change";
    /// Read receipts toward the original sender; key = sender user_id
    pub const READ_RECEIPT_EVENTS: &str = "read_receipt_events";
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(String),

    #[error("bus consume failed: {0}")]
    Consume(String),

    #[error("bus commit failed: {0}")]
    Commit(String),
}

/// One consumed record. `payload` is the serialized event; consumers
/// own the bytes so commit can happen after the batch is processed.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Publish one record. Resolves when the bus has acknowledged the
    /// write - this is the commit point for callers that treat a
    /// publish as transactional.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError>;
}

#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Pull up to `max` records, waiting at most `timeout` for the
    /// first one. Order within a partition is FIFO.
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BusRecord>, BusError>;

    /// Commit everything returned by prior polls. Records polled but
    /// not committed are redelivered after a restart.
    async fn commit(&self) -> Result<(), BusError>;
}
