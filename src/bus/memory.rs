//! In-memory bus
//!
//! Fixed partition count, append-only per-partition logs, consumer
//! position vs committed offset kept separately so tests can rewind
//! an uncommitted consumer and observe at-least-once redelivery.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BusConsumer, BusError, BusProducer, BusRecord};

const DEFAULT_PARTITIONS: usize = 8;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

type PartitionLog = Mutex<Vec<StoredRecord>>;

pub struct MemoryBus {
    partitions: usize,
    topics: DashMap<String, Arc<Vec<PartitionLog>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Arc<Self> {
        Arc::new(Self {
            partitions: partitions.max(1),
            topics: DashMap::new(),
        })
    }

    fn topic_log(&self, topic: &str) -> Arc<Vec<PartitionLog>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                Arc::new((0..self.partitions).map(|_| Mutex::new(Vec::new())).collect())
            })
            .clone()
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions
    }

    /// Create a consumer starting at the beginning of the topic.
    pub fn consumer(self: &Arc<Self>, topic: &str) -> MemoryBusConsumer {
        let log = self.topic_log(topic);
        MemoryBusConsumer {
            topic: topic.to_string(),
            log,
            partitions: self.partitions,
            position: Mutex::new(vec![0; self.partitions]),
            committed: Mutex::new(vec![0; self.partitions]),
        }
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        let log = self.topic_log(topic);
        let partition = self.partition_for(key);
        log[partition]
            .lock()
            .expect("memory bus poisoned")
            .push(StoredRecord {
                key: key.to_string(),
                payload: payload.to_vec(),
            });
        Ok(())
    }
}

pub struct MemoryBusConsumer {
    topic: String,
    log: Arc<Vec<PartitionLog>>,
    partitions: usize,
    position: Mutex<Vec<usize>>,
    committed: Mutex<Vec<usize>>,
}

impl MemoryBusConsumer {
    /// Simulate a consumer restart: the position falls back to the
    /// last committed offsets and uncommitted records redeliver.
    pub fn rewind_to_committed(&self) {
        let committed = self.committed.lock().expect("memory bus poisoned").clone();
        *self.position.lock().expect("memory bus poisoned") = committed;
    }
}

#[async_trait]
impl BusConsumer for MemoryBusConsumer {
    async fn poll_batch(&self, max: usize, _timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        let mut batch = Vec::new();
        let mut position = self.position.lock().expect("memory bus poisoned");
        'outer: for p in 0..self.partitions {
            let log = self.log[p].lock().expect("memory bus poisoned");
            while position[p] < log.len() {
                if batch.len() >= max {
                    break 'outer;
                }
                let record = &log[position[p]];
                batch.push(BusRecord {
                    topic: self.topic.clone(),
                    partition: p as i32,
                    offset: position[p] as i64,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                });
                position[p] += 1;
            }
        }
        Ok(batch)
    }

    async fn commit(&self) -> Result<(), BusError> {
        let position = self.position.lock().expect("memory bus poisoned").clone();
        *self.committed.lock().expect("memory bus poisoned") = position;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partition_fifo() {
        let bus = MemoryBus::with_partitions(4);
        let consumer = bus.consumer("t");

        for i in 0..10 {
            bus.publish("t", "same-key", format!("m{i}").as_bytes())
                .await
                .unwrap();
        }

        let batch = consumer.poll_batch(100, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 10);
        // One key -> one partition -> production order preserved
        for (i, record) in batch.iter().enumerate() {
            assert_eq!(record.payload, format!("m{i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn test_uncommitted_records_redeliver() {
        let bus = MemoryBus::with_partitions(2);
        let consumer = bus.consumer("t");

        bus.publish("t", "k", b"a").await.unwrap();
        bus.publish("t", "k", b"b").await.unwrap();

        let first = consumer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);

        // Crash before commit: both records come back
        consumer.rewind_to_committed();
        let again = consumer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 2);

        consumer.commit().await.unwrap();
        consumer.rewind_to_committed();
        let empty = consumer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert!(empty.is_empty());
    }
}
