//! Kafka-backed bus
//!
//! Producer publishes with the record key carrying the partition
//! routing; consumer runs in a consumer group with auto-commit off
//! and commits its position only when the caller says so.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};

use super::{BusConsumer, BusError, BusProducer, BusRecord};

pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            // Partition-local FIFO requires no in-flight reordering
            .set("max.in.flight.requests.per.connection", "1")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl BusProducer for KafkaProducer {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        self.producer
            .send(
                FutureRecord::to(topic).key(key).payload(payload),
                Duration::from_secs(5),
            )
            .await
            .map_err(|(e, _)| BusError::Publish(e.to_string()))?;
        Ok(())
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(brokers: &str, group_id: &str, topic: &str) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BusError::Consume(e.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BusError::Consume(e.to_string()))?;
        tracing::info!(topic, group_id, "Kafka consumer subscribed");
        Ok(Self { consumer })
    }
}

#[async_trait]
impl BusConsumer for KafkaConsumer {
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<BusRecord>, BusError> {
        let mut batch = Vec::with_capacity(max);
        let deadline = tokio::time::Instant::now() + timeout;

        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(m)) => {
                    batch.push(BusRecord {
                        topic: m.topic().to_string(),
                        partition: m.partition(),
                        offset: m.offset(),
                        key: m
                            .key()
                            .map(|k| String::from_utf8_lossy(k).into_owned())
                            .unwrap_or_default(),
                        payload: m.payload().map(|p| p.to_vec()).unwrap_or_default(),
                    });
                }
                Ok(Err(e)) => return Err(BusError::Consume(e.to_string())),
                // Timed out waiting; return what we have
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn commit(&self) -> Result<(), BusError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| BusError::Commit(e.to_string()))
    }
}
