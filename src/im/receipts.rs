//! Read-Receipt Tracker
//!
//! Records reads idempotently and tells the original sender. An
//! online sender hears about it immediately through the receipt bus
//! topic; an offline sender finds the receipt in their offline queue
//! on reconnect, same as any other message.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use super::error::ImError;
use super::presence::PresenceRegistry;
use super::repository::ReceiptRepository;
use super::types::{OfflineMessageEvent, PayloadKind, ReadReceipt, ReadReceiptEvent};
use crate::bus::{BusProducer, topics};

pub struct ReadReceiptTracker {
    receipts: Arc<dyn ReceiptRepository>,
    presence: Arc<PresenceRegistry>,
    producer: Arc<dyn BusProducer>,
}

impl ReadReceiptTracker {
    pub fn new(
        receipts: Arc<dyn ReceiptRepository>,
        presence: Arc<PresenceRegistry>,
        producer: Arc<dyn BusProducer>,
    ) -> Self {
        Self {
            receipts,
            presence,
            producer,
        }
    }

    /// Record a read and notify the sender. Idempotent on
    /// (msg_id, reader, device): repeat calls change nothing and
    /// publish nothing.
    pub async fn mark_read(&self, receipt: ReadReceipt) -> Result<(), ImError> {
        if receipt.msg_id.is_empty() {
            return Err(ImError::Validation("msg_id is required".into()));
        }
        if receipt.reader_id == 0 || receipt.sender_id == 0 {
            return Err(ImError::Validation("reader and sender are required".into()));
        }
        if receipt.device_id.is_empty() {
            return Err(ImError::Validation("device_id is required".into()));
        }

        let first = self.receipts.upsert(&receipt).await?;
        if !first {
            debug!(msg_id = %receipt.msg_id, reader = receipt.reader_id, "Duplicate read receipt");
            return Ok(());
        }

        let event = ReadReceiptEvent {
            msg_id: receipt.msg_id.clone(),
            reader_id: receipt.reader_id,
            device_id: receipt.device_id.clone(),
            sender_id: receipt.sender_id,
            conv_id: receipt.conv_id.clone(),
            conv_type: receipt.conv_type,
            read_at: receipt.read_at,
        };
        let payload = serde_json::to_vec(&event).map_err(|e| ImError::System(e.to_string()))?;

        let sender_online = !self.presence.lookup(receipt.sender_id).await?.is_empty();
        if sender_online {
            self.producer
                .publish(
                    topics::READ_RECEIPT_EVENTS,
                    &receipt.sender_id.to_string(),
                    &payload,
                )
                .await?;
        } else {
            // Same offline mechanism as chat: delivered on reconnect
            let offline = OfflineMessageEvent {
                msg_id: format!("receipt:{}:{}", receipt.msg_id, receipt.reader_id),
                recipient: receipt.sender_id,
                sender: receipt.reader_id,
                conv_id: receipt.conv_id.clone(),
                conv_type: receipt.conv_type,
                kind: PayloadKind::Receipt,
                content: String::from_utf8_lossy(&payload).into_owned(),
                seq: 0,
                ts: Utc::now(),
            };
            let offline_payload =
                serde_json::to_vec(&offline).map_err(|e| ImError::System(e.to_string()))?;
            self.producer
                .publish(
                    topics::OFFLINE_MSG,
                    &offline.partition_key(),
                    &offline_payload,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn receipts_for(&self, msg_id: &str) -> Result<Vec<ReadReceipt>, ImError> {
        self.receipts.for_message(msg_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::{BusConsumer, MemoryBus};
    use crate::im::registry::MemoryRegistry;
    use crate::im::repository::memory::MemoryReceiptRepository;
    use crate::im::types::ConvScope;

    fn receipt(msg_id: &str, reader: u64, device: &str, sender: u64) -> ReadReceipt {
        ReadReceipt {
            msg_id: msg_id.to_string(),
            reader_id: reader,
            device_id: device.to_string(),
            sender_id: sender,
            conv_id: "1:2".into(),
            conv_type: ConvScope::Private,
            read_at: Utc::now(),
        }
    }

    fn tracker() -> (ReadReceiptTracker, Arc<PresenceRegistry>, Arc<MemoryBus>) {
        let bus = MemoryBus::new();
        let presence = Arc::new(PresenceRegistry::new(
            Arc::new(MemoryRegistry::new()),
            Duration::from_secs(90),
        ));
        let tracker = ReadReceiptTracker::new(
            Arc::new(MemoryReceiptRepository::default()),
            presence.clone(),
            bus.clone(),
        );
        (tracker, presence, bus)
    }

    #[tokio::test]
    async fn test_online_sender_gets_bus_event() {
        let (tracker, presence, bus) = tracker();
        presence.register(1, "ios", "gw-a").await.unwrap();
        let consumer = bus.consumer(topics::READ_RECEIPT_EVENTS);

        tracker.mark_read(receipt("m1", 2, "web", 1)).await.unwrap();

        let records = consumer.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(records.len(), 1);
        let event: ReadReceiptEvent = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(event.reader_id, 2);
        assert_eq!(event.sender_id, 1);
    }

    #[tokio::test]
    async fn test_offline_sender_gets_offline_event() {
        let (tracker, _presence, bus) = tracker();
        let receipts = bus.consumer(topics::READ_RECEIPT_EVENTS);
        let offline = bus.consumer(topics::OFFLINE_MSG);

        tracker.mark_read(receipt("m1", 2, "web", 1)).await.unwrap();

        assert!(receipts.poll_batch(10, Duration::ZERO).await.unwrap().is_empty());
        let records = offline.poll_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(records.len(), 1);
        let event: OfflineMessageEvent = serde_json::from_slice(&records[0].payload).unwrap();
        assert_eq!(event.kind, PayloadKind::Receipt);
        assert_eq!(event.recipient, 1);
    }

    #[tokio::test]
    async fn test_mark_read_idempotent() {
        let (tracker, presence, bus) = tracker();
        presence.register(1, "ios", "gw-a").await.unwrap();
        let consumer = bus.consumer(topics::READ_RECEIPT_EVENTS);

        tracker.mark_read(receipt("m1", 2, "web", 1)).await.unwrap();
        tracker.mark_read(receipt("m1", 2, "web", 1)).await.unwrap();
        tracker.mark_read(receipt("m1", 2, "web", 1)).await.unwrap();

        // One stored receipt, one published event
        assert_eq!(tracker.receipts_for("m1").await.unwrap().len(), 1);
        assert_eq!(consumer.poll_batch(10, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_devices_are_distinct_receipts() {
        let (tracker, _presence, _bus) = tracker();
        tracker.mark_read(receipt("m1", 2, "web", 1)).await.unwrap();
        tracker.mark_read(receipt("m1", 2, "ios", 1)).await.unwrap();
        assert_eq!(tracker.receipts_for("m1").await.unwrap().len(), 2);
    }
}
