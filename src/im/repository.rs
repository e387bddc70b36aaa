//! Repository traits for IM data access
//!
//! Pg implementations are the production path; the `memory` module
//! provides single-process implementations for tests and local runs.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::error::ImError;
use super::types::{ConvScope, OfflineMessage, ReadReceipt};
use crate::core_types::{MsgId, SeqNum, UserId};

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait OfflineMessageRepository: Send + Sync {
    /// Insert a batch in one transaction. Rows already present (same
    /// user_id + msg_id) are skipped. Returns rows actually inserted.
    async fn insert_batch(&self, messages: &[OfflineMessage]) -> Result<u64, ImError>;

    /// One unread page: messages with seq > after_seq in ascending
    /// seq, bounded. Cursor pagination visits each row exactly once.
    async fn unread_page(
        &self,
        user_id: UserId,
        after_seq: SeqNum,
        limit: i64,
    ) -> Result<Vec<OfflineMessage>, ImError>;

    /// Delete delivered rows up to and including a sequence (client
    /// sync ack). Returns rows removed.
    async fn ack_through(&self, user_id: UserId, up_to_seq: SeqNum) -> Result<u64, ImError>;

    /// Delete up to `limit` expired rows. Returns rows removed.
    async fn sweep_expired(&self, limit: i64) -> Result<u64, ImError>;
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn latest(&self, scope: &str, conv_id: &str) -> Result<Option<SeqNum>, ImError>;

    /// Record the latest counter value (append-latest upsert)
    async fn record(&self, scope: &str, conv_id: &str, seq: SeqNum) -> Result<(), ImError>;

    /// Every snapshotted conversation, for seeding counters after a
    /// fast-store loss. Only conversations that crossed a snapshot
    /// boundary appear here.
    async fn all(&self) -> Result<Vec<(String, String, SeqNum)>, ImError>;
}

#[async_trait]
pub trait ReceiptRepository: Send + Sync {
    /// Idempotent on (msg_id, reader_id, device_id); false when the
    /// receipt already existed.
    async fn upsert(&self, receipt: &ReadReceipt) -> Result<bool, ImError>;

    async fn for_message(&self, msg_id: &str) -> Result<Vec<ReadReceipt>, ImError>;
}

// ============================================================================
// PostgreSQL implementations
// ============================================================================

fn row_to_offline(row: &sqlx::postgres::PgRow) -> Result<OfflineMessage, ImError> {
    let conv_type: String = row.get("conv_type");
    let conv_type = ConvScope::from_str_tag(&conv_type)
        .ok_or_else(|| ImError::Database(format!("invalid conv_type: {conv_type}")))?;
    Ok(OfflineMessage {
        msg_id: row.get("msg_id"),
        user_id: row.get::<i64, _>("user_id") as u64,
        sender_id: row.get::<i64, _>("sender_id") as u64,
        conv_id: row.get("conv_id"),
        conv_type,
        content: row.get("content"),
        seq: row.get::<i64, _>("seq") as u64,
        ts: row.get("ts"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}

pub struct PgOfflineMessageRepository {
    pool: PgPool,
}

impl PgOfflineMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OfflineMessageRepository for PgOfflineMessageRepository {
    async fn insert_batch(&self, messages: &[OfflineMessage]) -> Result<u64, ImError> {
        if messages.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for msg in messages {
            let result = sqlx::query(
                r#"
                INSERT INTO offline_messages
                    (msg_id, user_id, sender_id, conv_id, conv_type, content, seq, ts, created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (user_id, msg_id) DO NOTHING
                "#,
            )
            .bind(&msg.msg_id)
            .bind(msg.user_id as i64)
            .bind(msg.sender_id as i64)
            .bind(&msg.conv_id)
            .bind(msg.conv_type.as_str())
            .bind(&msg.content)
            .bind(msg.seq as i64)
            .bind(msg.ts)
            .bind(msg.created_at)
            .bind(msg.expires_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn unread_page(
        &self,
        user_id: UserId,
        after_seq: SeqNum,
        limit: i64,
    ) -> Result<Vec<OfflineMessage>, ImError> {
        let rows = sqlx::query(
            r#"
            SELECT msg_id, user_id, sender_id, conv_id, conv_type, content, seq, ts, created_at, expires_at
            FROM offline_messages
            WHERE user_id = $1 AND seq > $2 AND expires_at > NOW()
            ORDER BY seq ASC
            LIMIT $3
            "#,
        )
        .bind(user_id as i64)
        .bind(after_seq as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_offline).collect()
    }

    async fn ack_through(&self, user_id: UserId, up_to_seq: SeqNum) -> Result<u64, ImError> {
        let result = sqlx::query("DELETE FROM offline_messages WHERE user_id = $1 AND seq <= $2")
            .bind(user_id as i64)
            .bind(up_to_seq as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn sweep_expired(&self, limit: i64) -> Result<u64, ImError> {
        let result = sqlx::query(
            r#"
            DELETE FROM offline_messages
            WHERE (user_id, msg_id) IN (
                SELECT user_id, msg_id FROM offline_messages
                WHERE expires_at < NOW()
                LIMIT $1
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

pub struct PgSnapshotRepository {
    pool: PgPool,
}

impl PgSnapshotRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotRepository for PgSnapshotRepository {
    async fn latest(&self, scope: &str, conv_id: &str) -> Result<Option<SeqNum>, ImError> {
        let seq: Option<i64> = sqlx::query_scalar(
            "SELECT seq FROM counter_snapshots WHERE scope = $1 AND conv_id = $2",
        )
        .bind(scope)
        .bind(conv_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(seq.map(|s| s as u64))
    }

    async fn record(&self, scope: &str, conv_id: &str, seq: SeqNum) -> Result<(), ImError> {
        // GREATEST keeps a late-arriving older snapshot from
        // rewinding the recovery floor
        sqlx::query(
            r#"
            INSERT INTO counter_snapshots (scope, conv_id, seq, snapshot_ts)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (scope, conv_id)
            DO UPDATE SET seq = GREATEST(counter_snapshots.seq, EXCLUDED.seq), snapshot_ts = NOW()
            "#,
        )
        .bind(scope)
        .bind(conv_id)
        .bind(seq as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all(&self) -> Result<Vec<(String, String, SeqNum)>, ImError> {
        let rows = sqlx::query("SELECT scope, conv_id, seq FROM counter_snapshots")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("scope"),
                    row.get::<String, _>("conv_id"),
                    row.get::<i64, _>("seq") as u64,
                )
            })
            .collect())
    }
}

pub struct PgReceiptRepository {
    pool: PgPool,
}

impl PgReceiptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptRepository for PgReceiptRepository {
    async fn upsert(&self, receipt: &ReadReceipt) -> Result<bool, ImError> {
        let result = sqlx::query(
            r#"
            INSERT INTO read_receipts
                (msg_id, reader_id, device_id, sender_id, conv_id, conv_type, read_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (msg_id, reader_id, device_id) DO NOTHING
            "#,
        )
        .bind(&receipt.msg_id)
        .bind(receipt.reader_id as i64)
        .bind(&receipt.device_id)
        .bind(receipt.sender_id as i64)
        .bind(&receipt.conv_id)
        .bind(receipt.conv_type.as_str())
        .bind(receipt.read_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn for_message(&self, msg_id: &str) -> Result<Vec<ReadReceipt>, ImError> {
        let rows = sqlx::query(
            r#"
            SELECT msg_id, reader_id, device_id, sender_id, conv_id, conv_type, read_at
            FROM read_receipts WHERE msg_id = $1
            ORDER BY read_at ASC
            "#,
        )
        .bind(msg_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let conv_type: String = row.get("conv_type");
                let conv_type = ConvScope::from_str_tag(&conv_type)
                    .ok_or_else(|| ImError::Database(format!("invalid conv_type: {conv_type}")))?;
                Ok(ReadReceipt {
                    msg_id: row.get("msg_id"),
                    reader_id: row.get::<i64, _>("reader_id") as u64,
                    device_id: row.get("device_id"),
                    sender_id: row.get::<i64, _>("sender_id") as u64,
                    conv_id: row.get("conv_id"),
                    conv_type,
                    read_at: row.get("read_at"),
                })
            })
            .collect()
    }
}

// ============================================================================
// In-memory implementations (tests, local runs)
// ============================================================================

pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Utc;

    use super::*;

    #[derive(Default)]
    pub struct MemoryOfflineMessageRepository {
        rows: Mutex<Vec<OfflineMessage>>,
    }

    impl MemoryOfflineMessageRepository {
        pub fn len(&self) -> usize {
            self.rows.lock().expect("repo poisoned").len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl OfflineMessageRepository for MemoryOfflineMessageRepository {
        async fn insert_batch(&self, messages: &[OfflineMessage]) -> Result<u64, ImError> {
            let mut rows = self.rows.lock().expect("repo poisoned");
            let mut inserted = 0u64;
            for msg in messages {
                let exists = rows
                    .iter()
                    .any(|r| r.user_id == msg.user_id && r.msg_id == msg.msg_id);
                if !exists {
                    rows.push(msg.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        }

        async fn unread_page(
            &self,
            user_id: UserId,
            after_seq: SeqNum,
            limit: i64,
        ) -> Result<Vec<OfflineMessage>, ImError> {
            let now = Utc::now();
            let mut page: Vec<OfflineMessage> = self
                .rows
                .lock()
                .expect("repo poisoned")
                .iter()
                .filter(|r| r.user_id == user_id && r.seq > after_seq && r.expires_at > now)
                .cloned()
                .collect();
            page.sort_by_key(|r| r.seq);
            page.truncate(limit.max(0) as usize);
            Ok(page)
        }

        async fn ack_through(&self, user_id: UserId, up_to_seq: SeqNum) -> Result<u64, ImError> {
            let mut rows = self.rows.lock().expect("repo poisoned");
            let before = rows.len();
            rows.retain(|r| !(r.user_id == user_id && r.seq <= up_to_seq));
            Ok((before - rows.len()) as u64)
        }

        async fn sweep_expired(&self, limit: i64) -> Result<u64, ImError> {
            let now = Utc::now();
            let mut rows = self.rows.lock().expect("repo poisoned");
            let mut removed = 0u64;
            rows.retain(|r| {
                if removed < limit.max(0) as u64 && r.expires_at < now {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            Ok(removed)
        }
    }

    #[derive(Default)]
    pub struct MemorySnapshotRepository {
        snapshots: Mutex<HashMap<(String, String), SeqNum>>,
    }

    #[async_trait]
    impl SnapshotRepository for MemorySnapshotRepository {
        async fn latest(&self, scope: &str, conv_id: &str) -> Result<Option<SeqNum>, ImError> {
            Ok(self
                .snapshots
                .lock()
                .expect("repo poisoned")
                .get(&(scope.to_string(), conv_id.to_string()))
                .copied())
        }

        async fn record(&self, scope: &str, conv_id: &str, seq: SeqNum) -> Result<(), ImError> {
            let mut snapshots = self.snapshots.lock().expect("repo poisoned");
            let entry = snapshots
                .entry((scope.to_string(), conv_id.to_string()))
                .or_insert(0);
            *entry = (*entry).max(seq);
            Ok(())
        }

        async fn all(&self) -> Result<Vec<(String, String, SeqNum)>, ImError> {
            Ok(self
                .snapshots
                .lock()
                .expect("repo poisoned")
                .iter()
                .map(|((scope, conv), seq)| (scope.clone(), conv.clone(), *seq))
                .collect())
        }
    }

    #[derive(Default)]
    pub struct MemoryReceiptRepository {
        receipts: Mutex<HashMap<(MsgId, UserId, String), ReadReceipt>>,
    }

    #[async_trait]
    impl ReceiptRepository for MemoryReceiptRepository {
        async fn upsert(&self, receipt: &ReadReceipt) -> Result<bool, ImError> {
            let key = (
                receipt.msg_id.clone(),
                receipt.reader_id,
                receipt.device_id.clone(),
            );
            let mut receipts = self.receipts.lock().expect("repo poisoned");
            if receipts.contains_key(&key) {
                return Ok(false);
            }
            receipts.insert(key, receipt.clone());
            Ok(true)
        }

        async fn for_message(&self, msg_id: &str) -> Result<Vec<ReadReceipt>, ImError> {
            let mut out: Vec<ReadReceipt> = self
                .receipts
                .lock()
                .expect("repo poisoned")
                .values()
                .filter(|r| r.msg_id == msg_id)
                .cloned()
                .collect();
            out.sort_by_key(|r| r.read_at);
            Ok(out)
        }
    }
}
