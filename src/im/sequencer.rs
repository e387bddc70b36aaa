//! Sequencer - monotonic per-conversation sequence numbers
//!
//! One atomic counter per (scope, conv_id) in the fast store; every
//! `snapshot_every` increments the value is snapshotted to the
//! durable store off the hot path. After a fast-store loss, recovery
//! seeds the counter to snapshot + snapshot_every. Up to
//! snapshot_every sequence numbers may repeat after such a loss;
//! msg_id dedup keeps the duplicates off users' screens.

use std::sync::Arc;

use tracing::{debug, warn};

use super::error::ImError;
use super::repository::SnapshotRepository;
use super::types::ConvScope;
use crate::core_types::SeqNum;
use crate::store::FastStore;

pub struct Sequencer {
    store: Arc<dyn FastStore>,
    snapshots: Arc<dyn SnapshotRepository>,
    snapshot_every: u64,
}

impl Sequencer {
    pub fn new(
        store: Arc<dyn FastStore>,
        snapshots: Arc<dyn SnapshotRepository>,
        snapshot_every: u64,
    ) -> Self {
        Self {
            store,
            snapshots,
            snapshot_every: snapshot_every.max(1),
        }
    }

    /// Allocate the next sequence number for a conversation.
    pub async fn next(&self, scope: ConvScope, conv_id: &str) -> Result<SeqNum, ImError> {
        if conv_id.is_empty() {
            return Err(ImError::Validation("conv_id must not be empty".into()));
        }
        let seq = self.store.incr_seq(scope.as_str(), conv_id).await?;

        if seq % self.snapshot_every == 0 {
            // Snapshot off the hot path; a lost snapshot only widens
            // the duplicate window after a crash, it never loses data.
            let snapshots = Arc::clone(&self.snapshots);
            let scope_tag = scope.as_str();
            let conv = conv_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = snapshots.record(scope_tag, &conv, seq).await {
                    warn!(conv_id = %conv, seq, error = %e, "Counter snapshot failed");
                }
            });
        }
        Ok(seq)
    }

    /// Seed every snapshotted counter; run at service startup so a
    /// fast-store loss between restarts cannot rewind conversations.
    /// Counters that survived are never lowered by the seeding.
    pub async fn recover_all(&self) -> Result<usize, ImError> {
        let snapshots = self.snapshots.all().await?;
        let count = snapshots.len();
        for (scope, conv_id, seq) in snapshots {
            let floor = seq + self.snapshot_every;
            self.store.seed_seq(&scope, &conv_id, floor).await?;
        }
        Ok(count)
    }

    /// Seed a counter after fast-store loss: latest snapshot plus the
    /// full snapshot interval as safety margin. Never lowers a
    /// counter that survived.
    pub async fn recover(&self, scope: ConvScope, conv_id: &str) -> Result<SeqNum, ImError> {
        let snapshot = self
            .snapshots
            .latest(scope.as_str(), conv_id)
            .await?
            .unwrap_or(0);
        let floor = snapshot + self.snapshot_every;
        let seeded = self.store.seed_seq(scope.as_str(), conv_id, floor).await?;
        debug!(conv_id, snapshot, seeded, "Sequence counter recovered");
        Ok(seeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::repository::memory::MemorySnapshotRepository;
    use crate::store::MemoryStore;

    fn sequencer(snapshot_every: u64) -> (Sequencer, Arc<MemoryStore>, Arc<MemorySnapshotRepository>) {
        let store = Arc::new(MemoryStore::new());
        let snapshots = Arc::new(MemorySnapshotRepository::default());
        (
            Sequencer::new(store.clone(), snapshots.clone(), snapshot_every),
            store,
            snapshots,
        )
    }

    #[tokio::test]
    async fn test_strictly_increasing() {
        let (seq, _, _) = sequencer(1000);
        let mut last = 0;
        for _ in 0..100 {
            let n = seq.next(ConvScope::Private, "1:2").await.unwrap();
            assert!(n > last);
            last = n;
        }
    }

    #[tokio::test]
    async fn test_independent_conversations() {
        let (seq, _, _) = sequencer(1000);
        assert_eq!(seq.next(ConvScope::Private, "1:2").await.unwrap(), 1);
        assert_eq!(seq.next(ConvScope::Private, "1:3").await.unwrap(), 1);
        assert_eq!(seq.next(ConvScope::Group, "1:2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_conv_rejected() {
        let (seq, _, _) = sequencer(1000);
        assert!(seq.next(ConvScope::Private, "").await.is_err());
    }

    #[tokio::test]
    async fn test_recovery_seeds_past_snapshot() {
        let (seq, store, snapshots) = sequencer(10);

        // 25 increments: snapshots at 10 and 20
        for _ in 0..25 {
            seq.next(ConvScope::Private, "1:2").await.unwrap();
        }
        // Let the spawned snapshot writes land
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(snapshots.latest("private", "1:2").await.unwrap(), Some(20));

        // Fast store dies; counter state is gone
        store.wipe();
        let seeded = seq.recover(ConvScope::Private, "1:2").await.unwrap();
        assert_eq!(seeded, 30); // 20 + margin 10

        // Next allocation is beyond anything issued pre-crash
        let next = seq.next(ConvScope::Private, "1:2").await.unwrap();
        assert!(next > 25);
        assert_eq!(next, 31);
    }
}
