//! In-memory fast store
//!
//! Single-process stand-in used by tests and local runs. One mutex
//! around the whole state gives every operation the same atomicity
//! the Lua scripts give the Redis store, for any interleaving of
//! concurrent callers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use super::{DeductOutcome, FastStore, StockCell, StoreError, TokenOutcome, keys};
use crate::core_types::{SkuId, UserId};

#[derive(Debug, Default)]
struct SkuState {
    remaining: i64,
    sold: i64,
}

#[derive(Debug)]
struct BucketState {
    tokens: i64,
    last_ms: i64,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct Inner {
    stock: FxHashMap<SkuId, SkuState>,
    sold_out: FxHashMap<SkuId, bool>,
    buckets: FxHashMap<SkuId, BucketState>,
    bucket_rates: FxHashMap<SkuId, (u32, u32)>,
    seqs: FxHashMap<String, u64>,
    kv: FxHashMap<String, Entry>,
    counters: FxHashMap<String, (u64, Instant)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; tests
        // want the panic surfaced, not masked.
        self.inner.lock().expect("memory store poisoned")
    }

    /// Simulate a fast-store restart: volatile state is gone, the
    /// durable stores are untouched.
    pub fn wipe(&self) {
        let mut inner = self.lock();
        *inner = Inner::default();
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn warmup_stock(
        &self,
        sku: SkuId,
        total: u64,
        force: bool,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if !force && inner.stock.contains_key(&sku) {
            return Ok(false);
        }
        inner.stock.insert(
            sku,
            SkuState {
                remaining: total as i64,
                sold: 0,
            },
        );
        inner.sold_out.remove(&sku);
        Ok(true)
    }

    async fn deduct_stock(&self, sku: SkuId, qty: u64) -> Result<DeductOutcome, StoreError> {
        let mut inner = self.lock();
        if inner.sold_out.contains_key(&sku) {
            return Ok(DeductOutcome::SoldOut);
        }
        let Some(state) = inner.stock.get_mut(&sku) else {
            return Ok(DeductOutcome::NotWarmed);
        };
        let qty = qty as i64;
        if state.remaining < qty {
            let remaining = state.remaining.max(0) as u64;
            if state.remaining == 0 {
                inner.sold_out.insert(sku, true);
            }
            return Ok(DeductOutcome::OutOfStock { remaining });
        }
        state.remaining -= qty;
        state.sold += qty;
        Ok(DeductOutcome::Success {
            remaining: state.remaining as u64,
        })
    }

    async fn restore_stock(&self, sku: SkuId, qty: u64) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let state = inner.stock.entry(sku).or_default();
        state.remaining += qty as i64;
        state.sold -= qty as i64;
        let remaining = state.remaining;
        inner.sold_out.remove(&sku);
        Ok(remaining)
    }

    async fn stock_info(&self, sku: SkuId) -> Result<Option<StockCell>, StoreError> {
        let inner = self.lock();
        Ok(inner.stock.get(&sku).map(|s| StockCell {
            remaining: s.remaining,
            sold: s.sold,
            sold_out: inner.sold_out.contains_key(&sku),
        }))
    }

    async fn set_sold_out(&self, sku: SkuId) -> Result<(), StoreError> {
        self.lock().sold_out.insert(sku, true);
        Ok(())
    }

    async fn is_sold_out(&self, sku: SkuId) -> Result<bool, StoreError> {
        Ok(self.lock().sold_out.contains_key(&sku))
    }

    async fn clear_sku(&self, sku: SkuId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.stock.remove(&sku);
        inner.sold_out.remove(&sku);
        inner.buckets.remove(&sku);
        inner.bucket_rates.remove(&sku);
        Ok(())
    }

    async fn force_set_stock(
        &self,
        sku: SkuId,
        remaining: u64,
        sold: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.stock.insert(
            sku,
            SkuState {
                remaining: remaining as i64,
                sold: sold as i64,
            },
        );
        if remaining > 0 {
            inner.sold_out.remove(&sku);
        } else {
            inner.sold_out.insert(sku, true);
        }
        Ok(())
    }

    async fn acquire_token(
        &self,
        sku: SkuId,
        rate: u32,
        capacity: u32,
        now_ms: i64,
    ) -> Result<TokenOutcome, StoreError> {
        let mut inner = self.lock();
        if inner.sold_out.contains_key(&sku) {
            return Ok(TokenOutcome::SoldOut);
        }
        let (rate, capacity) = inner.bucket_rates.get(&sku).copied().unwrap_or((rate, capacity));
        let bucket = inner.buckets.entry(sku).or_insert(BucketState {
            tokens: capacity as i64,
            last_ms: now_ms,
        });
        let refill = (now_ms - bucket.last_ms).max(0) / 1000 * rate as i64;
        if refill > 0 {
            bucket.tokens = (bucket.tokens + refill).min(capacity as i64);
            bucket.last_ms = now_ms;
        }
        bucket.tokens -= 1;
        if bucket.tokens < -(capacity as i64) {
            bucket.tokens = -(capacity as i64);
        }
        if bucket.tokens >= 0 {
            Ok(TokenOutcome::Granted {
                tokens_left: bucket.tokens,
            })
        } else {
            Ok(TokenOutcome::Queued {
                depth: bucket.tokens.unsigned_abs(),
            })
        }
    }

    async fn configure_bucket(
        &self,
        sku: SkuId,
        rate: u32,
        capacity: u32,
    ) -> Result<(), StoreError> {
        self.lock().bucket_rates.insert(sku, (rate, capacity));
        Ok(())
    }

    async fn drop_bucket(&self, sku: SkuId) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.buckets.remove(&sku);
        inner.bucket_rates.remove(&sku);
        Ok(())
    }

    async fn bump_request_count(
        &self,
        user: UserId,
        window_secs: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let entry = inner
            .counters
            .entry(keys::request_count(user))
            .or_insert((0, now + Duration::from_secs(window_secs)));
        if entry.1 <= now {
            *entry = (0, now + Duration::from_secs(window_secs));
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn put_captcha(
        &self,
        user: UserId,
        token: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        self.cache_put(&keys::captcha(user, token), "1", ttl_secs).await
    }

    async fn take_captcha(&self, user: UserId, token: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let key = keys::captcha(user, token);
        let now = Instant::now();
        match inner.kv.remove(&key) {
            Some(entry) => Ok(entry.live(now)),
            None => Ok(false),
        }
    }

    async fn cache_put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.lock().kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock();
        let now = Instant::now();
        Ok(inner
            .kv
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn incr_seq(&self, scope: &str, conv_id: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let seq = inner.seqs.entry(keys::seq(scope, conv_id)).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn seed_seq(&self, scope: &str, conv_id: &str, floor: u64) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let seq = inner.seqs.entry(keys::seq(scope, conv_id)).or_insert(0);
        if floor > *seq {
            *seq = floor;
        }
        Ok(*seq)
    }

    async fn dedup_mark(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        if inner.kv.get(key).map(|e| e.live(now)).unwrap_or(false) {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(true)
    }

    async fn dedup_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.cache_get(key).await
    }

    async fn try_lock(&self, key: &str, holder: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        self.dedup_mark(key, holder, ttl_secs).await
    }

    async fn unlock(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let held = inner
            .kv
            .get(key)
            .map(|e| e.live(now) && e.value == holder)
            .unwrap_or(false);
        if held {
            inner.kv.remove(key);
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_warmup_then_deduct() {
        let store = MemoryStore::new();
        assert!(store.warmup_stock(1, 10, false).await.unwrap());
        // Second warmup without force is refused
        assert!(!store.warmup_stock(1, 99, false).await.unwrap());

        match store.deduct_stock(1, 3).await.unwrap() {
            DeductOutcome::Success { remaining } => assert_eq!(remaining, 7),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let cell = store.stock_info(1).await.unwrap().unwrap();
        assert_eq!(cell.remaining, 7);
        assert_eq!(cell.sold, 3);
    }

    #[tokio::test]
    async fn test_deduct_exhaustion_sets_sold_out() {
        let store = MemoryStore::new();
        store.warmup_stock(1, 1, false).await.unwrap();
        assert!(matches!(
            store.deduct_stock(1, 1).await.unwrap(),
            DeductOutcome::Success { remaining: 0 }
        ));
        // Flag is set on the first short attempt at zero stock
        assert!(matches!(
            store.deduct_stock(1, 1).await.unwrap(),
            DeductOutcome::OutOfStock { remaining: 0 }
        ));
        assert!(store.is_sold_out(1).await.unwrap());
        assert!(matches!(
            store.deduct_stock(1, 1).await.unwrap(),
            DeductOutcome::SoldOut
        ));
    }

    #[tokio::test]
    async fn test_restore_clears_sold_out() {
        let store = MemoryStore::new();
        store.warmup_stock(1, 1, false).await.unwrap();
        store.deduct_stock(1, 1).await.unwrap();
        store.set_sold_out(1).await.unwrap();

        let remaining = store.restore_stock(1, 1).await.unwrap();
        assert_eq!(remaining, 1);
        assert!(!store.is_sold_out(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_bucket_refill_and_clamp() {
        let store = MemoryStore::new();
        let t0 = 1_000_000i64;

        // capacity 2: two grants, then queueing
        assert!(matches!(
            store.acquire_token(1, 1, 2, t0).await.unwrap(),
            TokenOutcome::Granted { .. }
        ));
        assert!(matches!(
            store.acquire_token(1, 1, 2, t0).await.unwrap(),
            TokenOutcome::Granted { tokens_left: 0 }
        ));
        assert!(matches!(
            store.acquire_token(1, 1, 2, t0).await.unwrap(),
            TokenOutcome::Queued { depth: 1 }
        ));

        // Queue depth is clamped at capacity
        for _ in 0..10 {
            store.acquire_token(1, 1, 2, t0).await.unwrap();
        }
        assert!(matches!(
            store.acquire_token(1, 1, 2, t0).await.unwrap(),
            TokenOutcome::Queued { depth: 2 }
        ));

        // One second later one token has refilled; it absorbs one
        // unit of queue depth
        assert!(matches!(
            store.acquire_token(1, 1, 2, t0 + 1_000).await.unwrap(),
            TokenOutcome::Queued { depth: 2 }
        ));
    }

    #[tokio::test]
    async fn test_seq_monotonic_and_seed() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_seq("private", "a:b").await.unwrap(), 1);
        assert_eq!(store.incr_seq("private", "a:b").await.unwrap(), 2);

        // Seeding never lowers the counter
        assert_eq!(store.seed_seq("private", "a:b", 1).await.unwrap(), 2);
        assert_eq!(store.seed_seq("private", "a:b", 100).await.unwrap(), 100);
        assert_eq!(store.incr_seq("private", "a:b").await.unwrap(), 101);
    }

    #[tokio::test]
    async fn test_dedup_mark_once() {
        let store = MemoryStore::new();
        assert!(store.dedup_mark("dedup:m1:7:d1", "done", 60).await.unwrap());
        assert!(!store.dedup_mark("dedup:m1:7:d1", "again", 60).await.unwrap());
        assert_eq!(
            store.dedup_get("dedup:m1:7:d1").await.unwrap().as_deref(),
            Some("done")
        );
    }

    #[tokio::test]
    async fn test_lock_holder_release() {
        let store = MemoryStore::new();
        assert!(store.try_lock("lock:sku_1", "a", 30).await.unwrap());
        assert!(!store.try_lock("lock:sku_1", "b", 30).await.unwrap());
        // Wrong holder cannot release
        assert!(!store.unlock("lock:sku_1", "b").await.unwrap());
        assert!(store.unlock("lock:sku_1", "a").await.unwrap());
        assert!(store.try_lock("lock:sku_1", "b", 30).await.unwrap());
    }

    #[tokio::test]
    async fn test_captcha_single_use() {
        let store = MemoryStore::new();
        store.put_captcha(7, "tok", 60).await.unwrap();
        assert!(store.take_captcha(7, "tok").await.unwrap());
        assert!(!store.take_captcha(7, "tok").await.unwrap());
    }
}
