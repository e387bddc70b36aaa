//! Fast store - low-latency key/value store with atomic scripts
//!
//! Every shared hot-path mutation goes through this trait: stock
//! deduction, token-bucket admission, sequence allocation, dedup
//! marks, the reconciler's repair lock. Nothing in the hot path
//! issues ad-hoc commands against the backing store.
//!
//! Two implementations:
//! - [`RedisStore`] - production; each mutating operation is one
//!   server-side Lua script, so concurrent callers across processes
//!   observe it atomically.
//! - [`MemoryStore`] - single-process stand-in for tests and local
//!   runs; one mutex gives the same atomicity per operation.

pub mod memory;
pub mod redis;
pub mod scripts;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::core_types::{SkuId, UserId};

/// Fast store failure. Callers map these to their degraded path
/// (admission queues, router falls back offline) - never to success.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("fast store unreachable: {0}")]
    Unreachable(String),

    #[error("fast store protocol error: {0}")]
    Protocol(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Unreachable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

/// Result of one atomic stock deduction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    /// Deducted; `remaining` is the stock left after this call
    Success { remaining: u64 },
    /// The sold-out flag was already set
    SoldOut,
    /// Not enough stock for the requested qty
    OutOfStock { remaining: u64 },
    /// warmup() has not run for this SKU
    NotWarmed,
}

/// Result of one token-bucket acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    /// A token was taken; `tokens_left` is the post-decrement level
    Granted { tokens_left: i64 },
    /// Bucket exhausted; `depth` is the queue position (1-based)
    Queued { depth: u64 },
    /// The SKU is flagged sold out; the bucket is gone
    SoldOut,
}

/// Snapshot of one SKU's stock cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockCell {
    pub remaining: i64,
    pub sold: i64,
    pub sold_out: bool,
}

/// Key builders. Exact key strings are part of the deployment
/// contract (dashboards and runbooks grep for them), so they live in
/// one place.
pub mod keys {
    use super::{SkuId, UserId};

    pub fn stock(sku: SkuId) -> String {
        format!("stock:sku_{sku}")
    }
    pub fn sold(sku: SkuId) -> String {
        format!("sold:sku_{sku}")
    }
    pub fn sold_out(sku: SkuId) -> String {
        format!("sold_out:{sku}")
    }
    pub fn token_bucket(sku: SkuId) -> String {
        format!("token_bucket:{sku}")
    }
    pub fn token_bucket_rate(sku: SkuId) -> String {
        format!("token_bucket_rate:{sku}")
    }
    pub fn token_bucket_last(sku: SkuId) -> String {
        format!("token_bucket_last:{sku}")
    }
    pub fn token_bucket_capacity(sku: SkuId) -> String {
        format!("token_bucket_capacity:{sku}")
    }
    pub fn order_status(order_id: &str) -> String {
        format!("order_status:{order_id}")
    }
    pub fn seq(scope: &str, conv_id: &str) -> String {
        format!("seq:{scope}:{conv_id}")
    }
    pub fn dedup(msg_id: &str, recipient: UserId, device: &str) -> String {
        format!("dedup:{msg_id}:{recipient}:{device}")
    }
    pub fn request_count(user: UserId) -> String {
        format!("req_count:{user}")
    }
    pub fn captcha(user: UserId, token: &str) -> String {
        format!("captcha:{user}:{token}")
    }
    pub fn sku_repair_lock(sku: SkuId) -> String {
        format!("lock:sku_{sku}")
    }
}

/// The only mutation path into the fast store.
///
/// Atomicity contract: every method is a single atomic step as seen
/// by any other caller of this trait, across all processes sharing
/// the backing store.
#[async_trait]
pub trait FastStore: Send + Sync {
    // ---- stock cells ----

    /// Initialize `stock`/`sold` for a SKU. Returns false when the
    /// cell already exists and `force` is not set.
    async fn warmup_stock(&self, sku: SkuId, total: u64, force: bool)
    -> Result<bool, StoreError>;

    /// Atomic deduct per the stock script: sold-out flag wins, short
    /// stock sets the flag at zero, otherwise stock -= qty and
    /// sold += qty in one step.
    async fn deduct_stock(&self, sku: SkuId, qty: u64) -> Result<DeductOutcome, StoreError>;

    /// Atomic restore: stock += qty, sold -= qty, sold-out flag
    /// cleared. Returns the new remaining stock. Callers gate
    /// idempotency with the stock log before invoking this.
    async fn restore_stock(&self, sku: SkuId, qty: u64) -> Result<i64, StoreError>;

    async fn stock_info(&self, sku: SkuId) -> Result<Option<StockCell>, StoreError>;

    async fn set_sold_out(&self, sku: SkuId) -> Result<(), StoreError>;

    async fn is_sold_out(&self, sku: SkuId) -> Result<bool, StoreError>;

    /// Teardown: delete every key belonging to a SKU (stock cell,
    /// sold-out flag, token bucket).
    async fn clear_sku(&self, sku: SkuId) -> Result<(), StoreError>;

    /// Direct stock-cell write. Reserved for the reconciler, which
    /// must hold the SKU repair lock while calling it.
    async fn force_set_stock(&self, sku: SkuId, remaining: u64, sold: u64)
    -> Result<(), StoreError>;

    // ---- admission ----

    /// Lazy token-bucket acquire: refill by elapsed time, cap at
    /// capacity, decrement, clamp the deficit at -capacity.
    async fn acquire_token(
        &self,
        sku: SkuId,
        rate: u32,
        capacity: u32,
        now_ms: i64,
    ) -> Result<TokenOutcome, StoreError>;

    /// Configure the per-SKU bucket (rate/capacity keys), read by the
    /// acquire script in preference to its defaults.
    async fn configure_bucket(&self, sku: SkuId, rate: u32, capacity: u32)
    -> Result<(), StoreError>;

    /// Drop the bucket keys so no further acquires succeed.
    async fn drop_bucket(&self, sku: SkuId) -> Result<(), StoreError>;

    /// Sliding per-user request counter for the captcha gate.
    /// Returns the count within the current window.
    async fn bump_request_count(&self, user: UserId, window_secs: u64)
    -> Result<u64, StoreError>;

    async fn put_captcha(&self, user: UserId, token: &str, ttl_secs: u64)
    -> Result<(), StoreError>;

    /// Single-use consume: true exactly once per issued token.
    async fn take_captcha(&self, user: UserId, token: &str) -> Result<bool, StoreError>;

    // ---- bounded-staleness caches ----

    async fn cache_put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    // ---- sequencer ----

    /// Atomic increment of `seq:<scope>:<conv_id>`; returns the new
    /// value. First call on a fresh counter returns 1.
    async fn incr_seq(&self, scope: &str, conv_id: &str) -> Result<u64, StoreError>;

    /// Raise the counter to at least `floor` (recovery seeding).
    /// Never lowers it.
    async fn seed_seq(&self, scope: &str, conv_id: &str, floor: u64) -> Result<u64, StoreError>;

    // ---- dedup ----

    /// SET-NX mark. Returns true when this call created the entry.
    async fn dedup_mark(&self, key: &str, value: &str, ttl_secs: u64)
    -> Result<bool, StoreError>;

    async fn dedup_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    // ---- advisory lock ----

    /// Lease-style lock: true when acquired. The holder token is
    /// required for release so an expired lease cannot be stolen back.
    async fn try_lock(&self, key: &str, holder: &str, ttl_secs: u64)
    -> Result<bool, StoreError>;

    /// Compare-and-delete release; true when this holder released it.
    async fn unlock(&self, key: &str, holder: &str) -> Result<bool, StoreError>;
}
