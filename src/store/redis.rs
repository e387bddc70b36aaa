//! Redis-backed fast store
//!
//! One `ConnectionManager` (auto-reconnecting multiplexed connection)
//! shared by all callers; every mutating operation is a single Lua
//! script from [`super::scripts`].

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;
use redis::aio::ConnectionManager;

use super::{DeductOutcome, FastStore, StockCell, StoreError, TokenOutcome, keys, scripts};
use crate::core_types::{SkuId, UserId};

static DEDUCT: Lazy<Script> = Lazy::new(|| Script::new(scripts::DEDUCT));
static RESTORE: Lazy<Script> = Lazy::new(|| Script::new(scripts::RESTORE));
static WARMUP: Lazy<Script> = Lazy::new(|| Script::new(scripts::WARMUP));
static TOKEN_ACQUIRE: Lazy<Script> = Lazy::new(|| Script::new(scripts::TOKEN_ACQUIRE));
static FORCE_SET: Lazy<Script> = Lazy::new(|| Script::new(scripts::FORCE_SET));
static SEED_SEQ: Lazy<Script> = Lazy::new(|| Script::new(scripts::SEED_SEQ));
static UNLOCK: Lazy<Script> = Lazy::new(|| Script::new(scripts::UNLOCK));

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server responds before handing the
    /// store to callers. Startup fails here when Redis is down.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let mut conn = ConnectionManager::new(client).await.map_err(StoreError::from)?;
        redis::cmd("PING")
            .exec_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        tracing::info!("Redis fast store connected");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl FastStore for RedisStore {
    async fn warmup_stock(
        &self,
        sku: SkuId,
        total: u64,
        force: bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let done: i64 = WARMUP
            .key(keys::stock(sku))
            .key(keys::sold(sku))
            .key(keys::sold_out(sku))
            .arg(total)
            .arg(force as u8)
            .invoke_async(&mut conn)
            .await?;
        Ok(done == 1)
    }

    async fn deduct_stock(&self, sku: SkuId, qty: u64) -> Result<DeductOutcome, StoreError> {
        let mut conn = self.conn();
        let (status, stock): (i64, i64) = DEDUCT
            .key(keys::stock(sku))
            .key(keys::sold(sku))
            .key(keys::sold_out(sku))
            .arg(qty)
            .invoke_async(&mut conn)
            .await?;
        Ok(match status {
            0 => DeductOutcome::Success {
                remaining: stock.max(0) as u64,
            },
            -1 => DeductOutcome::OutOfStock {
                remaining: stock.max(0) as u64,
            },
            -2 => DeductOutcome::SoldOut,
            _ => DeductOutcome::NotWarmed,
        })
    }

    async fn restore_stock(&self, sku: SkuId, qty: u64) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let stock: i64 = RESTORE
            .key(keys::stock(sku))
            .key(keys::sold(sku))
            .key(keys::sold_out(sku))
            .arg(qty)
            .invoke_async(&mut conn)
            .await?;
        Ok(stock)
    }

    async fn stock_info(&self, sku: SkuId) -> Result<Option<StockCell>, StoreError> {
        let mut conn = self.conn();
        let (remaining, sold, sold_out): (Option<i64>, Option<i64>, bool) = redis::pipe()
            .atomic()
            .get(keys::stock(sku))
            .get(keys::sold(sku))
            .exists(keys::sold_out(sku))
            .query_async(&mut conn)
            .await?;
        Ok(remaining.map(|remaining| StockCell {
            remaining,
            sold: sold.unwrap_or(0),
            sold_out,
        }))
    }

    async fn set_sold_out(&self, sku: SkuId) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(keys::sold_out(sku))
            .arg(1)
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_sold_out(&self, sku: SkuId) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let exists: bool = redis::cmd("EXISTS")
            .arg(keys::sold_out(sku))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn clear_sku(&self, sku: SkuId) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(keys::stock(sku))
            .arg(keys::sold(sku))
            .arg(keys::sold_out(sku))
            .arg(keys::token_bucket(sku))
            .arg(keys::token_bucket_rate(sku))
            .arg(keys::token_bucket_last(sku))
            .arg(keys::token_bucket_capacity(sku))
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn force_set_stock(
        &self,
        sku: SkuId,
        remaining: u64,
        sold: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = FORCE_SET
            .key(keys::stock(sku))
            .key(keys::sold(sku))
            .key(keys::sold_out(sku))
            .arg(remaining)
            .arg(sold)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire_token(
        &self,
        sku: SkuId,
        rate: u32,
        capacity: u32,
        now_ms: i64,
    ) -> Result<TokenOutcome, StoreError> {
        let mut conn = self.conn();
        let (status, tokens): (i64, i64) = TOKEN_ACQUIRE
            .key(keys::token_bucket(sku))
            .key(keys::token_bucket_last(sku))
            .key(keys::sold_out(sku))
            .key(keys::token_bucket_rate(sku))
            .key(keys::token_bucket_capacity(sku))
            .arg(rate)
            .arg(capacity)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(match status {
            0 => TokenOutcome::Granted {
                tokens_left: tokens,
            },
            1 => TokenOutcome::Queued {
                depth: tokens.unsigned_abs(),
            },
            _ => TokenOutcome::SoldOut,
        })
    }

    async fn configure_bucket(
        &self,
        sku: SkuId,
        rate: u32,
        capacity: u32,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::pipe()
            .set(keys::token_bucket_rate(sku), rate)
            .set(keys::token_bucket_capacity(sku), capacity)
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn drop_bucket(&self, sku: SkuId) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(keys::token_bucket(sku))
            .arg(keys::token_bucket_rate(sku))
            .arg(keys::token_bucket_last(sku))
            .arg(keys::token_bucket_capacity(sku))
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn bump_request_count(
        &self,
        user: UserId,
        window_secs: u64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let key = keys::request_count(user);
        let count: u64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(window_secs)
                .exec_async(&mut conn)
                .await?;
        }
        Ok(count)
    }

    async fn put_captcha(
        &self,
        user: UserId,
        token: &str,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(keys::captcha(user, token))
            .arg(1)
            .arg("EX")
            .arg(ttl_secs)
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn take_captcha(&self, user: UserId, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        // DEL returns the number of keys removed: 1 exactly once
        let removed: i64 = redis::cmd("DEL")
            .arg(keys::captcha(user, token))
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn cache_put(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .exec_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn incr_seq(&self, scope: &str, conv_id: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let seq: u64 = redis::cmd("INCR")
            .arg(keys::seq(scope, conv_id))
            .query_async(&mut conn)
            .await?;
        Ok(seq)
    }

    async fn seed_seq(&self, scope: &str, conv_id: &str, floor: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let seq: u64 = SEED_SEQ
            .key(keys::seq(scope, conv_id))
            .arg(floor)
            .invoke_async(&mut conn)
            .await?;
        Ok(seq)
    }

    async fn dedup_mark(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn dedup_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.cache_get(key).await
    }

    async fn try_lock(&self, key: &str, holder: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn unlock(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let released: i64 = UNLOCK
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}
