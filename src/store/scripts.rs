//! Server-side Lua bodies for the atomic fast-store operations
//!
//! The scripts are the single writers of the stock cell and token
//! bucket keys. Shipping them server-side keeps every read-modify-
//! write step atomic under concurrent callers from many processes.

/// Stock deduct.
///
/// KEYS: stock, sold, sold_out. ARGV: qty.
/// Returns {status, stock}: 0 deducted, -1 short (flag set at zero),
/// -2 sold-out flag already set, -3 not warmed.
pub const DEDUCT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
  return {-2, 0}
end
local stock = redis.call('GET', KEYS[1])
if not stock then
  return {-3, 0}
end
stock = tonumber(stock)
local qty = tonumber(ARGV[1])
if stock < qty then
  if stock == 0 then
    redis.call('SET', KEYS[3], 1)
  end
  return {-1, stock}
end
stock = redis.call('DECRBY', KEYS[1], qty)
redis.call('INCRBY', KEYS[2], qty)
return {0, stock}
"#;

/// Stock restore (rollback). Clears the sold-out flag because stock
/// became saleable again.
///
/// KEYS: stock, sold, sold_out. ARGV: qty. Returns new stock.
pub const RESTORE: &str = r#"
local stock = redis.call('INCRBY', KEYS[1], ARGV[1])
redis.call('DECRBY', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[3])
return stock
"#;

/// Warmup. Refuses to re-initialize a live cell unless forced.
///
/// KEYS: stock, sold, sold_out. ARGV: total, force(0/1).
/// Returns 1 on init, 0 when already warmed.
pub const WARMUP: &str = r#"
if tonumber(ARGV[2]) == 0 and redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], 0)
redis.call('DEL', KEYS[3])
return 1
"#;

/// Lazy token-bucket refill + acquire. Negative token count is the
/// queue depth, clamped at -capacity.
///
/// KEYS: tokens, last_refill, sold_out, rate, capacity.
/// ARGV: default_rate, default_capacity, now_ms.
/// Returns {status, tokens}: 0 granted, 1 queued, 2 sold out.
pub const TOKEN_ACQUIRE: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
  return {2, 0}
end
local rate = tonumber(redis.call('GET', KEYS[4]) or ARGV[1])
local capacity = tonumber(redis.call('GET', KEYS[5]) or ARGV[2])
local now = tonumber(ARGV[3])
local tokens = redis.call('GET', KEYS[1])
local last = redis.call('GET', KEYS[2])
if not tokens then
  tokens = capacity
  last = now
else
  tokens = tonumber(tokens)
  last = tonumber(last) or now
  local refill = math.floor((now - last) / 1000 * rate)
  if refill > 0 then
    tokens = math.min(tokens + refill, capacity)
    last = now
  end
end
tokens = tokens - 1
if tokens < -capacity then
  tokens = -capacity
end
redis.call('SET', KEYS[1], tokens)
redis.call('SET', KEYS[2], last)
if tokens >= 0 then
  return {0, tokens}
end
return {1, tokens}
"#;

/// Reconciler repair write: set both counters in one step and clear
/// the sold-out flag when stock is saleable again.
///
/// KEYS: stock, sold, sold_out. ARGV: remaining, sold.
pub const FORCE_SET: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
if tonumber(ARGV[1]) > 0 then
  redis.call('DEL', KEYS[3])
else
  redis.call('SET', KEYS[3], 1)
end
return 1
"#;

/// Monotonic seed: raise the counter to at least ARGV[1], never
/// lower it. Returns the resulting counter value.
///
/// KEYS: seq.
pub const SEED_SEQ: &str = r#"
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
local floor = tonumber(ARGV[1])
if floor > cur then
  redis.call('SET', KEYS[1], floor)
  return floor
end
return cur
"#;

/// Compare-and-delete lock release.
///
/// KEYS: lock. ARGV: holder. Returns 1 when released by this holder.
pub const UNLOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;
