//! Inventory Engine - atomic deduct/rollback over the fast store
//!
//! The fast store script is the concurrency gate; the stock log and
//! the order-bus publish make a deduct durable. The publish is the
//! commit point: a deduct whose publish fails is compensated
//! synchronously so the fast-store counters never drift ahead of
//! what the durable side will eventually materialize.
//!
//! ```text
//! deduct script ──▶ StockLog(Deduct) ──▶ bus publish ──▶ Success
//!      │                  │ fail             │ fail
//!      │                  ▼                  ▼
//!      │            restore script    StockLog(Rollback)
//!      │                               + restore script
//!      └──────────────────────────────▶ SystemError
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, warn};
use uuid::Uuid;

use super::error::FlashSaleError;
use super::repository::{OrderRepository, StockLogRepository};
use super::types::{Activity, OrderEvent, StockLog, StockOp};
use crate::bus::{BusProducer, topics};
use crate::core_types::{SkuId, UserId};
use crate::store::{DeductOutcome, FastStore, keys};

/// Tagged deduct result. System failures are `Err`; these three are
/// ordinary outcomes the caller maps to client responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductResult {
    Success { order_id: Uuid, remaining: u64 },
    OutOfStock,
    OverLimit,
}

/// Aggregated stock view for one SKU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockInfo {
    pub total: i64,
    pub remaining: i64,
    pub sold: i64,
}

pub struct InventoryEngine {
    store: Arc<dyn FastStore>,
    orders: Arc<dyn OrderRepository>,
    stock_logs: Arc<dyn StockLogRepository>,
    producer: Arc<dyn BusProducer>,
    order_status_ttl_secs: u64,
}

impl InventoryEngine {
    pub fn new(
        store: Arc<dyn FastStore>,
        orders: Arc<dyn OrderRepository>,
        stock_logs: Arc<dyn StockLogRepository>,
        producer: Arc<dyn BusProducer>,
        order_status_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            orders,
            stock_logs,
            producer,
            order_status_ttl_secs,
        }
    }

    /// Initialize the stock cell. Refuses a second warmup unless
    /// forced, so a crashed starter cannot silently reset live
    /// counters.
    pub async fn warmup(
        &self,
        sku_id: SkuId,
        total: u64,
        force: bool,
    ) -> Result<bool, FlashSaleError> {
        let warmed = self.store.warmup_stock(sku_id, total, force).await?;
        if warmed {
            tracing::info!(sku_id, total, force, "Stock warmed up");
        }
        Ok(warmed)
    }

    /// Atomic deduct. No partial effect: either the order event is on
    /// the bus with its deduct logged, or the fast-store counters are
    /// back where they started.
    pub async fn deduct(
        &self,
        activity: &Activity,
        user_id: UserId,
        qty: u32,
    ) -> Result<DeductResult, FlashSaleError> {
        if qty == 0 {
            return Err(FlashSaleError::Validation("qty must be positive".into()));
        }
        let sku_id = activity.sku_id;

        // Per-user limit from durable truth. Concurrent requests can
        // race past this check; the reconciler cancels the excess.
        let held = self.orders.count_active_for_user(user_id, sku_id).await?;
        if held + qty as u64 > activity.per_user_limit as u64 {
            return Ok(DeductResult::OverLimit);
        }

        let remaining = match self.store.deduct_stock(sku_id, qty as u64).await? {
            DeductOutcome::Success { remaining } => remaining,
            DeductOutcome::SoldOut | DeductOutcome::OutOfStock { .. } => {
                return Ok(DeductResult::OutOfStock);
            }
            DeductOutcome::NotWarmed => {
                warn!(sku_id, "Deduct against a SKU that was never warmed");
                return Ok(DeductResult::OutOfStock);
            }
        };

        let order_id = Uuid::new_v4();
        let deduct_log = StockLog {
            sku_id,
            order_id,
            op: StockOp::Deduct,
            qty,
            stock_before: remaining as i64 + qty as i64,
            stock_after: remaining as i64,
        };
        if let Err(e) = self.stock_logs.append(&deduct_log).await {
            // No durable trace of this deduct exists yet; undo the
            // counters directly.
            error!(sku_id, %order_id, error = %e, "Deduct log append failed, compensating");
            self.compensate_counters(sku_id, qty).await;
            return Err(FlashSaleError::System(format!(
                "deduct log append failed: {e}"
            )));
        }

        let event = OrderEvent {
            order_id,
            user_id,
            sku_id,
            activity_id: activity.activity_id,
            qty,
            remaining_after: remaining,
            ts: Utc::now(),
        };
        let payload =
            serde_json::to_vec(&event).map_err(|e| FlashSaleError::System(e.to_string()))?;
        if let Err(e) = self
            .producer
            .publish(topics::ORDER_EVENTS, &event.partition_key(), &payload)
            .await
        {
            // The deduct log row exists, so the compensation must be
            // the logged rollback to keep the deduct/rollback pairing.
            error!(sku_id, %order_id, error = %e, "Order publish failed, rolling back");
            if let Err(rb) = self.rollback(sku_id, order_id, qty).await {
                error!(sku_id, %order_id, error = %rb, "Compensating rollback failed");
            }
            return Err(FlashSaleError::System(format!("order publish failed: {e}")));
        }

        // Visible to status queries before the materializer catches up
        if let Err(e) = self
            .store
            .cache_put(
                &keys::order_status(&order_id.to_string()),
                super::types::OrderStatus::PendingPayment.as_str(),
                self.order_status_ttl_secs,
            )
            .await
        {
            warn!(%order_id, error = %e, "Order status cache write failed");
        }

        if remaining == 0 {
            // Exhausted by this deduct: flag it and drop the bucket so
            // admission stops handing out grants.
            if let Err(e) = self.store.set_sold_out(sku_id).await {
                warn!(sku_id, error = %e, "Failed to set sold-out flag");
            }
            if let Err(e) = self.store.drop_bucket(sku_id).await {
                warn!(sku_id, error = %e, "Failed to drop token bucket");
            }
        }

        Ok(DeductResult::Success {
            order_id,
            remaining,
        })
    }

    /// Idempotent stock restore for one order. The rollback log row
    /// is the gate: whoever inserts it performs the restore, every
    /// later call short-circuits.
    pub async fn rollback(
        &self,
        sku_id: SkuId,
        order_id: Uuid,
        qty: u32,
    ) -> Result<i64, FlashSaleError> {
        let before = self
            .store
            .stock_info(sku_id)
            .await?
            .map(|c| c.remaining)
            .unwrap_or(0);

        let log = StockLog {
            sku_id,
            order_id,
            op: StockOp::Rollback,
            qty,
            stock_before: before,
            stock_after: before + qty as i64,
        };
        if !self.stock_logs.append(&log).await? {
            // Already rolled back; report the current level unchanged
            return Ok(before);
        }

        let remaining = self.store.restore_stock(sku_id, qty as u64).await?;
        tracing::info!(sku_id, %order_id, qty, remaining, "Stock restored");
        Ok(remaining)
    }

    /// Read-only stock view; total is derived from the two counters
    pub async fn stock(&self, sku_id: SkuId) -> Result<Option<StockInfo>, FlashSaleError> {
        Ok(self.store.stock_info(sku_id).await?.map(|cell| StockInfo {
            total: cell.remaining + cell.sold,
            remaining: cell.remaining,
            sold: cell.sold,
        }))
    }

    /// Raw counter compensation for a deduct that never reached the
    /// durable store. Best effort: a failure here leaves a surplus
    /// deduct the reconciler will find and repair.
    async fn compensate_counters(&self, sku_id: SkuId, qty: u32) {
        if let Err(e) = self.store.restore_stock(sku_id, qty as u64).await {
            error!(sku_id, error = %e, "Counter compensation failed; reconciler will repair");
        }
    }
}
