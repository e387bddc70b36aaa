//! Reconciler - fast store vs durable store consistency
//!
//! The durable store is the source of truth. Per managed SKU on a
//! timer: cancel raced-in over-limit orders, compare the fast-store
//! counters against the durable order count, and repair the counters
//! under a per-SKU advisory lock. Repair never manufactures saleable
//! stock: a correction that would push remaining negative is logged
//! as a discrepancy for human intervention instead.
//!
//! This is the only component allowed to write the sold counter
//! outside the deduct/restore scripts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::FlashSaleError;
use super::inventory::InventoryEngine;
use super::repository::{ActivityRepository, OrderRepository, ReconciliationRepository};
use super::types::{Activity, Discrepancy, OrderStatus, ReconStatus, ReconciliationLog};
use crate::config::ReconcilerConfig;
use crate::store::{FastStore, keys};

/// Outcome of one per-SKU run, for logs and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconOutcome {
    /// Counters agree with the durable store
    Normal,
    /// Discrepancies found and repaired
    Repaired { discrepancies: usize },
    /// Discrepancies found but repair refused (would create stock)
    NeedsIntervention { discrepancies: usize },
    /// Another instance holds the repair lock
    Locked,
    /// The SKU has no stock cell (torn down or never warmed)
    NoCell,
}

pub struct Reconciler {
    store: Arc<dyn FastStore>,
    orders: Arc<dyn OrderRepository>,
    activities: Arc<dyn ActivityRepository>,
    recon_logs: Arc<dyn ReconciliationRepository>,
    inventory: Arc<InventoryEngine>,
    config: ReconcilerConfig,
    /// Retention horizon shared with the lifecycle manager
    retention_secs: u64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn FastStore>,
        orders: Arc<dyn OrderRepository>,
        activities: Arc<dyn ActivityRepository>,
        recon_logs: Arc<dyn ReconciliationRepository>,
        inventory: Arc<InventoryEngine>,
        config: ReconcilerConfig,
        retention_secs: u64,
    ) -> Self {
        Self {
            store,
            orders,
            activities,
            recon_logs,
            inventory,
            config,
            retention_secs,
        }
    }

    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.config.interval_secs,
            "Starting reconciler"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.reconcile_all().await {
                error!(error = %e, "Reconcile pass failed");
            }
        }
    }

    /// One pass over every managed SKU.
    pub async fn reconcile_all(&self) -> Result<(), FlashSaleError> {
        let horizon = Utc::now() - chrono::Duration::seconds(self.retention_secs as i64);
        let managed = self.activities.list_managed(horizon).await?;
        for activity in managed {
            match self.reconcile_sku(&activity).await {
                Ok(ReconOutcome::Normal) | Ok(ReconOutcome::NoCell) | Ok(ReconOutcome::Locked) => {}
                Ok(ReconOutcome::Repaired { discrepancies }) => {
                    info!(
                        sku_id = activity.sku_id,
                        discrepancies, "Reconciler repaired stock counters"
                    );
                }
                Ok(ReconOutcome::NeedsIntervention { discrepancies }) => {
                    warn!(
                        sku_id = activity.sku_id,
                        discrepancies, "Reconciler found unrepairable discrepancy"
                    );
                }
                Err(e) => {
                    error!(sku_id = activity.sku_id, error = %e, "SKU reconcile failed");
                }
            }
        }
        Ok(())
    }

    /// Check and repair one SKU under its advisory lock.
    pub async fn reconcile_sku(&self, activity: &Activity) -> Result<ReconOutcome, FlashSaleError> {
        let sku_id = activity.sku_id;
        let lock_key = keys::sku_repair_lock(sku_id);
        let holder = Uuid::new_v4().simple().to_string();

        if !self
            .store
            .try_lock(&lock_key, &holder, self.config.repair_lock_ttl_secs)
            .await?
        {
            return Ok(ReconOutcome::Locked);
        }
        let outcome = self.reconcile_locked(activity).await;
        if let Err(e) = self.store.unlock(&lock_key, &holder).await {
            warn!(sku_id, error = %e, "Repair lock release failed (lease will expire)");
        }
        outcome
    }

    async fn reconcile_locked(&self, activity: &Activity) -> Result<ReconOutcome, FlashSaleError> {
        let sku_id = activity.sku_id;

        // Cancel raced-in over-limit orders first so the durable
        // count below is already the corrected truth.
        self.cancel_over_limit(activity).await?;

        let Some(cell) = self.store.stock_info(sku_id).await? else {
            return Ok(ReconOutcome::NoCell);
        };
        let durable_count = self.orders.count_active_for_sku(sku_id).await? as i64;
        let total = activity.total_stock as i64;

        let mut discrepancies = Vec::new();
        if cell.sold != durable_count {
            discrepancies.push(Discrepancy::OrderCountMismatch {
                redis_sold: cell.sold,
                durable: durable_count,
            });
        }
        if cell.remaining + cell.sold != total {
            discrepancies.push(Discrepancy::TotalStockMismatch {
                redis_stock: cell.remaining,
                redis_sold: cell.sold,
                total_stock: total,
            });
        }
        let expected_remaining = total - durable_count;
        if cell.remaining != expected_remaining {
            discrepancies.push(Discrepancy::StockMismatch {
                expected: expected_remaining,
                actual: cell.remaining,
            });
        }

        let mut log = ReconciliationLog {
            sku_id,
            redis_stock: cell.remaining,
            redis_sold: cell.sold,
            durable_order_count: durable_count,
            discrepancies: discrepancies.clone(),
            status: ReconStatus::Normal,
        };

        if discrepancies.is_empty() {
            self.recon_logs.append(&log).await?;
            return Ok(ReconOutcome::Normal);
        }

        log.status = ReconStatus::Discrepancy;
        let count = discrepancies.len();

        let correct_sold = durable_count;
        let correct_remaining = total - correct_sold;
        if correct_remaining < 0 {
            // More durable orders than total stock: repairing would
            // mean inventing inventory. Leave the row at Discrepancy.
            self.recon_logs.append(&log).await?;
            return Ok(ReconOutcome::NeedsIntervention {
                discrepancies: count,
            });
        }

        let log_id = self.recon_logs.append(&log).await?;
        self.store
            .force_set_stock(sku_id, correct_remaining as u64, correct_sold as u64)
            .await?;
        self.recon_logs.mark_fixed(log_id).await?;
        Ok(ReconOutcome::Repaired {
            discrepancies: count,
        })
    }

    /// Cancel PendingPayment orders beyond the per-user limit and
    /// restore their stock. The user sees OverLimit on their next
    /// status query.
    async fn cancel_over_limit(&self, activity: &Activity) -> Result<(), FlashSaleError> {
        let excess = self
            .orders
            .over_limit_pending(activity.sku_id, activity.per_user_limit)
            .await?;
        for order in excess {
            let moved = self
                .orders
                .transition(
                    order.order_id,
                    OrderStatus::PendingPayment,
                    OrderStatus::Cancelled,
                )
                .await?;
            if !moved {
                continue;
            }
            info!(
                order_id = %order.order_id,
                user_id = order.user_id,
                sku_id = order.sku_id,
                "Cancelled over-limit order"
            );
            if let Err(e) = self
                .inventory
                .rollback(order.sku_id, order.order_id, order.qty)
                .await
            {
                error!(order_id = %order.order_id, error = %e, "Over-limit rollback failed");
            }
        }
        Ok(())
    }
}
