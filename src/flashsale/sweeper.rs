//! Timeout & Rollback Sweeper
//!
//! Periodically cancels PendingPayment orders older than the payment
//! window and restores their stock. The optimistic transition and the
//! rollback-log gate make a tick safe to repeat and safe to race with
//! payments and other sweeper instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::error::FlashSaleError;
use super::inventory::InventoryEngine;
use super::repository::OrderRepository;
use super::types::OrderStatus;
use crate::config::OrderConfig;
use crate::store::{FastStore, keys};

pub struct TimeoutSweeper {
    orders: Arc<dyn OrderRepository>,
    inventory: Arc<InventoryEngine>,
    store: Arc<dyn FastStore>,
    config: OrderConfig,
}

impl TimeoutSweeper {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        inventory: Arc<InventoryEngine>,
        store: Arc<dyn FastStore>,
        config: OrderConfig,
    ) -> Self {
        Self {
            orders,
            inventory,
            store,
            config,
        }
    }

    pub async fn run(&self) -> ! {
        info!(
            payment_window_secs = self.config.payment_window_secs,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Starting timeout sweeper"
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(n) => info!(swept = n, "Sweeper cancelled stale orders"),
                Err(e) => error!(error = %e, "Sweep failed"),
            }
        }
    }

    /// One bounded sweep. Returns how many orders were timed out.
    pub async fn sweep_once(&self) -> Result<u64, FlashSaleError> {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.payment_window_secs as i64);
        let stale = self
            .orders
            .expired_pending(cutoff, self.config.sweep_batch)
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let mut swept = 0u64;
        for order in stale {
            // Another instance or a concurrent payment may win; then
            // this order is no longer ours to touch.
            let moved = self
                .orders
                .transition(order.order_id, OrderStatus::PendingPayment, OrderStatus::Timeout)
                .await?;
            if !moved {
                debug!(order_id = %order.order_id, "Lost timeout race, skipping");
                continue;
            }

            if let Err(e) = self
                .inventory
                .rollback(order.sku_id, order.order_id, order.qty)
                .await
            {
                // The order is already Timeout; the rollback retries
                // on the next tick via the reconciler's repair.
                error!(order_id = %order.order_id, error = %e, "Rollback after timeout failed");
            }

            if let Err(e) = self
                .store
                .cache_put(
                    &keys::order_status(&order.order_id.to_string()),
                    OrderStatus::Timeout.as_str(),
                    self.config.order_status_ttl_secs,
                )
                .await
            {
                warn!(order_id = %order.order_id, error = %e, "Status cache write failed");
            }
            swept += 1;
        }
        Ok(swept)
    }
}
