//! Lifecycle Manager - activity state machine and stock warmup
//!
//! ```text
//! NotStarted ──start_ts/manual──▶ InProgress ──end_ts/manual/stock=0──▶ Ended
//! ```
//!
//! Transitions are CAS updates on the durable row, so concurrent
//! tickers and manual calls cannot double-run the side effects
//! (warmup at start, admission close at end). Ended activities keep
//! their fast-store keys for the reconciler until the retention
//! window elapses, then teardown deletes them.
//!
//! The in-process activity cache is a read-only replica refreshed on
//! every tick; the hot path never queries the durable store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{error, info, warn};

use super::admission::AdmissionGate;
use super::error::FlashSaleError;
use super::inventory::InventoryEngine;
use super::repository::ActivityRepository;
use super::types::{Activity, ActivityStatus};
use crate::config::{AdmissionConfig, LifecycleConfig};
use crate::core_types::{ActivityId, SkuId};
use crate::store::FastStore;

pub struct LifecycleManager {
    activities: Arc<dyn ActivityRepository>,
    inventory: Arc<InventoryEngine>,
    admission: Arc<AdmissionGate>,
    store: Arc<dyn FastStore>,
    config: LifecycleConfig,
    admission_config: AdmissionConfig,
    /// sku_id -> latest managed activity; read-only replica for the
    /// request hot path
    cache: DashMap<SkuId, Activity>,
}

impl LifecycleManager {
    pub fn new(
        activities: Arc<dyn ActivityRepository>,
        inventory: Arc<InventoryEngine>,
        admission: Arc<AdmissionGate>,
        store: Arc<dyn FastStore>,
        config: LifecycleConfig,
        admission_config: AdmissionConfig,
    ) -> Self {
        Self {
            activities,
            inventory,
            admission,
            store,
            config,
            admission_config,
            cache: DashMap::new(),
        }
    }

    pub async fn run(&self) -> ! {
        info!(
            tick_secs = self.config.tick_secs,
            retention_secs = self.config.retention_secs,
            "Starting lifecycle manager"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "Lifecycle tick failed");
            }
        }
    }

    /// One pass: auto transitions by time, sold-out observation,
    /// cache refresh, teardown of retired keys.
    pub async fn tick(&self) -> Result<(), FlashSaleError> {
        let now = Utc::now();
        let retention = chrono::Duration::seconds(self.config.retention_secs as i64);
        let managed = self.activities.list_managed(now - retention).await?;

        for activity in &managed {
            match activity.status {
                ActivityStatus::NotStarted if now >= activity.start_ts => {
                    if let Err(e) = self.start_activity(activity.activity_id).await {
                        error!(activity_id = activity.activity_id, error = %e, "Auto start failed");
                    }
                }
                ActivityStatus::InProgress => {
                    if now >= activity.end_ts {
                        if let Err(e) = self.end_activity(activity.activity_id).await {
                            error!(activity_id = activity.activity_id, error = %e, "Auto end failed");
                        }
                    } else if self.stock_exhausted(activity.sku_id).await {
                        info!(
                            activity_id = activity.activity_id,
                            sku_id = activity.sku_id,
                            "Stock exhausted, ending activity"
                        );
                        if let Err(e) = self.end_activity(activity.activity_id).await {
                            error!(activity_id = activity.activity_id, error = %e, "Sold-out end failed");
                        }
                    }
                }
                _ => {}
            }
        }

        // Refresh the replica after transitions so readers see the
        // post-tick world.
        let managed = self.activities.list_managed(now - retention).await?;
        self.cache.clear();
        for activity in managed {
            self.cache.insert(activity.sku_id, activity);
        }

        self.teardown_retired(now - retention).await;
        Ok(())
    }

    /// NotStarted -> InProgress. Warms the stock cell and configures
    /// the admission bucket. The CAS means exactly one caller runs
    /// the warmup.
    pub async fn start_activity(&self, activity_id: ActivityId) -> Result<(), FlashSaleError> {
        let activity = self
            .activities
            .get(activity_id)
            .await?
            .ok_or(FlashSaleError::ActivityNotFound(activity_id))?;

        let moved = self
            .activities
            .set_status(activity_id, ActivityStatus::NotStarted, ActivityStatus::InProgress)
            .await?;
        if !moved {
            return Err(FlashSaleError::InvalidTransition(format!(
                "activity {activity_id} is not NotStarted"
            )));
        }

        self.inventory
            .warmup(activity.sku_id, activity.total_stock, false)
            .await?;
        self.admission
            .configure(
                activity.sku_id,
                self.admission_config.token_rate,
                self.admission_config.token_capacity,
            )
            .await?;

        self.cache.insert(
            activity.sku_id,
            Activity {
                status: ActivityStatus::InProgress,
                ..activity.clone()
            },
        );
        info!(
            activity_id,
            sku_id = activity.sku_id,
            total_stock = activity.total_stock,
            "Activity started"
        );
        Ok(())
    }

    /// InProgress -> Ended. New deducts are rejected immediately;
    /// requests already past the state check finish or roll back on
    /// their own.
    pub async fn end_activity(&self, activity_id: ActivityId) -> Result<(), FlashSaleError> {
        let activity = self
            .activities
            .get(activity_id)
            .await?
            .ok_or(FlashSaleError::ActivityNotFound(activity_id))?;

        let moved = self
            .activities
            .set_status(activity_id, ActivityStatus::InProgress, ActivityStatus::Ended)
            .await?;
        if !moved {
            return Err(FlashSaleError::InvalidTransition(format!(
                "activity {activity_id} is not InProgress"
            )));
        }

        if let Err(e) = self.admission.notify_sold_out(activity.sku_id).await {
            warn!(activity_id, error = %e, "Failed to close admission on end");
        }

        self.cache.insert(
            activity.sku_id,
            Activity {
                status: ActivityStatus::Ended,
                ..activity.clone()
            },
        );
        info!(activity_id, sku_id = activity.sku_id, "Activity ended");
        Ok(())
    }

    /// Current activity for a SKU from the replica, falling back to
    /// the durable store on a cold cache.
    pub async fn current_for_sku(&self, sku_id: SkuId) -> Result<Option<Activity>, FlashSaleError> {
        if let Some(activity) = self.cache.get(&sku_id) {
            return Ok(Some(activity.clone()));
        }
        let activity = self.activities.by_sku(sku_id).await?;
        if let Some(ref a) = activity {
            self.cache.insert(sku_id, a.clone());
        }
        Ok(activity)
    }

    async fn stock_exhausted(&self, sku_id: SkuId) -> bool {
        match self.store.stock_info(sku_id).await {
            Ok(Some(cell)) => cell.remaining <= 0,
            _ => false,
        }
    }

    async fn teardown_retired(&self, cutoff: chrono::DateTime<Utc>) {
        let retired = match self.activities.list_ended_before(cutoff, 50).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Teardown listing failed");
                return;
            }
        };
        for activity in retired {
            if let Err(e) = self.store.clear_sku(activity.sku_id).await {
                warn!(sku_id = activity.sku_id, error = %e, "Teardown failed");
            }
        }
    }
}
