//! Repository traits for flash-sale data access
//!
//! Traits abstract the durable store so the engine, sweeper and
//! reconciler can be exercised against in-memory fakes; the Pg
//! implementations are the production path. Status transitions use
//! optimistic `WHERE status = $from` predicates - a false return
//! means another writer won the race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::error::FlashSaleError;
use super::types::{
    Activity, ActivityStatus, Order, OrderStatus, ReconStatus, ReconciliationLog, StockLog,
    StockOp,
};
use crate::core_types::{ActivityId, SkuId, UserId};

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Insert a PendingPayment order; false when the order_id already
    /// exists (bus redelivery).
    async fn insert_pending(&self, order: &Order) -> Result<bool, FlashSaleError>;

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, FlashSaleError>;

    /// Optimistic status transition. Stamps paid_at/cancelled_at as
    /// appropriate for the target status. True when this call moved it.
    async fn transition(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, FlashSaleError>;

    /// Orders in stock-holding statuses for (user, sku) - the
    /// per-user-limit count.
    async fn count_active_for_user(
        &self,
        user_id: UserId,
        sku_id: SkuId,
    ) -> Result<u64, FlashSaleError>;

    /// Orders in stock-holding statuses for a SKU - the reconciler's
    /// durable truth.
    async fn count_active_for_sku(&self, sku_id: SkuId) -> Result<u64, FlashSaleError>;

    /// PendingPayment orders created before the cutoff, oldest first,
    /// bounded.
    async fn expired_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, FlashSaleError>;

    /// PendingPayment orders beyond `per_user_limit` per user for a
    /// SKU (latest beyond the limit, per user). Raced-in over-limit
    /// deducts show up here for the reconciler to cancel.
    async fn over_limit_pending(
        &self,
        sku_id: SkuId,
        per_user_limit: u32,
    ) -> Result<Vec<Order>, FlashSaleError>;

    /// Materializer batch: insert orders and their deduct logs in one
    /// transaction. Rows already present are skipped (redelivery).
    /// Returns the number of orders actually inserted.
    async fn materialize(&self, batch: &[(Order, StockLog)]) -> Result<u64, FlashSaleError>;
}

#[async_trait]
pub trait StockLogRepository: Send + Sync {
    /// Append one log row; false when (order_id, op) already exists.
    /// That false is the idempotency short-circuit for rollbacks.
    async fn append(&self, log: &StockLog) -> Result<bool, FlashSaleError>;

    async fn exists(&self, order_id: Uuid, op: StockOp) -> Result<bool, FlashSaleError>;
}

#[async_trait]
pub trait ActivityRepository: Send + Sync {
    async fn create(&self, activity: &Activity) -> Result<ActivityId, FlashSaleError>;

    async fn get(&self, activity_id: ActivityId) -> Result<Option<Activity>, FlashSaleError>;

    /// The most recent activity for a SKU
    async fn by_sku(&self, sku_id: SkuId) -> Result<Option<Activity>, FlashSaleError>;

    /// Activities the lifecycle ticker still drives (not torn down):
    /// NotStarted, InProgress, and Ended within the retention window.
    async fn list_managed(
        &self,
        ended_after: DateTime<Utc>,
    ) -> Result<Vec<Activity>, FlashSaleError>;

    /// Ended activities whose keys are due for teardown, bounded.
    async fn list_ended_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Activity>, FlashSaleError>;

    /// Optimistic status transition; true when this call moved it.
    async fn set_status(
        &self,
        activity_id: ActivityId,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool, FlashSaleError>;
}

#[async_trait]
pub trait ReconciliationRepository: Send + Sync {
    /// Append a run log; returns the row id.
    async fn append(&self, log: &ReconciliationLog) -> Result<i64, FlashSaleError>;

    /// The only permitted mutation: Discrepancy -> Fixed.
    async fn mark_fixed(&self, id: i64) -> Result<(), FlashSaleError>;
}

// ============================================================================
// PostgreSQL implementations
// ============================================================================

fn row_to_order(row: &sqlx::postgres::PgRow) -> Result<Order, FlashSaleError> {
    let status_id: i16 = row.get("status");
    let status = OrderStatus::from_id(status_id)
        .ok_or_else(|| FlashSaleError::Database(format!("invalid order status: {status_id}")))?;
    Ok(Order {
        order_id: row.get("order_id"),
        user_id: row.get::<i64, _>("user_id") as u64,
        sku_id: row.get::<i64, _>("sku_id") as u64,
        activity_id: row.get::<i64, _>("activity_id") as u64,
        qty: row.get::<i32, _>("qty") as u32,
        status,
        created_at: row.get("created_at"),
        paid_at: row.get("paid_at"),
        cancelled_at: row.get("cancelled_at"),
    })
}

const ORDER_COLUMNS: &str =
    "order_id, user_id, sku_id, activity_id, qty, status, created_at, paid_at, cancelled_at";

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn insert_pending(&self, order: &Order) -> Result<bool, FlashSaleError> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (order_id, user_id, sku_id, activity_id, qty, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order.order_id)
        .bind(order.user_id as i64)
        .bind(order.sku_id as i64)
        .bind(order.activity_id as i64)
        .bind(order.qty as i32)
        .bind(OrderStatus::PendingPayment.id())
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, order_id: Uuid) -> Result<Option<Order>, FlashSaleError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn transition(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, FlashSaleError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $1,
                paid_at = CASE WHEN $1 = 1 THEN NOW() ELSE paid_at END,
                cancelled_at = CASE WHEN $1 IN (2, 3) THEN NOW() ELSE cancelled_at END
            WHERE order_id = $2 AND status = $3
            "#,
        )
        .bind(to.id())
        .bind(order_id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_active_for_user(
        &self,
        user_id: UserId,
        sku_id: SkuId,
    ) -> Result<u64, FlashSaleError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM orders WHERE user_id = $1 AND sku_id = $2 AND status IN (0, 1)",
        )
        .bind(user_id as i64)
        .bind(sku_id as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn count_active_for_sku(&self, sku_id: SkuId) -> Result<u64, FlashSaleError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE sku_id = $1 AND status IN (0, 1)")
                .bind(sku_id as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn expired_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, FlashSaleError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status = 0 AND created_at < $1 \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    async fn over_limit_pending(
        &self,
        sku_id: SkuId,
        per_user_limit: u32,
    ) -> Result<Vec<Order>, FlashSaleError> {
        // Rank stock-holding orders per user by age; pending rows past
        // the limit are the raced-in excess. Paid rows are never
        // cancelled here.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY user_id ORDER BY created_at ASC
                ) AS rn
                FROM orders
                WHERE sku_id = $1 AND status IN (0, 1)
            ) ranked
            WHERE rn > $2 AND status = 0
            "#
        ))
        .bind(sku_id as i64)
        .bind(per_user_limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_order).collect()
    }

    async fn materialize(&self, batch: &[(Order, StockLog)]) -> Result<u64, FlashSaleError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for (order, log) in batch {
            let result = sqlx::query(
                r#"
                INSERT INTO orders (order_id, user_id, sku_id, activity_id, qty, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (order_id) DO NOTHING
                "#,
            )
            .bind(order.order_id)
            .bind(order.user_id as i64)
            .bind(order.sku_id as i64)
            .bind(order.activity_id as i64)
            .bind(order.qty as i32)
            .bind(OrderStatus::PendingPayment.id())
            .bind(order.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();

            sqlx::query(
                r#"
                INSERT INTO stock_logs (sku_id, order_id, op, qty, stock_before, stock_after)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (order_id, op) DO NOTHING
                "#,
            )
            .bind(log.sku_id as i64)
            .bind(log.order_id)
            .bind(log.op.id())
            .bind(log.qty as i32)
            .bind(log.stock_before)
            .bind(log.stock_after)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

pub struct PgStockLogRepository {
    pool: PgPool,
}

impl PgStockLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StockLogRepository for PgStockLogRepository {
    async fn append(&self, log: &StockLog) -> Result<bool, FlashSaleError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stock_logs (sku_id, order_id, op, qty, stock_before, stock_after)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (order_id, op) DO NOTHING
            "#,
        )
        .bind(log.sku_id as i64)
        .bind(log.order_id)
        .bind(log.op.id())
        .bind(log.qty as i32)
        .bind(log.stock_before)
        .bind(log.stock_after)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, order_id: Uuid, op: StockOp) -> Result<bool, FlashSaleError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM stock_logs WHERE order_id = $1 AND op = $2)",
        )
        .bind(order_id)
        .bind(op.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

fn row_to_activity(row: &sqlx::postgres::PgRow) -> Result<Activity, FlashSaleError> {
    let status_id: i16 = row.get("status");
    let status = ActivityStatus::from_id(status_id).ok_or_else(|| {
        FlashSaleError::Database(format!("invalid activity status: {status_id}"))
    })?;
    Ok(Activity {
        activity_id: row.get::<i64, _>("activity_id") as u64,
        sku_id: row.get::<i64, _>("sku_id") as u64,
        name: row.get("name"),
        total_stock: row.get::<i64, _>("total_stock") as u64,
        per_user_limit: row.get::<i32, _>("per_user_limit") as u32,
        start_ts: row.get("start_ts"),
        end_ts: row.get("end_ts"),
        status,
        updated_at: row.get("updated_at"),
    })
}

const ACTIVITY_COLUMNS: &str =
    "activity_id, sku_id, name, total_stock, per_user_limit, start_ts, end_ts, status, updated_at";

pub struct PgActivityRepository {
    pool: PgPool,
}

impl PgActivityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivityRepository for PgActivityRepository {
    async fn create(&self, activity: &Activity) -> Result<ActivityId, FlashSaleError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO activities (sku_id, name, total_stock, per_user_limit, start_ts, end_ts, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING activity_id
            "#,
        )
        .bind(activity.sku_id as i64)
        .bind(&activity.name)
        .bind(activity.total_stock as i64)
        .bind(activity.per_user_limit as i32)
        .bind(activity.start_ts)
        .bind(activity.end_ts)
        .bind(activity.status.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(id as u64)
    }

    async fn get(&self, activity_id: ActivityId) -> Result<Option<Activity>, FlashSaleError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities WHERE activity_id = $1"
        ))
        .bind(activity_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_activity).transpose()
    }

    async fn by_sku(&self, sku_id: SkuId) -> Result<Option<Activity>, FlashSaleError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities \
             WHERE sku_id = $1 ORDER BY activity_id DESC LIMIT 1"
        ))
        .bind(sku_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_activity).transpose()
    }

    async fn list_managed(
        &self,
        ended_after: DateTime<Utc>,
    ) -> Result<Vec<Activity>, FlashSaleError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities \
             WHERE status IN (0, 1) OR (status = 2 AND updated_at >= $1) \
             ORDER BY activity_id ASC"
        ))
        .bind(ended_after)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_activity).collect()
    }

    async fn list_ended_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Activity>, FlashSaleError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM activities \
             WHERE status = 2 AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_activity).collect()
    }

    async fn set_status(
        &self,
        activity_id: ActivityId,
        from: ActivityStatus,
        to: ActivityStatus,
    ) -> Result<bool, FlashSaleError> {
        let result = sqlx::query(
            "UPDATE activities SET status = $1, updated_at = NOW() \
             WHERE activity_id = $2 AND status = $3",
        )
        .bind(to.id())
        .bind(activity_id as i64)
        .bind(from.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct PgReconciliationRepository {
    pool: PgPool,
}

impl PgReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconciliationRepository for PgReconciliationRepository {
    async fn append(&self, log: &ReconciliationLog) -> Result<i64, FlashSaleError> {
        let discrepancies = serde_json::to_value(&log.discrepancies)
            .map_err(|e| FlashSaleError::System(e.to_string()))?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO reconciliation_logs
                (sku_id, redis_stock, redis_sold, durable_order_count, discrepancies, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(log.sku_id as i64)
        .bind(log.redis_stock)
        .bind(log.redis_sold)
        .bind(log.durable_order_count)
        .bind(discrepancies)
        .bind(log.status.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_fixed(&self, id: i64) -> Result<(), FlashSaleError> {
        sqlx::query("UPDATE reconciliation_logs SET status = $1 WHERE id = $2 AND status = $3")
            .bind(ReconStatus::Fixed.id())
            .bind(id)
            .bind(ReconStatus::Discrepancy.id())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation (tests, local runs)
// ============================================================================

pub mod memory {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

    use super::*;

    /// One struct backing all four repository traits, so the order
    /// and stock-log views stay consistent the way a single database
    /// keeps them consistent.
    #[derive(Default)]
    pub struct MemoryFlashSaleRepository {
        orders: Mutex<HashMap<Uuid, Order>>,
        stock_logs: Mutex<Vec<StockLog>>,
        log_keys: Mutex<HashSet<(Uuid, i16)>>,
        activities: Mutex<HashMap<ActivityId, Activity>>,
        next_activity_id: AtomicU64,
        recon_logs: Mutex<Vec<(i64, ReconciliationLog)>>,
        next_recon_id: AtomicI64,
    }

    impl MemoryFlashSaleRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn order_count(&self) -> usize {
            self.orders.lock().expect("repo poisoned").len()
        }

        pub fn logs_for(&self, order_id: Uuid) -> Vec<StockLog> {
            self.stock_logs
                .lock()
                .expect("repo poisoned")
                .iter()
                .filter(|l| l.order_id == order_id)
                .cloned()
                .collect()
        }

        pub fn all_orders(&self) -> Vec<Order> {
            self.orders
                .lock()
                .expect("repo poisoned")
                .values()
                .cloned()
                .collect()
        }

        pub fn recon_history(&self) -> Vec<(i64, ReconciliationLog)> {
            self.recon_logs.lock().expect("repo poisoned").clone()
        }

        fn append_log(&self, log: &StockLog) -> bool {
            let key = (log.order_id, log.op.id());
            let mut keys = self.log_keys.lock().expect("repo poisoned");
            if !keys.insert(key) {
                return false;
            }
            self.stock_logs
                .lock()
                .expect("repo poisoned")
                .push(log.clone());
            true
        }
    }

    #[async_trait]
    impl OrderRepository for MemoryFlashSaleRepository {
        async fn insert_pending(&self, order: &Order) -> Result<bool, FlashSaleError> {
            let mut orders = self.orders.lock().expect("repo poisoned");
            if orders.contains_key(&order.order_id) {
                return Ok(false);
            }
            orders.insert(
                order.order_id,
                Order {
                    status: OrderStatus::PendingPayment,
                    ..order.clone()
                },
            );
            Ok(true)
        }

        async fn get(&self, order_id: Uuid) -> Result<Option<Order>, FlashSaleError> {
            Ok(self
                .orders
                .lock()
                .expect("repo poisoned")
                .get(&order_id)
                .cloned())
        }

        async fn transition(
            &self,
            order_id: Uuid,
            from: OrderStatus,
            to: OrderStatus,
        ) -> Result<bool, FlashSaleError> {
            let mut orders = self.orders.lock().expect("repo poisoned");
            match orders.get_mut(&order_id) {
                Some(order) if order.status == from => {
                    order.status = to;
                    match to {
                        OrderStatus::Paid => order.paid_at = Some(Utc::now()),
                        OrderStatus::Cancelled | OrderStatus::Timeout => {
                            order.cancelled_at = Some(Utc::now())
                        }
                        OrderStatus::PendingPayment => {}
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn count_active_for_user(
            &self,
            user_id: UserId,
            sku_id: SkuId,
        ) -> Result<u64, FlashSaleError> {
            Ok(self
                .orders
                .lock()
                .expect("repo poisoned")
                .values()
                .filter(|o| o.user_id == user_id && o.sku_id == sku_id && o.status.holds_stock())
                .count() as u64)
        }

        async fn count_active_for_sku(&self, sku_id: SkuId) -> Result<u64, FlashSaleError> {
            Ok(self
                .orders
                .lock()
                .expect("repo poisoned")
                .values()
                .filter(|o| o.sku_id == sku_id && o.status.holds_stock())
                .count() as u64)
        }

        async fn expired_pending(
            &self,
            cutoff: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<Order>, FlashSaleError> {
            let mut stale: Vec<Order> = self
                .orders
                .lock()
                .expect("repo poisoned")
                .values()
                .filter(|o| o.status == OrderStatus::PendingPayment && o.created_at < cutoff)
                .cloned()
                .collect();
            stale.sort_by_key(|o| o.created_at);
            stale.truncate(limit.max(0) as usize);
            Ok(stale)
        }

        async fn over_limit_pending(
            &self,
            sku_id: SkuId,
            per_user_limit: u32,
        ) -> Result<Vec<Order>, FlashSaleError> {
            let orders = self.orders.lock().expect("repo poisoned");
            let mut per_user: HashMap<UserId, Vec<&Order>> = HashMap::new();
            for order in orders.values() {
                if order.sku_id == sku_id && order.status.holds_stock() {
                    per_user.entry(order.user_id).or_default().push(order);
                }
            }
            let mut excess = Vec::new();
            for (_, mut held) in per_user {
                held.sort_by_key(|o| o.created_at);
                for order in held.into_iter().skip(per_user_limit as usize) {
                    if order.status == OrderStatus::PendingPayment {
                        excess.push(order.clone());
                    }
                }
            }
            Ok(excess)
        }

        async fn materialize(
            &self,
            batch: &[(Order, StockLog)],
        ) -> Result<u64, FlashSaleError> {
            let mut inserted = 0u64;
            for (order, log) in batch {
                if self.insert_pending(order).await? {
                    inserted += 1;
                }
                self.append_log(log);
            }
            Ok(inserted)
        }
    }

    #[async_trait]
    impl StockLogRepository for MemoryFlashSaleRepository {
        async fn append(&self, log: &StockLog) -> Result<bool, FlashSaleError> {
            Ok(self.append_log(log))
        }

        async fn exists(&self, order_id: Uuid, op: StockOp) -> Result<bool, FlashSaleError> {
            Ok(self
                .log_keys
                .lock()
                .expect("repo poisoned")
                .contains(&(order_id, op.id())))
        }
    }

    #[async_trait]
    impl ActivityRepository for MemoryFlashSaleRepository {
        async fn create(&self, activity: &Activity) -> Result<ActivityId, FlashSaleError> {
            let id = self.next_activity_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.activities.lock().expect("repo poisoned").insert(
                id,
                Activity {
                    activity_id: id,
                    updated_at: Utc::now(),
                    ..activity.clone()
                },
            );
            Ok(id)
        }

        async fn get(
            &self,
            activity_id: ActivityId,
        ) -> Result<Option<Activity>, FlashSaleError> {
            Ok(self
                .activities
                .lock()
                .expect("repo poisoned")
                .get(&activity_id)
                .cloned())
        }

        async fn by_sku(&self, sku_id: SkuId) -> Result<Option<Activity>, FlashSaleError> {
            Ok(self
                .activities
                .lock()
                .expect("repo poisoned")
                .values()
                .filter(|a| a.sku_id == sku_id)
                .max_by_key(|a| a.activity_id)
                .cloned())
        }

        async fn list_managed(
            &self,
            ended_after: DateTime<Utc>,
        ) -> Result<Vec<Activity>, FlashSaleError> {
            let mut list: Vec<Activity> = self
                .activities
                .lock()
                .expect("repo poisoned")
                .values()
                .filter(|a| {
                    a.status != ActivityStatus::Ended || a.updated_at >= ended_after
                })
                .cloned()
                .collect();
            list.sort_by_key(|a| a.activity_id);
            Ok(list)
        }

        async fn list_ended_before(
            &self,
            cutoff: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<Activity>, FlashSaleError> {
            let mut list: Vec<Activity> = self
                .activities
                .lock()
                .expect("repo poisoned")
                .values()
                .filter(|a| a.status == ActivityStatus::Ended && a.updated_at < cutoff)
                .cloned()
                .collect();
            list.sort_by_key(|a| a.updated_at);
            list.truncate(limit.max(0) as usize);
            Ok(list)
        }

        async fn set_status(
            &self,
            activity_id: ActivityId,
            from: ActivityStatus,
            to: ActivityStatus,
        ) -> Result<bool, FlashSaleError> {
            let mut activities = self.activities.lock().expect("repo poisoned");
            match activities.get_mut(&activity_id) {
                Some(activity) if activity.status == from => {
                    activity.status = to;
                    activity.updated_at = Utc::now();
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    #[async_trait]
    impl ReconciliationRepository for MemoryFlashSaleRepository {
        async fn append(&self, log: &ReconciliationLog) -> Result<i64, FlashSaleError> {
            let id = self.next_recon_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.recon_logs
                .lock()
                .expect("repo poisoned")
                .push((id, log.clone()));
            Ok(id)
        }

        async fn mark_fixed(&self, id: i64) -> Result<(), FlashSaleError> {
            let mut logs = self.recon_logs.lock().expect("repo poisoned");
            if let Some((_, log)) = logs.iter_mut().find(|(log_id, _)| *log_id == id) {
                if log.status == ReconStatus::Discrepancy {
                    log.status = ReconStatus::Fixed;
                }
            }
            Ok(())
        }
    }
}
