//! Flash-sale domain types
//!
//! Rows of the durable store plus the bus event that links a
//! fast-store deduct to its durable order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core_types::{ActivityId, SkuId, UserId};

// ============================================================
// ACTIVITY
// ============================================================

/// Activity state machine:
///
/// ```text
/// NotStarted ──start_ts/manual──▶ InProgress ──end_ts/manual/stock=0──▶ Ended
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityStatus {
    NotStarted,
    InProgress,
    Ended,
}

impl ActivityStatus {
    pub fn id(&self) -> i16 {
        match self {
            ActivityStatus::NotStarted => 0,
            ActivityStatus::InProgress => 1,
            ActivityStatus::Ended => 2,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(ActivityStatus::NotStarted),
            1 => Some(ActivityStatus::InProgress),
            2 => Some(ActivityStatus::Ended),
            _ => None,
        }
    }
}

/// A scheduled flash sale: one SKU, a stock total, a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub activity_id: ActivityId,
    pub sku_id: SkuId,
    pub name: String,
    pub total_stock: u64,
    pub per_user_limit: u32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub status: ActivityStatus,
    pub updated_at: DateTime<Utc>,
}

impl Activity {
    /// Deducts are admitted only while the sale is live. The start
    /// side is governed by status alone so a manual early start
    /// works; the end bound also holds against a lagging ticker.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == ActivityStatus::InProgress && now < self.end_ts
    }
}

// ============================================================
// ORDER
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    Cancelled,
    Timeout,
}

impl OrderStatus {
    pub fn id(&self) -> i16 {
        match self {
            OrderStatus::PendingPayment => 0,
            OrderStatus::Paid => 1,
            OrderStatus::Cancelled => 2,
            OrderStatus::Timeout => 3,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderStatus::PendingPayment),
            1 => Some(OrderStatus::Paid),
            2 => Some(OrderStatus::Cancelled),
            3 => Some(OrderStatus::Timeout),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn from_str_cached(s: &str) -> Option<Self> {
        match s {
            "PENDING_PAYMENT" => Some(OrderStatus::PendingPayment),
            "PAID" => Some(OrderStatus::Paid),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "TIMEOUT" => Some(OrderStatus::Timeout),
            _ => None,
        }
    }

    /// Statuses that count against stock and the per-user limit
    pub fn holds_stock(&self) -> bool {
        matches!(self, OrderStatus::PendingPayment | OrderStatus::Paid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub user_id: UserId,
    pub sku_id: SkuId,
    pub activity_id: ActivityId,
    pub qty: u32,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

// ============================================================
// STOCK LOG
// ============================================================

/// Every inventory mutation appends exactly one row per
/// (order_id, op). The unique pair is the idempotency gate for
/// rollbacks and redelivered deducts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockOp {
    Deduct,
    Rollback,
}

impl StockOp {
    pub fn id(&self) -> i16 {
        match self {
            StockOp::Deduct => 0,
            StockOp::Rollback => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLog {
    pub sku_id: SkuId,
    pub order_id: Uuid,
    pub op: StockOp,
    pub qty: u32,
    pub stock_before: i64,
    pub stock_after: i64,
}

// ============================================================
// RECONCILIATION
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconStatus {
    Normal,
    Discrepancy,
    Fixed,
}

impl ReconStatus {
    pub fn id(&self) -> i16 {
        match self {
            ReconStatus::Normal => 0,
            ReconStatus::Discrepancy => 1,
            ReconStatus::Fixed => 2,
        }
    }
}

/// One detected inconsistency between the fast store and the
/// durable store, serialized into the reconciliation log row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Discrepancy {
    /// redis_sold != durable order count
    OrderCountMismatch { redis_sold: i64, durable: i64 },
    /// redis_stock + redis_sold != total_stock
    TotalStockMismatch {
        redis_stock: i64,
        redis_sold: i64,
        total_stock: i64,
    },
    /// redis_stock != total_stock - durable order count
    StockMismatch { expected: i64, actual: i64 },
}

#[derive(Debug, Clone)]
pub struct ReconciliationLog {
    pub sku_id: SkuId,
    pub redis_stock: i64,
    pub redis_sold: i64,
    pub durable_order_count: i64,
    pub discrepancies: Vec<Discrepancy>,
    pub status: ReconStatus,
}

// ============================================================
// BUS EVENT
// ============================================================

/// Published on `order_events` (key = user_id) by a successful
/// deduct; consumed by the materializer. Carries everything needed
/// to build the durable order and its deduct log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: Uuid,
    pub user_id: UserId,
    pub sku_id: SkuId,
    pub activity_id: ActivityId,
    pub qty: u32,
    /// Fast-store stock right after the deduct
    pub remaining_after: u64,
    pub ts: DateTime<Utc>,
}

impl OrderEvent {
    pub fn partition_key(&self) -> String {
        self.user_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OrderStatus::PendingPayment,
            OrderStatus::Paid,
            OrderStatus::Cancelled,
            OrderStatus::Timeout,
        ] {
            assert_eq!(OrderStatus::from_id(status.id()), Some(status));
            assert_eq!(OrderStatus::from_str_cached(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::from_id(9), None);
    }

    #[test]
    fn test_holds_stock() {
        assert!(OrderStatus::PendingPayment.holds_stock());
        assert!(OrderStatus::Paid.holds_stock());
        assert!(!OrderStatus::Cancelled.holds_stock());
        assert!(!OrderStatus::Timeout.holds_stock());
    }

    #[test]
    fn test_activity_live_window() {
        let now = Utc::now();
        let activity = Activity {
            activity_id: 1,
            sku_id: 1,
            name: "test".into(),
            total_stock: 10,
            per_user_limit: 1,
            start_ts: now - chrono::Duration::minutes(1),
            end_ts: now + chrono::Duration::minutes(1),
            status: ActivityStatus::InProgress,
            updated_at: now,
        };
        assert!(activity.is_live(now));
        assert!(!activity.is_live(now + chrono::Duration::minutes(2)));

        let ended = Activity {
            status: ActivityStatus::Ended,
            ..activity
        };
        assert!(!ended.is_live(now));
    }

    #[test]
    fn test_discrepancy_serialization() {
        let d = Discrepancy::OrderCountMismatch {
            redis_sold: 9,
            durable: 10,
        };
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("OrderCountMismatch"));
        let back: Discrepancy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
