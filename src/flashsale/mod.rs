//! Flash-Sale Inventory & Admission Core
//!
//! Serves purchase bursts against limited stock with a strict
//! no-oversell guarantee.
//!
//! # Architecture
//!
//! ```text
//! client ─▶ Admission Gate ─▶ Inventory Engine ─▶ order bus ─▶ Materializer ─▶ orders
//!              (token bucket)    (atomic deduct)                 (batch insert)
//!
//! timers: Lifecycle Manager │ Timeout Sweeper │ Reconciler
//! ```
//!
//! # Consistency model
//!
//! - The fast store is the admission truth: the deduct script cannot
//!   oversell no matter how many instances race.
//! - The durable store is the accounting truth: the reconciler
//!   repairs fast-store counters toward it, never the other way.
//! - Every inventory mutation appends a stock log row; the unique
//!   (order_id, op) pair makes deduct and rollback idempotent.

pub mod admission;
pub mod api;
pub mod error;
pub mod inventory;
pub mod lifecycle;
pub mod materializer;
pub mod reconciler;
pub mod repository;
pub mod sweeper;
pub mod types;

pub use admission::{AdmissionDecision, AdmissionGate};
pub use error::FlashSaleError;
pub use inventory::{DeductResult, InventoryEngine, StockInfo};
pub use lifecycle::LifecycleManager;
pub use materializer::OrderMaterializer;
pub use reconciler::{ReconOutcome, Reconciler};
pub use sweeper::TimeoutSweeper;
pub use types::{
    Activity, ActivityStatus, Discrepancy, Order, OrderEvent, OrderStatus, ReconStatus,
    ReconciliationLog, StockLog, StockOp,
};
