//! IM Routing Core
//!
//! Routes private and group messages to device fan-outs with
//! per-conversation monotonic sequencing, dedup, and a durable
//! offline fallback.
//!
//! # Architecture
//!
//! ```text
//! client ─▶ Router ─▶ Sequencer / Filter / Dedup / Presence
//!              │
//!              ├─ fast path ──▶ gateway push (retry, backoff)
//!              └─ slow path ──▶ offline bus ─▶ Offline Writer ─▶ durable store
//!
//! timers: presence lease expiry │ counter snapshots │ offline TTL sweep
//! ```
//!
//! # Delivery model
//!
//! At-least-once per (recipient, device); duplicates inside the dedup
//! window are suppressed, so the user-visible behavior is exactly
//! once. Sequence numbers are issued before path selection, which
//! pins per-conversation order across fast and offline delivery.

pub mod api;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod offline;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod repository;
pub mod router;
pub mod sequencer;
pub mod types;

pub use error::ImError;
pub use filter::{FilterAction, FilterOutcome, WordFilter};
pub use gateway::{GatewayClient, HttpGatewayClient};
pub use offline::{OfflineTtlSweeper, OfflineWriter};
pub use presence::PresenceRegistry;
pub use receipts::ReadReceiptTracker;
pub use registry::{MemoryRegistry, RedisRegistry, RegistryBackend, RegistryEvent};
pub use router::MessageRouter;
pub use sequencer::Sequencer;
pub use types::{
    ConvScope, DeliveryPush, DeliveryStatus, GroupMessage, GroupMessageEvent, OfflineMessage,
    OfflineMessageEvent, PayloadKind, PresenceBinding, PrivateMessage, ReadReceipt,
    ReadReceiptEvent, RouteResult, private_conv_id,
};
