//! Identifier aliases shared by both cores
//!
//! Plain integers and strings today; naming them keeps signatures
//! readable and leaves room to swap in newtypes later without
//! touching every call site.

/// User ID. Doubles as the partition key of the order and offline
/// buses, so everything about one user stays FIFO.
pub type UserId = u64;

/// SKU ID - one sellable stock unit. A flash-sale activity sells
/// exactly one SKU.
pub type SkuId = u64;

/// Activity ID - one scheduled flash sale (SKU + time window + stock)
pub type ActivityId = u64;

/// Group ID - one group conversation
pub type GroupId = u64;

/// Sequence number - strictly increasing per conversation
pub type SeqNum = u64;

/// Device ID - one logical client endpoint of a user (e.g. "ios-a1b2")
pub type DeviceId = String;

/// Gateway ID - address of the access gateway holding a device's
/// connection. Used verbatim as the push RPC target.
pub type GatewayId = String;

/// Message ID - client-generated, globally unique. The dedup anchor.
pub type MsgId = String;
