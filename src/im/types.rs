//! IM domain types
//!
//! Route requests, bus events, offline rows, presence bindings.
//! Every message carries a client-generated `msg_id`; it anchors
//! every dedup decision downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ImError;
use crate::core_types::{DeviceId, GatewayId, GroupId, MsgId, SeqNum, UserId};

// ============================================================
// CONVERSATIONS
// ============================================================

/// Conversation scope; part of every sequence counter key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvScope {
    Private,
    Group,
}

impl ConvScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConvScope::Private => "private",
            ConvScope::Group => "group",
        }
    }

    pub fn from_str_tag(s: &str) -> Option<Self> {
        match s {
            "private" => Some(ConvScope::Private),
            "group" => Some(ConvScope::Group),
            _ => None,
        }
    }
}

/// Canonical private conversation id: both user ids rendered and
/// sorted lexicographically, joined with `:`. sequence(a,b) and
/// sequence(b,a) land on the same counter.
pub fn private_conv_id(a: UserId, b: UserId) -> Result<String, ImError> {
    if a == 0 || b == 0 {
        return Err(ImError::Validation("user ids must be non-zero".into()));
    }
    let (x, y) = (a.to_string(), b.to_string());
    let (lo, hi) = if x <= y { (x, y) } else { (y, x) };
    Ok(format!("{lo}:{hi}"))
}

// ============================================================
// ROUTE REQUESTS & RESULTS
// ============================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PrivateMessage {
    pub msg_id: MsgId,
    pub sender: UserId,
    pub recipient: UserId,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupMessage {
    pub msg_id: MsgId,
    pub sender: UserId,
    pub group_id: GroupId,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// At least one device took the push
    Delivered,
    /// Queued on the offline bus for later sync
    Offline,
    /// Handed to a fan-out pipeline (group messages)
    Pending,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Offline => "OFFLINE",
            DeliveryStatus::Pending => "PENDING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteResult {
    pub sequence: SeqNum,
    pub status: DeliveryStatus,
}

// ============================================================
// GATEWAY PUSH
// ============================================================

/// Payload of one gateway push RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPush {
    pub msg_id: MsgId,
    pub conv_id: String,
    pub conv_type: ConvScope,
    pub sender: UserId,
    pub recipient: UserId,
    pub content: String,
    pub seq: SeqNum,
    pub ts: DateTime<Utc>,
}

// ============================================================
// BUS EVENTS
// ============================================================

/// What an offline-bus record carries. Read receipts ride the same
/// pipeline as chat messages so a reconnecting sender picks them up
/// in one sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Chat,
    Receipt,
}

/// Published on `offline_msg` (key = recipient user_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMessageEvent {
    pub msg_id: MsgId,
    pub recipient: UserId,
    pub sender: UserId,
    pub conv_id: String,
    pub conv_type: ConvScope,
    pub kind: PayloadKind,
    pub content: String,
    pub seq: SeqNum,
    pub ts: DateTime<Utc>,
}

impl OfflineMessageEvent {
    pub fn partition_key(&self) -> String {
        self.recipient.to_string()
    }
}

/// Published on `group_msg` (key = group_id); member fan-out is a
/// separate service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessageEvent {
    pub msg_id: MsgId,
    pub group_id: GroupId,
    pub sender: UserId,
    pub content: String,
    pub seq: SeqNum,
    pub ts: DateTime<Utc>,
}

/// Published on `read_receipt_events` (key = sender user_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptEvent {
    pub msg_id: MsgId,
    pub reader_id: UserId,
    pub device_id: DeviceId,
    pub sender_id: UserId,
    pub conv_id: String,
    pub conv_type: ConvScope,
    pub read_at: DateTime<Utc>,
}

// ============================================================
// DURABLE ROWS
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMessage {
    pub msg_id: MsgId,
    pub user_id: UserId,
    pub sender_id: UserId,
    pub conv_id: String,
    pub conv_type: ConvScope,
    pub content: String,
    pub seq: SeqNum,
    pub ts: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub msg_id: MsgId,
    pub reader_id: UserId,
    pub device_id: DeviceId,
    pub sender_id: UserId,
    pub conv_id: String,
    pub conv_type: ConvScope,
    pub read_at: DateTime<Utc>,
}

// ============================================================
// PRESENCE
// ============================================================

/// One live user×device -> gateway binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceBinding {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub gateway_id: GatewayId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_conv_id_canonical() {
        // Order of the pair never matters
        assert_eq!(
            private_conv_id(42, 7).unwrap(),
            private_conv_id(7, 42).unwrap()
        );
        // Lexicographic, not numeric: "10" sorts before "9"
        assert_eq!(private_conv_id(9, 10).unwrap(), "10:9");
        assert_eq!(private_conv_id(1, 2).unwrap(), "1:2");
    }

    #[test]
    fn test_private_conv_id_rejects_zero() {
        assert!(private_conv_id(0, 5).is_err());
        assert!(private_conv_id(5, 0).is_err());
    }

    #[test]
    fn test_conv_scope_tags() {
        assert_eq!(ConvScope::Private.as_str(), "private");
        assert_eq!(ConvScope::from_str_tag("group"), Some(ConvScope::Group));
        assert_eq!(ConvScope::from_str_tag("bogus"), None);
    }
}
