//! IM HTTP API
//!
//! Routing, unread sync, read receipts, and the presence endpoints
//! the access gateways call on connect/heartbeat/disconnect.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;

use super::error::ImError;
use super::presence::PresenceRegistry;
use super::receipts::ReadReceiptTracker;
use super::repository::OfflineMessageRepository;
use super::router::MessageRouter;
use super::types::{
    ConvScope, GroupMessage, OfflineMessage, PresenceBinding, PrivateMessage, ReadReceipt,
    RouteResult,
};
use crate::api::{ApiResult, ok};
use crate::core_types::{SeqNum, UserId};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub presence: Arc<PresenceRegistry>,
    pub receipts: Arc<ReadReceiptTracker>,
    pub offline: Arc<dyn OfflineMessageRepository>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/message/private", post(route_private))
        .route("/api/v1/message/group", post(route_group))
        .route("/api/v1/message/{msg_id}/status", get(message_status))
        .route("/api/v1/message/read", post(mark_read))
        .route("/api/v1/messages/unread", get(unread))
        .route("/api/v1/messages/ack", post(ack))
        .route("/api/v1/presence/register", post(presence_register))
        .route("/api/v1/presence/renew", post(presence_renew))
        .route("/api/v1/presence/disconnect", post(presence_disconnect))
        .route("/api/v1/presence/{user_id}", get(presence_lookup))
        .with_state(Arc::new(state))
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub recipient: UserId,
}

#[derive(Debug, Deserialize)]
pub struct UnreadQuery {
    pub user_id: UserId,
    #[serde(default)]
    pub after_seq: SeqNum,
    #[serde(default = "default_page_size")]
    pub limit: i64,
}

fn default_page_size() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub user_id: UserId,
    pub up_to_seq: SeqNum,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub msg_id: String,
    pub reader_id: UserId,
    pub device_id: String,
    pub sender_id: UserId,
    pub conv_id: String,
    pub conv_type: ConvScope,
}

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    pub user_id: UserId,
    pub device_id: String,
    #[serde(default)]
    pub gateway_id: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn route_private(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<PrivateMessage>,
) -> ApiResult<RouteResult> {
    let result = state.router.route_private(msg).await?;
    ok(result)
}

async fn route_group(
    State(state): State<Arc<AppState>>,
    Json(msg): Json<GroupMessage>,
) -> ApiResult<RouteResult> {
    let result = state.router.route_group(msg).await?;
    ok(result)
}

async fn message_status(
    State(state): State<Arc<AppState>>,
    Path(msg_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<RouteResult> {
    let result = state
        .router
        .get_status(&msg_id, query.recipient)
        .await?
        .ok_or(ImError::MsgNotFound(msg_id))?;
    ok(result)
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .receipts
        .mark_read(ReadReceipt {
            msg_id: req.msg_id,
            reader_id: req.reader_id,
            device_id: req.device_id,
            sender_id: req.sender_id,
            conv_id: req.conv_id,
            conv_type: req.conv_type,
            read_at: Utc::now(),
        })
        .await?;
    ok(serde_json::json!({ "recorded": true }))
}

async fn unread(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UnreadQuery>,
) -> ApiResult<Vec<OfflineMessage>> {
    if query.user_id == 0 {
        return Err(ImError::Validation("user_id is required".into()).into());
    }
    let page = state
        .offline
        .unread_page(query.user_id, query.after_seq, query.limit.clamp(1, 500))
        .await?;
    ok(page)
}

async fn ack(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AckRequest>,
) -> ApiResult<serde_json::Value> {
    let removed = state.offline.ack_through(req.user_id, req.up_to_seq).await?;
    ok(serde_json::json!({ "removed": removed }))
}

async fn presence_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresenceRequest>,
) -> ApiResult<serde_json::Value> {
    let gateway_id = req
        .gateway_id
        .ok_or_else(|| ImError::Validation("gateway_id is required".into()))?;
    state
        .presence
        .register(req.user_id, &req.device_id, &gateway_id)
        .await?;
    ok(serde_json::json!({
        "lease_secs": state.presence.ttl().as_secs(),
    }))
}

async fn presence_renew(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresenceRequest>,
) -> ApiResult<serde_json::Value> {
    let renewed = state.presence.renew(req.user_id, &req.device_id).await?;
    ok(serde_json::json!({ "renewed": renewed }))
}

async fn presence_disconnect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresenceRequest>,
) -> ApiResult<serde_json::Value> {
    state.presence.disconnect(req.user_id, &req.device_id).await?;
    ok(serde_json::json!({ "disconnected": true }))
}

async fn presence_lookup(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Vec<PresenceBinding>> {
    let bindings = state.presence.lookup(user_id).await?;
    ok(bindings)
}
