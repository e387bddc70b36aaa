//! Flash-sale HTTP API
//!
//! Response contract for the seckill endpoint:
//! 200 Granted, 202 Queuing, 410 SoldOut, 422 OverLimit,
//! 423 RequiresCaptcha. One error code string per response.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::admission::{AdmissionDecision, AdmissionGate};
use super::error::FlashSaleError;
use super::inventory::{DeductResult, InventoryEngine};
use super::lifecycle::LifecycleManager;
use super::repository::{ActivityRepository, OrderRepository};
use super::types::{Activity, ActivityStatus, OrderStatus};
use crate::api::{ApiResult, ok, with_status};
use crate::core_types::{ActivityId, SkuId, UserId};
use crate::store::{FastStore, keys};

// ============================================================================
// State & router
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionGate>,
    pub inventory: Arc<InventoryEngine>,
    pub lifecycle: Arc<LifecycleManager>,
    pub orders: Arc<dyn OrderRepository>,
    pub activities: Arc<dyn ActivityRepository>,
    pub store: Arc<dyn FastStore>,
    pub order_status_ttl_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/seckill", post(seckill))
        .route("/api/v1/captcha", get(issue_captcha))
        .route("/api/v1/stock/{sku_id}", get(get_stock))
        .route("/api/v1/order/{order_id}", get(get_order))
        .route("/api/v1/order/{order_id}/pay", post(pay_order))
        .route("/api/v1/admin/activity", post(create_activity))
        .route("/api/v1/admin/activity/{activity_id}/start", post(start_activity))
        .route("/api/v1/admin/activity/{activity_id}/end", post(end_activity))
        .with_state(Arc::new(state))
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SeckillRequest {
    pub user_id: UserId,
    pub sku_id: SkuId,
    #[serde(default = "default_qty")]
    pub qty: u32,
    #[serde(default)]
    pub captcha_token: Option<String>,
    /// Opaque client metadata, logged but not interpreted
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_qty() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct SeckillResponseData {
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OrderStatusData {
    pub order_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct CaptchaQuery {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct CreateActivityRequest {
    pub sku_id: SkuId,
    pub name: String,
    pub total_stock: u64,
    #[serde(default = "default_per_user_limit")]
    pub per_user_limit: u32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

fn default_per_user_limit() -> u32 {
    1
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

async fn seckill(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SeckillRequest>,
) -> ApiResult<SeckillResponseData> {
    if req.user_id == 0 {
        return Err(FlashSaleError::Validation("user_id is required".into()).into());
    }
    if req.qty == 0 {
        return Err(FlashSaleError::Validation("qty must be positive".into()).into());
    }
    if let Some(meta) = &req.metadata {
        tracing::debug!(user_id = req.user_id, sku_id = req.sku_id, %meta, "Seckill metadata");
    }

    // Outside a live window the client just sees "sold out"; the fast
    // store is not touched.
    let activity = state
        .lifecycle
        .current_for_sku(req.sku_id)
        .await?
        .filter(|a| a.is_live(Utc::now()))
        .ok_or(FlashSaleError::NotInProgress)?;

    state
        .admission
        .check_captcha(req.user_id, req.captcha_token.as_deref())
        .await?;

    match state.admission.try_acquire(req.user_id, req.sku_id).await {
        AdmissionDecision::SoldOut => Err(FlashSaleError::NotInProgress.into()),
        AdmissionDecision::Queuing { eta_secs, token } => with_status(
            StatusCode::ACCEPTED,
            SeckillResponseData {
                result: "QUEUING",
                order_id: None,
                remaining: None,
                eta_secs: Some(eta_secs),
                token: Some(token),
            },
        ),
        AdmissionDecision::Granted { token } => {
            match state.inventory.deduct(&activity, req.user_id, req.qty).await? {
                DeductResult::Success {
                    order_id,
                    remaining,
                } => ok(SeckillResponseData {
                    result: "GRANTED",
                    order_id: Some(order_id),
                    remaining: Some(remaining),
                    eta_secs: None,
                    token: Some(token),
                }),
                DeductResult::OutOfStock => Err(FlashSaleError::NotInProgress.into()),
                DeductResult::OverLimit => Err(FlashSaleError::OverLimit.into()),
            }
        }
    }
}

async fn issue_captcha(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CaptchaQuery>,
) -> ApiResult<serde_json::Value> {
    let token = state.admission.issue_captcha(query.user_id).await?;
    ok(serde_json::json!({ "captcha_token": token }))
}

async fn get_stock(
    State(state): State<Arc<AppState>>,
    Path(sku_id): Path<SkuId>,
) -> ApiResult<serde_json::Value> {
    let info = state
        .inventory
        .stock(sku_id)
        .await?
        .ok_or(FlashSaleError::Validation(format!("sku {sku_id} has no stock cell")))?;
    ok(serde_json::json!({
        "sku_id": sku_id,
        "total": info.total,
        "remaining": info.remaining,
        "sold": info.sold,
    }))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<OrderStatusData> {
    // Cache first; the durable store is the fallback for evicted or
    // not-yet-written entries.
    if let Some(cached) = state
        .store
        .cache_get(&keys::order_status(&order_id.to_string()))
        .await
        .ok()
        .flatten()
        .and_then(|s| OrderStatus::from_str_cached(&s))
    {
        return ok(OrderStatusData {
            order_id,
            status: cached.as_str(),
        });
    }

    let order = state
        .orders
        .get(order_id)
        .await?
        .ok_or(FlashSaleError::OrderNotFound(order_id))?;
    if let Err(e) = state
        .store
        .cache_put(
            &keys::order_status(&order_id.to_string()),
            order.status.as_str(),
            state.order_status_ttl_secs,
        )
        .await
    {
        tracing::warn!(%order_id, error = %e, "Status cache refill failed");
    }
    ok(OrderStatusData {
        order_id,
        status: order.status.as_str(),
    })
}

async fn pay_order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<PayRequest>,
) -> ApiResult<OrderStatusData> {
    let order = state
        .orders
        .get(order_id)
        .await?
        .ok_or(FlashSaleError::OrderNotFound(order_id))?;
    if order.user_id != req.user_id {
        return Err(FlashSaleError::Validation("order belongs to another user".into()).into());
    }

    let moved = state
        .orders
        .transition(order_id, OrderStatus::PendingPayment, OrderStatus::Paid)
        .await?;
    if !moved {
        // Lost the race. Paying an already-paid order is idempotent
        // success; a timed-out or cancelled order is a conflict.
        let current = state
            .orders
            .get(order_id)
            .await?
            .ok_or(FlashSaleError::OrderNotFound(order_id))?;
        if current.status == OrderStatus::Paid {
            return ok(OrderStatusData {
                order_id,
                status: OrderStatus::Paid.as_str(),
            });
        }
        return Err(FlashSaleError::InvalidTransition(format!(
            "order is {}",
            current.status.as_str()
        ))
        .into());
    }

    if let Err(e) = state
        .store
        .cache_put(
            &keys::order_status(&order_id.to_string()),
            OrderStatus::Paid.as_str(),
            state.order_status_ttl_secs,
        )
        .await
    {
        tracing::warn!(%order_id, error = %e, "Status cache write failed");
    }
    ok(OrderStatusData {
        order_id,
        status: OrderStatus::Paid.as_str(),
    })
}

async fn create_activity(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateActivityRequest>,
) -> ApiResult<serde_json::Value> {
    if req.total_stock == 0 {
        return Err(FlashSaleError::Validation("total_stock must be positive".into()).into());
    }
    if req.end_ts <= req.start_ts {
        return Err(FlashSaleError::Validation("end_ts must be after start_ts".into()).into());
    }
    let activity = Activity {
        activity_id: 0, // assigned by the store
        sku_id: req.sku_id,
        name: req.name,
        total_stock: req.total_stock,
        per_user_limit: req.per_user_limit.max(1),
        start_ts: req.start_ts,
        end_ts: req.end_ts,
        status: ActivityStatus::NotStarted,
        updated_at: Utc::now(),
    };
    let activity_id = state.activities.create(&activity).await?;
    ok(serde_json::json!({ "activity_id": activity_id }))
}

async fn start_activity(
    State(state): State<Arc<AppState>>,
    Path(activity_id): Path<ActivityId>,
) -> ApiResult<serde_json::Value> {
    state.lifecycle.start_activity(activity_id).await?;
    ok(serde_json::json!({ "activity_id": activity_id, "status": "IN_PROGRESS" }))
}

async fn end_activity(
    State(state): State<Arc<AppState>>,
    Path(activity_id): Path<ActivityId>,
) -> ApiResult<serde_json::Value> {
    state.lifecycle.end_activity(activity_id).await?;
    ok(serde_json::json!({ "activity_id": activity_id, "status": "ENDED" }))
}
