//! API Response types shared by both service surfaces
//!
//! - `ApiResponse<T>`: unified response wrapper
//! - `ApiResult<T>`: type alias for handler return types
//! - `ApiError`: unified error type with IntoResponse

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use crate::flashsale::FlashSaleError;
use crate::im::ImError;

/// Unified API response wrapper
///
/// All API responses follow this structure:
/// - code: "OK" on success, a stable error code otherwise
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: &'static str,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Create success response
    pub fn success(data: T) -> Self {
        Self {
            code: "OK",
            msg: "ok".to_string(),
            data: Some(data),
        }
    }
}

/// Type alias for handler return types - reduces boilerplate
pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

/// Helper to create success response (200 OK)
#[inline]
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

/// Helper for a success response with a chosen status (e.g. 202)
#[inline]
pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> ApiResult<T> {
    Ok((status, Json(ApiResponse::success(data))))
}

/// Unified API error type with automatic IntoResponse
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl From<FlashSaleError> for ApiError {
    fn from(err: FlashSaleError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<ImError> for ApiError {
    fn from(err: ImError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(ApiResponse::<()> {
            code: self.code,
            msg: self.message,
            data: None,
        });
        (self.status, body).into_response()
    }
}
