//! Flash-Sale Error Types

use thiserror::Error;
use uuid::Uuid;

use crate::bus::BusError;
use crate::core_types::ActivityId;
use crate::store::StoreError;

/// Flash-sale error types
///
/// Error codes are stable strings for API responses and log greps.
#[derive(Error, Debug)]
pub enum FlashSaleError {
    // === Validation Errors ===
    #[error("invalid request: {0}")]
    Validation(String),

    // === Not Found ===
    #[error("activity not found: {0}")]
    ActivityNotFound(ActivityId),

    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    // === Client-visible outcomes ===
    #[error("activity is not in progress")]
    NotInProgress,

    #[error("purchase limit reached")]
    OverLimit,

    #[error("captcha required")]
    CaptchaRequired,

    // === Conflict (idempotency) ===
    #[error("duplicate operation")]
    Conflict,

    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    // === System Errors ===
    #[error("database error: {0}")]
    Database(String),

    #[error("fast store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("internal system error: {0}")]
    System(String),
}

impl FlashSaleError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            FlashSaleError::Validation(_) => "INVALID_PARAMETER",
            FlashSaleError::ActivityNotFound(_) => "ACTIVITY_NOT_FOUND",
            FlashSaleError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            FlashSaleError::NotInProgress => "NOT_IN_PROGRESS",
            FlashSaleError::OverLimit => "OVER_LIMIT",
            FlashSaleError::CaptchaRequired => "CAPTCHA_REQUIRED",
            FlashSaleError::Conflict => "CONFLICT",
            FlashSaleError::InvalidTransition(_) => "INVALID_STATE_TRANSITION",
            FlashSaleError::Database(_) => "DATABASE_ERROR",
            FlashSaleError::Store(_) => "FAST_STORE_ERROR",
            FlashSaleError::Bus(_) => "BUS_ERROR",
            FlashSaleError::System(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            FlashSaleError::Validation(_) => 400,
            FlashSaleError::ActivityNotFound(_) | FlashSaleError::OrderNotFound(_) => 404,
            // The client sees "sold out" for a sale that is not live
            FlashSaleError::NotInProgress => 410,
            FlashSaleError::OverLimit => 422,
            FlashSaleError::CaptchaRequired => 423,
            FlashSaleError::Conflict => 409,
            FlashSaleError::InvalidTransition(_) => 409,
            FlashSaleError::Database(_)
            | FlashSaleError::Store(_)
            | FlashSaleError::Bus(_)
            | FlashSaleError::System(_) => 500,
        }
    }
}

impl From<sqlx::Error> for FlashSaleError {
    fn from(e: sqlx::Error) -> Self {
        FlashSaleError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(FlashSaleError::OverLimit.code(), "OVER_LIMIT");
        assert_eq!(FlashSaleError::CaptchaRequired.code(), "CAPTCHA_REQUIRED");
        assert_eq!(FlashSaleError::NotInProgress.code(), "NOT_IN_PROGRESS");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(FlashSaleError::Validation("x".into()).http_status(), 400);
        assert_eq!(FlashSaleError::NotInProgress.http_status(), 410);
        assert_eq!(FlashSaleError::OverLimit.http_status(), 422);
        assert_eq!(FlashSaleError::CaptchaRequired.http_status(), 423);
        assert_eq!(FlashSaleError::System("x".into()).http_status(), 500);
    }
}
