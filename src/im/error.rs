//! IM Routing Error Types

use thiserror::Error;

use crate::bus::BusError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ImError {
    // === Validation Errors ===
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("content rejected by filter")]
    SensitiveContent,

    // === Not Found ===
    #[error("message not found: {0}")]
    MsgNotFound(String),

    // === System Errors ===
    #[error("database error: {0}")]
    Database(String),

    #[error("fast store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("gateway push failed: {0}")]
    GatewayPush(String),

    #[error("internal system error: {0}")]
    System(String),
}

impl ImError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ImError::Validation(_) => "INVALID_PARAMETER",
            ImError::SensitiveContent => "SENSITIVE_CONTENT",
            ImError::MsgNotFound(_) => "MSG_NOT_FOUND",
            ImError::Database(_) => "DATABASE_ERROR",
            ImError::Store(_) => "FAST_STORE_ERROR",
            ImError::Bus(_) => "BUS_ERROR",
            ImError::Registry(_) => "REGISTRY_ERROR",
            ImError::GatewayPush(_) => "GATEWAY_PUSH_FAILED",
            ImError::System(_) => "SYSTEM_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            ImError::Validation(_) => 400,
            ImError::SensitiveContent => 422,
            ImError::MsgNotFound(_) => 404,
            ImError::Database(_)
            | ImError::Store(_)
            | ImError::Bus(_)
            | ImError::Registry(_)
            | ImError::GatewayPush(_)
            | ImError::System(_) => 500,
        }
    }
}

impl From<sqlx::Error> for ImError {
    fn from(e: sqlx::Error) -> Self {
        ImError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ImError::SensitiveContent.code(), "SENSITIVE_CONTENT");
        assert_eq!(ImError::Validation("x".into()).code(), "INVALID_PARAMETER");
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ImError::Validation("x".into()).http_status(), 400);
        assert_eq!(ImError::SensitiveContent.http_status(), 422);
        assert_eq!(ImError::MsgNotFound("m".into()).http_status(), 404);
        assert_eq!(ImError::System("x".into()).http_status(), 500);
    }
}
