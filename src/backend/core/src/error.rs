//! Error handling for the rate limiter.
//!
//! Four kinds of failure exist:
//! - `RateLimitExceeded` is a business outcome carrying everything needed for a 429 response
//! - `Configuration` is raised when a config is validated and is never swallowed
//! - `Storage` / `StorageTimeout` are backend I/O failures, subject to the fail-open policy
//! - `Strategy` is an unexpected fault inside an algorithm, same policy as storage
//!
//! # Usage
//!
//! ```rust,ignore
//! use limiter_core::error::{RateLimitError, Result};
//!
//! fn check_period(period: u64) -> Result<()> {
//!     if period == 0 {
//!         return Err(RateLimitError::configuration("period_seconds must be greater than 0"));
//!     }
//!     Ok(())
//! }
//! ```

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting errors.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded")]
    RateLimitExceeded {
        limit: u64,
        remaining: u64,
        reset_secs: u64,
        retry_after_secs: Option<u64>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage operation timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("Strategy error: {0}")]
    Strategy(String),
}

impl RateLimitError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a strategy error.
    pub fn strategy(message: impl Into<String>) -> Self {
        Self::Strategy(message.into())
    }

    /// Stable, machine-readable code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::StorageTimeout(_) => "STORAGE_TIMEOUT",
            Self::Strategy(_) => "STRATEGY_ERROR",
        }
    }

    /// Whether the request path may recover from this error by failing open.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::StorageTimeout(_) | Self::Strategy(_)
        )
    }

    /// HTTP status used when the error reaches a client.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Response Conversion
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON body of a 429 response.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionBody {
    pub detail: String,
    pub limit: u64,
    pub reset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match self {
            Self::RateLimitExceeded {
                limit,
                reset_secs,
                retry_after_secs,
                ..
            } => {
                let body = RejectionBody {
                    detail: "Rate limit exceeded. Please slow down.".to_string(),
                    limit,
                    reset: reset_secs,
                    retry_after: retry_after_secs,
                };
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                if let Some(retry_after) = retry_after_secs {
                    response
                        .headers_mut()
                        .insert("Retry-After", HeaderValue::from(retry_after));
                }
                response
            }
            other => {
                error!(code = other.code(), error = %other, "Rate limiter internal error");
                (
                    other.http_status(),
                    Json(serde_json::json!({
                        "detail": "An internal error occurred",
                    })),
                )
                    .into_response()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for RateLimitError {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(format!("redis: {}", err))
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RateLimitError::configuration("bad").code(),
            "CONFIGURATION_ERROR"
        );
        assert_eq!(RateLimitError::storage("down").code(), "STORAGE_ERROR");
        assert_eq!(
            RateLimitError::StorageTimeout(Duration::from_millis(50)).code(),
            "STORAGE_TIMEOUT"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(RateLimitError::storage("down").is_recoverable());
        assert!(RateLimitError::strategy("contention").is_recoverable());
        assert!(RateLimitError::StorageTimeout(Duration::from_secs(1)).is_recoverable());
        assert!(!RateLimitError::configuration("bad").is_recoverable());
    }

    #[test]
    fn test_exceeded_response() {
        let err = RateLimitError::RateLimitExceeded {
            limit: 5,
            remaining: 0,
            reset_secs: 42,
            retry_after_secs: Some(42),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }

    #[test]
    fn test_internal_response_is_generic() {
        let response = RateLimitError::storage("connection refused").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rejection_body_omits_missing_retry_after() {
        let body = RejectionBody {
            detail: "x".to_string(),
            limit: 1,
            reset: 2,
            retry_after: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("retry_after").is_none());
        assert_eq!(json["limit"], 1);
    }
}
