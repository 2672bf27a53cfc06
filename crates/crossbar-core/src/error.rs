use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::TimeoutClass;

/// Wire-level error code, shared across every subsystem.
///
/// The retry executor and circuit breaker classify failures by code, so
/// every expected failure must map onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RateLimited,
    NotFound,
    PermissionDenied,
    InvalidRequest,
    MessageTooLong,
    FileTooLarge,
    NetworkError,
    Timeout,
    ServerError,
    CircuitOpen,
    SessionNotFound,
    AlreadyProcessing,
    Cancelled,
    Unsupported,
    Unknown,
}

impl ErrorCode {
    /// Whether a failure with this code is worth retrying on the same call
    /// path. `circuit_open` is deliberately not retryable within the same
    /// call: the breaker already decided to shed load.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::NetworkError
                | ErrorCode::Timeout
                | ErrorCode::ServerError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::NotFound => "not_found",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::MessageTooLong => "message_too_long",
            ErrorCode::FileTooLarge => "file_too_large",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ServerError => "server_error",
            ErrorCode::CircuitOpen => "circuit_open",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::AlreadyProcessing => "already_processing",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every expected failure in the gateway.
///
/// Cloneable so the idempotency store can cache a failure outcome verbatim
/// and replay it on duplicate delivery.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("rate limited ({scope}), retry after {retry_after_ms}ms")]
    RateLimited { scope: String, retry_after_ms: u64 },

    #[error("rate limited ({scope}), request must be queued")]
    RateLimitQueued { scope: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("message too long: {length} chars (max {max})")]
    MessageTooLong { length: usize, max: usize },

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("{class} timeout after {elapsed_ms}ms")]
    Timeout {
        class: TimeoutClass,
        elapsed_ms: u64,
    },

    #[error("upstream server error: {0}")]
    Server(String),

    #[error("circuit open, next probe in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("event {event_id} is already being processed by another instance")]
    AlreadyProcessing { event_id: String },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("{platform} does not support {operation}")]
    Unsupported { platform: String, operation: String },

    #[error("{0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::RateLimited { .. } | GatewayError::RateLimitQueued { .. } => {
                ErrorCode::RateLimited
            }
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            GatewayError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            GatewayError::MessageTooLong { .. } => ErrorCode::MessageTooLong,
            GatewayError::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            GatewayError::Network(_) => ErrorCode::NetworkError,
            GatewayError::Timeout { .. } => ErrorCode::Timeout,
            GatewayError::Server(_) => ErrorCode::ServerError,
            GatewayError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            GatewayError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            GatewayError::AlreadyProcessing { .. } => ErrorCode::AlreadyProcessing,
            GatewayError::Cancelled(_) => ErrorCode::Cancelled,
            GatewayError::Unsupported { .. } => ErrorCode::Unsupported,
            GatewayError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    pub fn retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Admission-control hint: how long to wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            GatewayError::CircuitOpen { retry_in_ms } => {
                Some(Duration::from_millis(*retry_in_ms))
            }
            _ => None,
        }
    }

    /// Convert into the serializable wire form.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
            retryable: self.retryable(),
            retry_after_ms: self.retry_after().map(|d| d.as_millis() as u64),
            platform_data: None,
        }
    }
}

/// Serializable failure envelope surfaced to callers and adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Platform-specific detail passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_data: Option<serde_json::Value>,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
