//! Error types for Switchboard
//!
//! Three layers: `ProviderError` is what a backend reports for one call,
//! `AttemptError` is why one routing attempt failed (provider error or a
//! local limit), and `EngineError` is what the caller finally sees.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors reported by a backend call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// Short machine-readable label used in logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::Unknown(_) => "unknown",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            ProviderError::InvalidResponse(e.to_string())
        } else {
            ProviderError::Unknown(e.to_string())
        }
    }
}

/// Reason a single routing attempt against one model failed
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AttemptError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Local rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("No concurrency slot available within {0:?}")]
    SlotUnavailable(Duration),

    #[error("Cancelled by caller")]
    Cancelled,

    #[error("Model {0} has no backend attached")]
    Unroutable(String),
}

impl AttemptError {
    /// Deadline expiry and caller cancellation both count as timeouts
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AttemptError::Provider(ProviderError::Timeout(_)) | AttemptError::Cancelled
        )
    }

    /// Whether the failure happened before any backend was contacted
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            AttemptError::RateLimited { .. }
                | AttemptError::SlotUnavailable(_)
                | AttemptError::Unroutable(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Provider(e) => e.kind(),
            AttemptError::RateLimited { .. } => "local_rate_limited",
            AttemptError::SlotUnavailable(_) => "slot_unavailable",
            AttemptError::Cancelled => "cancelled",
            AttemptError::Unroutable(_) => "unroutable",
        }
    }
}

/// Engine-level errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("No available model for rule {0}")]
    NoAvailableModel(String),

    #[error("Rate limit exceeded for model {model}")]
    RateLimited { model: String, retry_after: Duration },

    #[error("All candidates failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: AttemptError },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Request queue is full")]
    QueueFull,

    #[error("Request queue is shut down")]
    QueueClosed,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether retrying the same request later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ExhaustedRetries { .. }
                | EngineError::RateLimited { .. }
                | EngineError::NoAvailableModel(_)
        )
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error details
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Additional error details for routing failures
#[derive(Debug, Default, Serialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            EngineError::Configuration(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "CONFIGURATION_ERROR",
                msg.clone(),
                None,
            ),
            EngineError::ModelNotFound(_) => (
                StatusCode::NOT_FOUND,
                "MODEL_NOT_FOUND",
                self.to_string(),
                None,
            ),
            EngineError::NoAvailableModel(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NO_AVAILABLE_MODEL",
                self.to_string(),
                None,
            ),
            EngineError::RateLimited { model, retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                self.to_string(),
                Some(ErrorDetails {
                    model: Some(model.clone()),
                    retry_after_ms: Some(retry_after.as_millis() as u64),
                    ..Default::default()
                }),
            ),
            EngineError::ExhaustedRetries {
                attempts,
                last_error,
            } => (
                StatusCode::BAD_GATEWAY,
                "EXHAUSTED_RETRIES",
                "All candidate models failed".to_string(),
                Some(ErrorDetails {
                    attempts: Some(*attempts),
                    last_error: Some(last_error.to_string()),
                    ..Default::default()
                }),
            ),
            EngineError::TaskNotFound(_) => (
                StatusCode::NOT_FOUND,
                "TASK_NOT_FOUND",
                self.to_string(),
                None,
            ),
            EngineError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_FULL",
                self.to_string(),
                None,
            ),
            EngineError::QueueClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_CLOSED",
                self.to_string(),
                None,
            ),
            EngineError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            EngineError::RedisError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORE_ERROR",
                "Persistence store error".to_string(),
                None,
            ),
            EngineError::HttpError(_) => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_ERROR",
                "Upstream service error".to_string(),
                None,
            ),
            EngineError::JsonError(_) => (
                StatusCode::BAD_REQUEST,
                "INVALID_JSON",
                "Invalid JSON".to_string(),
                None,
            ),
            EngineError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for convenience
pub type EngineResult<T> = Result<T, EngineError>;
