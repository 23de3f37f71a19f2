//! API error types.
//!
//! Every rejection carries a stable machine-readable code:
//! `{ "error": { "code": "...", "message": "...", "details": [...] } }`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use reel_queue::QueueError;
use reel_store::StoreError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Beta access required")]
    BetaAccessRequired,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload exceeds {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: u64 },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("User rate limit exceeded for {tier} tier")]
    UserRateLimited { tier: &'static str, retry_after_secs: u64 },

    #[error("Server misconfigured: {0}")]
    Misconfigured(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(vec![msg.into()])
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable error code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::BetaAccessRequired => "BETA_ACCESS_REQUIRED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ApiError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::UserRateLimited { .. } => "USER_RATE_LIMIT_EXCEEDED",
            ApiError::Misconfigured(_) => "SERVER_MISCONFIGURED",
            ApiError::Unavailable(_) | ApiError::Queue(QueueError::Closed) => {
                "SERVICE_UNAVAILABLE"
            }
            ApiError::Internal(_) | ApiError::Queue(_) | ApiError::Store(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BetaAccessRequired => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } | ApiError::UserRateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Unavailable(_) | ApiError::Queue(QueueError::Closed) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Misconfigured(_)
            | ApiError::Internal(_)
            | ApiError::Queue(_)
            | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Server-side failures never expose their cause.
    fn public_message(&self) -> String {
        match self {
            ApiError::Validation(_) => "Request validation failed".to_string(),
            ApiError::Unauthorized(msg) | ApiError::NotFound(msg) => msg.clone(),
            ApiError::BetaAccessRequired => {
                "A valid beta access code is required for this endpoint".to_string()
            }
            ApiError::PayloadTooLarge { limit_bytes } => {
                format!("Request body exceeds the limit of {} bytes", limit_bytes)
            }
            ApiError::RateLimited { .. } => {
                "Too many requests from this address, please try again later".to_string()
            }
            ApiError::UserRateLimited { tier, .. } => {
                format!("Hourly request quota for the {} tier exhausted", tier)
            }
            ApiError::Misconfigured(_) => "Server is not configured for this operation".to_string(),
            ApiError::Unavailable(_) | ApiError::Queue(QueueError::Closed) => {
                "Service is temporarily unavailable".to_string()
            }
            ApiError::Internal(_) | ApiError::Queue(_) | ApiError::Store(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after_secs }
            | ApiError::UserRateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<String>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), "Request failed: {}", self);
        }

        let details = match &self {
            ApiError::Validation(messages) => Some(messages.clone()),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.public_message(),
                details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}
