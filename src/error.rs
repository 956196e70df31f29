//! Gateway-wide error kinds and the single HTTP error envelope they translate to.
//!
//! Every filter and resilience primitive surfaces one of these kinds; a single
//! `IntoResponse` impl at the bottom of the pipeline is the only place that maps
//! a kind to a status code, matching spec's "standardize on one error envelope"
//! design note.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("CSRF protection header missing")]
    CsrfMissing,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: missing permission {0}")]
    Forbidden(String),

    #[error("rate limit exceeded, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },

    #[error("upstream returned an error status")]
    Upstream5xx,

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("bulkhead exhausted for {0}")]
    BulkheadRejected(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("cache store unavailable")]
    CacheUnavailable,

    #[error("identity service unavailable")]
    IdentityUnavailable,

    #[error("failed to persist session")]
    SessionPersistError,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: &'static str,
    pub message: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::CsrfMissing => "CSRF_PROTECTION",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Upstream5xx => "UPSTREAM_5XX",
            GatewayError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::BulkheadRejected(_) => "BULKHEAD_REJECTED",
            GatewayError::ConfigInvalid(_) => "CONFIG_INVALID",
            GatewayError::CacheUnavailable => "CACHE_UNAVAILABLE",
            GatewayError::IdentityUnavailable => "IDENTITY_UNAVAILABLE",
            GatewayError::SessionPersistError => "SESSION_PERSIST_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::CsrfMissing => StatusCode::FORBIDDEN,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream5xx => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BulkheadRejected(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::CacheUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::IdentityUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SessionPersistError => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render this error with the trace id of the request it belongs to.
    pub fn into_response_with_trace(self, trace_id: String) -> axum::response::Response {
        let status = self.status();
        let retry_after = match &self {
            GatewayError::RateLimited { retry_after_s } => Some(*retry_after_s),
            _ => None,
        };
        let body = Json(ErrorEnvelope {
            error: self.kind(),
            message: self.to_string(),
            trace_id,
        });
        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from_str(&secs.to_string())
                    .unwrap_or(axum::http::HeaderValue::from_static("60")),
            );
        }
        response
    }
}

/// Fallback for call sites without request context (e.g. background workers).
impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        self.into_response_with_trace(uuid::Uuid::new_v4().to_string())
    }
}
