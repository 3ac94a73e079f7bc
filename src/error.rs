//! Gateway error taxonomy and the axum handler wrapper.
//!
//! Every stage of the pipeline returns a typed [`GatewayError`] carrying one
//! of the closed set of [`ErrorCode`]s. The orchestrator converts the error
//! into the response envelope; the HTTP layer maps the code to a status via
//! [`ErrorCode::http_status`]. Internal detail (stack traces, adapter URLs)
//! never reaches the caller — `internal_error` responses carry a generic
//! message and the full context goes to the log at `error`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Closed set of wire-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SchemaValidationFailed,
    AuthenticationFailed,
    SignatureVerificationFailed,
    AuthorizationFailed,
    PiiRoutingBlocked,
    RoutingFailed,
    BackendFailed,
    Timeout,
    ResourceExhausted,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaValidationFailed => "schema_validation_failed",
            Self::AuthenticationFailed => "authentication_failed",
            Self::SignatureVerificationFailed => "signature_verification_failed",
            Self::AuthorizationFailed => "authorization_failed",
            Self::PiiRoutingBlocked => "pii_routing_blocked",
            Self::RoutingFailed => "routing_failed",
            Self::BackendFailed => "backend_failed",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::InternalError => "internal_error",
        }
    }

    /// HTTP status the client port returns for this code.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::SchemaValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            Self::SignatureVerificationFailed => StatusCode::UNAUTHORIZED,
            Self::AuthorizationFailed => StatusCode::FORBIDDEN,
            Self::PiiRoutingBlocked => StatusCode::FORBIDDEN,
            Self::RoutingFailed => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BackendFailed => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the client may usefully retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ResourceExhausted)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline failure: error code + human-readable reason.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SchemaValidationFailed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
///
/// Any type that implements `Into<anyhow::Error>` (which includes `io::Error`,
/// `reqwest::Error`, and any `#[derive(thiserror::Error)]` type) can be
/// converted into an [`AppError`] via the blanket [`From`] implementation.
/// Unexpected handler failures become `internal_error` responses with no
/// internal detail leaked.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": {
                    "code": ErrorCode::InternalError.as_str(),
                    "message": "internal server error",
                }
            })),
        )
            .into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
