//! Client-facing API (port 8080) — the endpoint applications talk to.
//!
//! This is intentionally a thin layer: the whole pipeline lives in
//! [`crate::gateway`]. Handlers translate HTTP concerns (status codes, JSON
//! bodies) into calls to the orchestrator and back; the raw body bytes are
//! handed over untouched so the size guard and envelope decoding happen in
//! one place.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;

use crate::gateway::{self, GatewayState};

/// Build the client-facing axum router (port 8080).
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/status", get(crate::api::status::status))
        .route("/v1/process", post(process_request))
        .with_state(state)
}

/// POST /v1/process — run the admission/screening/routing/dispatch pipeline.
///
/// The HTTP status mirrors the envelope's error code; the body is always a
/// full response envelope, success or not.
pub async fn process_request(
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> impl IntoResponse {
    let response = gateway::process(&state, &body).await;
    let status = response
        .error
        .as_ref()
        .map(|e| e.code.http_status())
        .unwrap_or(StatusCode::OK);
    (status, Json(response))
}
