//! Pre-decode admission control middleware for the client port.
//!
//! Two bounds apply before any byte of the body is parsed:
//!
//! - **Payload size**: requests whose `Content-Length` exceeds
//!   `gateway.max_payload_bytes` are rejected with `413` before decoding.
//! - **Concurrency**: in-flight requests are bounded by the gateway
//!   semaphore. Admission beyond the bound returns `429` with a
//!   `retry_after_ms` hint rather than queueing — the client is better
//!   placed to back off than the gateway is to buffer.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::ErrorCode;
use crate::gateway::GatewayState;

/// Axum middleware enforcing the payload-size and in-flight bounds.
pub async fn admission_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    let config = state.config();

    let content_length = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(length) = content_length {
        if length > config.gateway.max_payload_bytes {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({
                    "error": {
                        "code": ErrorCode::SchemaValidationFailed.as_str(),
                        "message": format!(
                            "request body of {length} bytes exceeds the {} byte limit",
                            config.gateway.max_payload_bytes
                        ),
                    }
                })),
            )
                .into_response();
        }
    }

    match state.in_flight.clone().try_acquire_owned() {
        Ok(_permit) => {
            // The permit is held for the duration of the downstream call.
            next.run(req).await
        }
        Err(_) => {
            let retry_after_ms = config.gateway.retry_after_ms;
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_ms.div_ceil(1000).to_string())],
                Json(json!({
                    "error": {
                        "code": ErrorCode::ResourceExhausted.as_str(),
                        "message": "too many in-flight requests",
                    },
                    "retry_after_ms": retry_after_ms,
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::auth::Keyring;
    use crate::config::Config;
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get, Router};
    use std::path::PathBuf;
    use tower::ServiceExt;

    async fn state_with(
        max_in_flight: usize,
        max_payload_bytes: usize,
    ) -> (Arc<GatewayState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (sink, _handle) = AuditSink::open(dir.path().join("audit.log")).await.unwrap();

        let toml = format!(
            r#"
            [gateway]
            max_in_flight     = {max_in_flight}
            max_payload_bytes = {max_payload_bytes}
            "#
        );
        let config: Config = toml::from_str(&toml).unwrap();
        let keyring = Keyring::new(vec![7; 32], None).unwrap();
        let state = Arc::new(
            GatewayState::with_keyrings(
                Arc::new(config),
                PathBuf::new(),
                Arc::new(sink),
                keyring.clone(),
                keyring,
            )
            .unwrap(),
        );
        (state, dir)
    }

    fn app(state: Arc<GatewayState>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(state.clone(), admission_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn requests_under_both_bounds_pass() {
        let (state, _dir) = state_with(4, 1024).await;
        let resp = app(state)
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected_pre_decode() {
        let (state, _dir) = state_with(4, 64).await;
        let resp = app(state)
            .oneshot(
                HttpRequest::post("/")
                    .header("content-length", "65")
                    .body(Body::from(vec![0u8; 65]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn exhausted_semaphore_returns_retry_after_hint() {
        let (state, _dir) = state_with(1, 1024).await;

        // Hold the only permit so the middleware finds the gate closed.
        let _held = state.in_flight.clone().try_acquire_owned().unwrap();

        let resp = app(state)
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));

        let bytes = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], "resource_exhausted");
        assert_eq!(value["retry_after_ms"], 1000);
    }

    #[tokio::test]
    async fn permit_is_released_after_the_request_completes() {
        let (state, _dir) = state_with(1, 1024).await;

        let resp = app(state.clone())
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // The permit must be back.
        assert_eq!(state.in_flight.available_permits(), 1);
    }
}
