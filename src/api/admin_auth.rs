//! Admin-port authentication.
//!
//! The admin surface exposes the audit log and the backend catalog, so it
//! carries its own gate, separate from the minted envelope tokens the client
//! port verifies: one static operator secret, resolved once at startup from
//! the environment variable named by `gateway.admin_token_env`. There is
//! nothing to decode — possession of the value is the whole claim.
//!
//! Leaving `admin_token_env` unset disables the gate entirely; that is only
//! sane when the admin port is reachable from a trusted network and nothing
//! else.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::gateway::GatewayState;

/// Middleware guarding every admin route.
///
/// The presented value is compared in constant time. The envelope tokens on
/// the client port are short-lived, but the operator secret is static — a
/// timing oracle here would get unlimited tries against a single value, so
/// the cheap `ct_eq` is warranted where a plain `==` would not be.
pub async fn admin_auth_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        // No operator secret configured — the gate is open.
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => {
            next.run(req).await
        }
        Some(_) => unauthorized("admin token not recognized"),
        None => unauthorized("admin API requires Authorization: Bearer <token>"),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"mpc-gateway-admin\"")],
        Json(json!({ "error": message })),
    )
        .into_response()
}
