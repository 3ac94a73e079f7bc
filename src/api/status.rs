//! Public status endpoint (`GET /status`, port 8080).
//!
//! Safe to expose publicly without authentication.
//! Returns gateway liveness and aggregate component health only.
//!
//! What this endpoint **does not** include:
//! - Backend names or URLs
//! - Routing configuration
//! - Policy tables or cost ceilings
//! - Any value that could reveal internal infrastructure
//!
//! The admin port offers deeper introspection behind bearer auth.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::gateway::GatewayState;

/// `GET /status` — public liveness and component-health endpoint.
///
/// Example response:
/// ```json
/// {
///   "status": "ok",
///   "uptime_secs": 3600,
///   "components": {
///     "router": "ok",
///     "pii_detector": "ok",
///     "audit": "ok"
///   },
///   "in_flight": { "available": 64, "max": 64 }
/// }
/// ```
///
/// `audit` reports `degraded` once any event has been dropped under
/// backpressure — the count itself stays on the admin port.
pub async fn status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();
    let config = state.config();
    let audit_health = if state.audit.dropped() == 0 { "ok" } else { "degraded" };
    let router_health = if state.registry.snapshot().is_empty() { "empty" } else { "ok" };

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime_secs,
        "components": {
            "router": router_health,
            "pii_detector": "ok",
            "audit": audit_health,
        },
        "in_flight": {
            "available": state.in_flight.available_permits(),
            "max": config.gateway.max_in_flight,
        },
    }))
}
