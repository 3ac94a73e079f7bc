//! Admin API (port 8081) — operator-facing introspection endpoints.
//!
//! These endpoints are separated onto a different port so they can be
//! network-restricted independently of the client API (e.g. accessible only
//! from the internal Docker network, never exposed to the internet).
//!
//! The audit query endpoints are investigation tooling: the linear scan over
//! the log file is cheap at gateway scale, and every filter the sink's query
//! helpers support is reachable from here.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use crate::audit::{AuditQuery, QueryFilter};
use crate::error::AppError;
use crate::gateway::GatewayState;

/// Build the admin-facing axum router (port 8081).
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/audit", get(audit))
        .route("/admin/backends", get(backends))
        .route("/admin/config", get(config))
        .with_state(state)
}

/// GET /admin/health — liveness plus catalog counts.
pub async fn health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "status": "ok",
        "backends": snapshot.len(),
        "audit_dropped": state.audit.dropped(),
    }))
}

/// GET /admin/audit — scan the audit log with the standard filters.
///
/// Query parameters mirror [`QueryFilter`]: `event_type` (dotted wire name,
/// e.g. `request.denied`), `actor`, `outcome`, `since`/`until` (RFC 3339),
/// `limit`.
pub async fn audit(
    State(state): State<Arc<GatewayState>>,
    Query(filter): Query<QueryFilter>,
) -> Result<Json<Value>, AppError> {
    let query = AuditQuery::new(&state.config().gateway.audit_log);
    let events = query.query(&filter).await?;
    Ok(Json(json!({
        "count": events.len(),
        "events": events,
    })))
}

/// GET /admin/backends — the live registry snapshot, descriptors only.
pub async fn backends(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    Json(json!({ "backends": snapshot.backends() }))
}

/// GET /admin/config — returns the current config with secrets redacted.
pub async fn config(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let cfg = state.config();

    // Redact secrets — show env var names but never resolved values.
    let backends: Vec<Value> = cfg
        .backends
        .iter()
        .map(|b| {
            json!({
                "id": b.descriptor.id,
                "type": b.descriptor.backend_type.as_str(),
                "adapter": b.adapter.to_string(),
                "base_url": b.base_url,
                "api_key_env": b.api_key_env,
            })
        })
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "audit_log": cfg.gateway.audit_log,
            "max_payload_bytes": cfg.gateway.max_payload_bytes,
            "max_in_flight": cfg.gateway.max_in_flight,
            "confidence_floor": cfg.gateway.confidence_floor,
        },
        "secrets": {
            "token_key_env": cfg.secrets.token_key_env,
            "signing_key_env": cfg.secrets.signing_key_env,
        },
        "backends": backends,
    }))
}
