//! Transport correlation ID middleware.
//!
//! Every HTTP exchange gets a [`CorrelationId`] carried in the
//! `x-request-id` header. This is deliberately distinct from the envelope's
//! own `request_id`, which lives in the body and drives the audit trail:
//! the correlation ID ties server log lines to one HTTP exchange even when
//! the body never decodes (oversized, malformed, or rejected at admission).
//!
//! A caller may supply the header to stitch the gateway into its own trace.
//! Supplied values are sanitized before use — they land verbatim in log
//! output, so anything oversized or carrying non-printable bytes is replaced
//! with a minted UUID instead of being propagated.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

/// Header carrying the correlation ID in both directions.
pub const CORRELATION_HEADER: &str = "x-request-id";

/// Longest caller-supplied ID accepted before the gateway mints its own.
const MAX_CALLER_ID_LEN: usize = 128;

/// The per-exchange correlation ID, readable from any handler:
/// ```rust,ignore
/// async fn handler(Extension(id): Extension<CorrelationId>) { ... }
/// ```
#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

/// Keep a sane caller-supplied ID, mint a UUID v4 otherwise.
fn accept_or_mint(req: &Request) -> String {
    req.headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty() && id.len() <= MAX_CALLER_ID_LEN)
        .filter(|id| id.chars().all(|c| c.is_ascii_graphic()))
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Axum middleware: resolve the [`CorrelationId`], expose it as an
/// extension, wrap the handler in a span naming it, and echo it back on the
/// response. Layer this inside the `tower_http::TraceLayer` so the span
/// nests under the HTTP trace.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = accept_or_mint(&req);
    req.extensions_mut().insert(CorrelationId(id.clone()));

    let span = tracing::info_span!("exchange", correlation_id = %id);
    let mut response = next.run(req).instrument(span).await;

    // Sanitized IDs are always valid header bytes; minted UUIDs trivially so.
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    response
}
