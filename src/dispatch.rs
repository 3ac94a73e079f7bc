//! Cascade dispatcher — walks the router's chain until a result is accepted.
//!
//! For each attempt over `[primary, fallback₁, …]`: call the adapter, accept
//! when the reported confidence meets the backend's threshold, advance on a
//! retryable failure or a below-threshold result, stop hard on a
//! non-retryable failure. The chain order is the router's; the dispatcher
//! never re-orders it. Every attempt yields its own `processing.completed`
//! or `processing.failed` audit record.
//!
//! The request deadline is shared across the whole chain: an attempt that
//! crosses it is aborted and counts as a cascade step, and a chain that runs
//! out of time surfaces `timeout` rather than `backend_failed`.

use std::time::Instant;

use serde_json::{json, Value};

use crate::audit::{AuditEvent, AuditSink, EventType, Outcome};
use crate::backends::AdapterClient;
use crate::config::Config;
use crate::error::{ErrorCode, GatewayError};
use crate::registry::RegistrySnapshot;
use crate::router::RoutingDecision;

/// The accepted attempt, normalized for the response envelope.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub backend_id: String,
    pub content: String,
    pub confidence: f64,
    pub tokens_used: u32,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub fallback_used: bool,
}

pub struct Dispatcher<'a> {
    config: &'a Config,
    snapshot: &'a RegistrySnapshot,
    audit: &'a AuditSink,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a Config, snapshot: &'a RegistrySnapshot, audit: &'a AuditSink) -> Self {
        Self { config, snapshot, audit }
    }

    #[tracing::instrument(skip_all, fields(request_id, primary = %decision.backend_id))]
    pub async fn dispatch(
        &self,
        request_id: &str,
        prompt: &str,
        payload: &Value,
        decision: &RoutingDecision,
        deadline: Instant,
    ) -> Result<DispatchOutcome, GatewayError> {
        let chain: Vec<&str> = std::iter::once(decision.backend_id.as_str())
            .chain(decision.fallback_backends.iter().map(String::as_str))
            .collect();

        let mut last_error: Option<GatewayError> = None;

        for (attempt, backend_id) in chain.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_error = Some(GatewayError::new(
                    ErrorCode::Timeout,
                    "request deadline exhausted during dispatch",
                ));
                break;
            }

            let Some(descriptor) = self.snapshot.get(backend_id) else {
                // Registry/decision skew — possible only across a snapshot
                // swap mid-request. Treat as a retryable miss.
                tracing::warn!(backend = backend_id, "backend vanished from snapshot, skipping");
                continue;
            };
            let Some(entry) = self.config.backend(backend_id) else {
                tracing::warn!(backend = backend_id, "backend has no connection config, skipping");
                continue;
            };

            let client = match AdapterClient::new(entry) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(backend = backend_id, error = %e, "skipping backend — client build failed");
                    continue;
                }
            };

            let t0 = Instant::now();
            let result = tokio::time::timeout(remaining, client.execute(prompt, payload)).await;
            let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;

            match result {
                Err(_elapsed) => {
                    self.emit_attempt(
                        request_id,
                        backend_id,
                        Outcome::Error,
                        latency_ms,
                        json!({ "error": "attempt deadline exceeded" }),
                    )
                    .await;
                    last_error = Some(GatewayError::new(
                        ErrorCode::Timeout,
                        format!("backend `{backend_id}` exceeded the request deadline"),
                    ));
                    // Crossing the deadline aborts this attempt; the loop's
                    // remaining-time check decides whether anything is left.
                    continue;
                }
                Ok(Err(adapter_err)) => {
                    self.emit_attempt(
                        request_id,
                        backend_id,
                        Outcome::Failure,
                        latency_ms,
                        json!({ "error": adapter_err.to_string() }),
                    )
                    .await;

                    if !adapter_err.retryable() {
                        return Err(GatewayError::new(
                            ErrorCode::BackendFailed,
                            format!("backend `{backend_id}` rejected the request: {adapter_err}"),
                        ));
                    }
                    tracing::warn!(backend = backend_id, error = %adapter_err, "attempt failed — advancing cascade");
                    last_error = Some(GatewayError::new(
                        ErrorCode::BackendFailed,
                        format!("backend `{backend_id}` failed: {adapter_err}"),
                    ));
                }
                Ok(Ok(response)) => {
                    if response.confidence >= descriptor.confidence_threshold {
                        let cost_usd = descriptor.estimated_cost(response.tokens_used);
                        self.emit_attempt(
                            request_id,
                            backend_id,
                            Outcome::Success,
                            latency_ms,
                            json!({ "cost_usd": cost_usd, "confidence": response.confidence }),
                        )
                        .await;

                        return Ok(DispatchOutcome {
                            backend_id: backend_id.to_string(),
                            content: response.content,
                            confidence: response.confidence,
                            tokens_used: response.tokens_used,
                            cost_usd,
                            latency_ms,
                            fallback_used: attempt > 0,
                        });
                    }

                    self.emit_attempt(
                        request_id,
                        backend_id,
                        Outcome::Failure,
                        latency_ms,
                        json!({
                            "error": "confidence below backend threshold",
                            "confidence": response.confidence,
                            "threshold": descriptor.confidence_threshold,
                        }),
                    )
                    .await;
                    tracing::debug!(
                        backend = backend_id,
                        confidence = response.confidence,
                        threshold = descriptor.confidence_threshold,
                        "low confidence — advancing cascade"
                    );
                    last_error = Some(GatewayError::new(
                        ErrorCode::BackendFailed,
                        format!(
                            "backend `{backend_id}` confidence {:.2} below threshold {:.2}",
                            response.confidence, descriptor.confidence_threshold
                        ),
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::new(ErrorCode::BackendFailed, "no dispatchable backend in the chain")
        }))
    }

    async fn emit_attempt(
        &self,
        request_id: &str,
        backend_id: &str,
        outcome: Outcome,
        latency_ms: f64,
        context: Value,
    ) {
        let event_type = match outcome {
            Outcome::Success => EventType::ProcessingCompleted,
            _ => EventType::ProcessingFailed,
        };
        let mut event = AuditEvent::new(
            event_type,
            "system",
            "process",
            &format!("backend:{backend_id}"),
            outcome,
        )
        .with_context("request_id", json!(request_id))
        .with_context("latency_ms", json!(latency_ms));
        if let Some(object) = context.as_object() {
            for (key, value) in object {
                event = event.with_context(key, value.clone());
            }
        }
        self.audit.emit(event).await;
    }
}
