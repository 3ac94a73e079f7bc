//! Backend selection — the brain of mpc-gateway.
//!
//! Routing composes three stages over a registry snapshot:
//!
//! - **Candidate set**: backends advertising the required capability and
//!   cleared for the request's sensitivity, narrowed by a non-`auto` hint.
//! - **Constraint solver**: discard candidates breaking the cost ceiling,
//!   the latency budget, or the confidence floor; pick minimum cost, then
//!   minimum latency, then lexicographic id. If nothing survives, relax cost
//!   and latency (never sensitivity) and take the cheapest candidate.
//! - **Cascade chain**: with `max_retries > 0`, the fallbacks are the next
//!   candidates by ascending cost, restricted to those strictly more
//!   expensive than the primary — after a low-confidence result on a cheap
//!   backend we pay more for quality, we do not sidegrade.
//!
//! The router is deterministic and pure: identical inputs against a given
//! snapshot always yield the identical decision.

use serde::Serialize;

use crate::contract::{ProcessingHint, Sensitivity};
use crate::registry::{hint_backend_types, BackendDescriptor, BackendType, Capability, RegistrySnapshot};

/// Everything the router needs to decide. Assembled by the orchestrator.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub capability: Capability,
    pub sensitivity: Sensitivity,
    pub processing_hint: ProcessingHint,
    /// Per-request cost ceiling in USD (from the principal's role).
    pub max_cost: f64,
    /// Latency budget — the request's `timeout_ms`.
    pub max_latency_ms: f64,
    pub estimated_tokens: u32,
    pub max_retries: u32,
}

/// The routing outcome handed to the dispatcher and the audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub backend_id: String,
    pub backend_type: BackendType,
    pub reason: String,
    pub confidence: f64,
    pub estimated_cost: f64,
    pub estimated_latency_ms: f64,
    /// Ordered fallbacks, length ≤ `max_retries`. Never contains the primary.
    pub fallback_backends: Vec<String>,
    /// True when the solver had to drop the cost/latency constraints.
    pub relaxed: bool,
}

/// No backend satisfies even the relaxed constraints.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RouteError(pub String);

/// Infer the required capability from the payload-schema name, unless the
/// client supplied one explicitly.
///
/// A deliberately shallow heuristic: schema names containing `security`,
/// `extract`, or `classify` map to the matching capability, everything else
/// is text generation.
pub fn infer_capability(payload_schema: &str, explicit: Option<Capability>) -> Capability {
    if let Some(capability) = explicit {
        return capability;
    }
    if payload_schema.contains("security") {
        Capability::SecurityScan
    } else if payload_schema.contains("extract") {
        Capability::Extraction
    } else if payload_schema.contains("classify") {
        Capability::Classification
    } else {
        Capability::TextGeneration
    }
}

/// The multi-strategy backend selector.
pub struct Router {
    /// Stage-2 floor on descriptor confidence thresholds. 0.0 disables it.
    confidence_floor: f64,
}

impl Router {
    pub fn new(confidence_floor: f64) -> Self {
        Self { confidence_floor }
    }

    #[tracing::instrument(skip(self, snapshot), fields(capability = %request.capability, sensitivity = %request.sensitivity))]
    pub fn route(
        &self,
        request: &RouteRequest,
        snapshot: &RegistrySnapshot,
    ) -> Result<RoutingDecision, RouteError> {
        // Stage 1: candidate set.
        let elevated = matches!(request.sensitivity, Sensitivity::Pii | Sensitivity::Confidential);
        let mut candidates: Vec<&BackendDescriptor> = snapshot
            .backends()
            .iter()
            .filter(|b| b.capabilities.contains(&request.capability))
            .filter(|b| b.sensitivity_allowed.contains(&request.sensitivity))
            .filter(|b| !elevated || b.pii_allowed)
            .collect();

        if candidates.is_empty() {
            return Err(RouteError(format!(
                "no backend supports capability '{}' at sensitivity '{}'",
                request.capability, request.sensitivity
            )));
        }

        if let Some(allowed_types) = hint_backend_types(request.processing_hint) {
            candidates.retain(|b| allowed_types.contains(&b.backend_type));
            if candidates.is_empty() {
                return Err(RouteError(format!(
                    "no backend of the types required by hint '{}' supports capability '{}' at sensitivity '{}'",
                    request.processing_hint, request.capability, request.sensitivity
                )));
            }
        }

        // Stage 2: constraint solver.
        let mut survivors: Vec<&BackendDescriptor> = candidates
            .iter()
            .copied()
            .filter(|b| b.estimated_cost(request.estimated_tokens) <= request.max_cost)
            .filter(|b| b.avg_latency_ms <= request.max_latency_ms)
            .filter(|b| b.confidence_threshold >= self.confidence_floor)
            .collect();

        let relaxed = survivors.is_empty();
        if relaxed {
            // Relaxation: drop cost and latency, never sensitivity.
            tracing::warn!("no backend meets cost/latency constraints, relaxing");
            survivors = candidates.clone();
        }

        survivors.sort_by(|a, b| cheapest_first(a, b, request.estimated_tokens));
        let primary = survivors[0];

        // Stage 3: cascade chain.
        let primary_cost = primary.estimated_cost(request.estimated_tokens);
        let mut upgrades: Vec<&BackendDescriptor> = candidates
            .iter()
            .copied()
            .filter(|b| b.id != primary.id)
            .filter(|b| b.estimated_cost(request.estimated_tokens) > primary_cost)
            .collect();
        upgrades.sort_by(|a, b| cheapest_first(a, b, request.estimated_tokens));
        let fallback_backends: Vec<String> = upgrades
            .into_iter()
            .take(request.max_retries as usize)
            .map(|b| b.id.clone())
            .collect();

        let mut reason = format!(
            "selected '{}' for capability={} sensitivity={} hint={}",
            primary.id, request.capability, request.sensitivity, request.processing_hint
        );
        if relaxed {
            reason.push_str("; cost/latency constraints relaxed");
        }

        tracing::debug!(backend = %primary.id, fallbacks = fallback_backends.len(), relaxed, "routed");

        Ok(RoutingDecision {
            backend_id: primary.id.clone(),
            backend_type: primary.backend_type,
            reason,
            confidence: primary.confidence_threshold,
            estimated_cost: primary_cost,
            estimated_latency_ms: primary.avg_latency_ms,
            fallback_backends,
            relaxed,
        })
    }
}

/// Deterministic ordering: minimum estimated cost, then minimum latency,
/// then lexicographic id.
fn cheapest_first(
    a: &BackendDescriptor,
    b: &BackendDescriptor,
    estimated_tokens: u32,
) -> std::cmp::Ordering {
    let cost_a = a.estimated_cost(estimated_tokens);
    let cost_b = b.estimated_cost(estimated_tokens);
    cost_a
        .partial_cmp(&cost_b)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| {
            a.avg_latency_ms.partial_cmp(&b.avg_latency_ms).unwrap_or(std::cmp::Ordering::Equal)
        })
        .then_with(|| a.id.cmp(&b.id))
}
