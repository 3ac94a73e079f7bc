//! In-memory catalog of backend descriptors.
//!
//! The registry is process-wide and read-mostly. Mutations are whole-snapshot
//! swaps under a writer lock: the router only ever consumes an
//! [`Arc<RegistrySnapshot>`], so a request routed against one snapshot never
//! observes a mid-request mutation.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::contract::{ProcessingHint, Sensitivity};

/// Backend families. Single declaration — router, guard, and config import
/// from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    LlmLarge,
    LlmMedium,
    LlmSmall,
    LlmPrivate,
    RuleEngine,
    Classifier,
    RegexEngine,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmLarge => "llm_large",
            Self::LlmMedium => "llm_medium",
            Self::LlmSmall => "llm_small",
            Self::LlmPrivate => "llm_private",
            Self::RuleEngine => "rule_engine",
            Self::Classifier => "classifier",
            Self::RegexEngine => "regex_engine",
        }
    }

    /// Deterministic engines carry no per-token cost.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::RuleEngine | Self::RegexEngine)
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Functional labels a backend advertises and a request requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    Classification,
    Extraction,
    Summarization,
    Translation,
    CodeGeneration,
    Analysis,
    SecurityScan,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextGeneration => "text_generation",
            Self::Classification => "classification",
            Self::Extraction => "extraction",
            Self::Summarization => "summarization",
            Self::Translation => "translation",
            Self::CodeGeneration => "code_generation",
            Self::Analysis => "analysis",
            Self::SecurityScan => "security_scan",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing-facing description of one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Stable identifier, e.g. `"openai:gpt-4"` or `"local:rules"`.
    pub id: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub capabilities: BTreeSet<Capability>,
    pub cost_per_1k_tokens: f64,
    pub avg_latency_ms: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub pii_allowed: bool,
    #[serde(default = "default_sensitivity_allowed")]
    pub sensitivity_allowed: BTreeSet<Sensitivity>,
}

fn default_sensitivity_allowed() -> BTreeSet<Sensitivity> {
    BTreeSet::from([Sensitivity::Public, Sensitivity::Internal])
}

impl BackendDescriptor {
    /// Enforce the descriptor invariants before a descriptor enters the
    /// registry; a bad entry is a configuration error, not a routing one.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.id.is_empty(), "backend id must not be empty");
        anyhow::ensure!(
            self.cost_per_1k_tokens >= 0.0,
            "backend `{}`: cost_per_1k_tokens must be non-negative",
            self.id
        );
        anyhow::ensure!(
            self.avg_latency_ms > 0.0,
            "backend `{}`: avg_latency_ms must be positive",
            self.id
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.confidence_threshold),
            "backend `{}`: confidence_threshold must be within [0, 1]",
            self.id
        );
        anyhow::ensure!(!self.capabilities.is_empty(), "backend `{}`: no capabilities", self.id);

        if self.pii_allowed {
            anyhow::ensure!(
                self.sensitivity_allowed.contains(&Sensitivity::Pii)
                    && self.sensitivity_allowed.contains(&Sensitivity::Confidential),
                "backend `{}`: pii_allowed requires `pii` and `confidential` in sensitivity_allowed",
                self.id
            );
        }
        if self.backend_type.is_deterministic() {
            anyhow::ensure!(
                self.cost_per_1k_tokens == 0.0,
                "backend `{}`: {} backends must have zero token cost",
                self.id,
                self.backend_type
            );
        }
        Ok(())
    }

    /// Cost of serving `estimated_tokens` tokens on this backend, in USD.
    pub fn estimated_cost(&self, estimated_tokens: u32) -> f64 {
        (estimated_tokens as f64 / 1000.0) * self.cost_per_1k_tokens
    }
}

/// Immutable view of the registry at one point in time, sorted by id.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    backends: Vec<BackendDescriptor>,
}

impl RegistrySnapshot {
    fn new(mut backends: Vec<BackendDescriptor>) -> Self {
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        Self { backends }
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn get(&self, id: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.id == id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Process-wide backend catalog.
pub struct BackendRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl BackendRegistry {
    /// Build a registry from startup configuration, validating every entry.
    /// Later entries replace earlier ones with the same id.
    pub fn from_descriptors(descriptors: Vec<BackendDescriptor>) -> anyhow::Result<Self> {
        let mut deduped: Vec<BackendDescriptor> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            descriptor.validate()?;
            deduped.retain(|existing| existing.id != descriptor.id);
            deduped.push(descriptor);
        }
        Ok(Self { snapshot: RwLock::new(Arc::new(RegistrySnapshot::new(deduped))) })
    }

    /// Register (or replace) one descriptor. Idempotent on `id`.
    pub fn register(&self, descriptor: BackendDescriptor) -> anyhow::Result<()> {
        descriptor.validate()?;
        let mut guard = self.snapshot.write().expect("registry lock poisoned");
        let mut backends = guard.backends.clone();
        backends.retain(|existing| existing.id != descriptor.id);
        backends.push(descriptor);
        *guard = Arc::new(RegistrySnapshot::new(backends));
        Ok(())
    }

    /// Replace the whole catalog — used by config hot-reload.
    pub fn replace_all(&self, descriptors: Vec<BackendDescriptor>) -> anyhow::Result<()> {
        let fresh = Self::from_descriptors(descriptors)?;
        let fresh_snapshot = fresh.snapshot();
        *self.snapshot.write().expect("registry lock poisoned") = fresh_snapshot;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<BackendDescriptor> {
        self.snapshot().get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.snapshot().backends().iter().map(|b| b.id.clone()).collect()
    }

    /// The lock is held only for the duration of `Arc::clone`, so readers
    /// never contend with request handling.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }
}

/// Backend types a non-`auto` processing hint narrows routing to.
/// `None` means the hint does not constrain the type set.
pub fn hint_backend_types(hint: ProcessingHint) -> Option<&'static [BackendType]> {
    match hint {
        ProcessingHint::Auto | ProcessingHint::Hybrid => None,
        ProcessingHint::ModelSmall => Some(&[BackendType::LlmSmall]),
        ProcessingHint::ModelLarge => Some(&[BackendType::LlmLarge]),
        ProcessingHint::ModelPrivate => Some(&[BackendType::LlmPrivate]),
        ProcessingHint::RuleEngine => Some(&[BackendType::RuleEngine, BackendType::RegexEngine]),
    }
}
