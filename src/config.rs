//! Configuration types for mpc-gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. Secrets never live in the
//! file — the config names environment variables, the gateway resolves them.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//! audit_log = "mpc_audit.log"
//!
//! [secrets]
//! token_key_env   = "MPC_TOKEN_KEY"
//! signing_key_env = "MPC_SIGNING_KEY"
//!
//! [[backends]]
//! id                 = "rules:classifier"
//! type               = "rule_engine"
//! capabilities       = ["classification", "security_scan"]
//! cost_per_1k_tokens = 0.0
//! avg_latency_ms     = 5
//! max_tokens         = 4096
//! adapter            = "rules"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::auth::{Keyring, Role};
use crate::registry::BackendDescriptor;

/// Which adapter a backend entry is dispatched through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum AdapterKind {
    /// OpenAI-compatible `/v1/chat/completions` protocol — cloud LLM tiers.
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// Keyless on-prem inference server (OpenAI-compat endpoint).
    #[serde(rename = "local")]
    Local,
    /// In-process deterministic rule/regex engine. No network, no cost.
    #[serde(rename = "rules")]
    Rules,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Local => "local",
            Self::Rules => "rules",
        })
    }
}

/// One `[[backends]]` entry: the routing descriptor plus how to reach it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEntry {
    #[serde(flatten)]
    pub descriptor: BackendDescriptor,

    #[serde(default)]
    pub adapter: AdapterKind,

    /// Base URL for HTTP adapters. Must be absent for `rules`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable name whose value is the API key.
    ///
    /// Leave unset for keyless backends (local inference, rule engines).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Model name sent to the backend, when the payload does not name one.
    #[serde(default)]
    pub model: Option<String>,

    /// Per-attempt HTTP timeout in milliseconds (default: 30 000). The
    /// request deadline still applies on top of this.
    #[serde(default = "defaults::timeout_ms")]
    pub request_timeout_ms: u64,
}

impl BackendEntry {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    /// The backend catalog — routing descriptors plus connection details.
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.gateway.max_in_flight > 0, "gateway.max_in_flight must be positive");
        anyhow::ensure!(
            self.gateway.max_payload_bytes > 0,
            "gateway.max_payload_bytes must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.gateway.confidence_floor),
            "gateway.confidence_floor must be within [0, 1]"
        );

        for pattern in &self.detection.injection_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("invalid injection pattern `{pattern}`"))?;
        }

        let mut seen = HashSet::new();
        for entry in &self.backends {
            entry.descriptor.validate()?;
            anyhow::ensure!(
                seen.insert(entry.descriptor.id.as_str()),
                "duplicate backend id `{}`",
                entry.descriptor.id
            );

            match entry.adapter {
                AdapterKind::Rules => {
                    anyhow::ensure!(
                        entry.descriptor.backend_type.is_deterministic(),
                        "backend `{}`: the rules adapter requires a rule_engine or regex_engine type",
                        entry.descriptor.id
                    );
                    anyhow::ensure!(
                        entry.base_url.is_none(),
                        "backend `{}`: the rules adapter takes no base_url",
                        entry.descriptor.id
                    );
                }
                AdapterKind::OpenAi | AdapterKind::Local => {
                    anyhow::ensure!(
                        entry.base_url.is_some(),
                        "backend `{}`: adapter `{}` requires a base_url",
                        entry.descriptor.id,
                        entry.adapter
                    );
                    anyhow::ensure!(
                        !entry.descriptor.backend_type.is_deterministic(),
                        "backend `{}`: deterministic backend types must use the rules adapter",
                        entry.descriptor.id
                    );
                }
            }
        }

        Ok(())
    }

    /// Look up one backend entry by descriptor id.
    pub fn backend(&self, id: &str) -> Option<&BackendEntry> {
        self.backends.iter().find(|b| b.descriptor.id == id)
    }

    /// The routing descriptors, for seeding the registry.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends.iter().map(|b| b.descriptor.clone()).collect()
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the application-facing client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Audit log file path (default: `mpc_audit.log`). Rotated externally;
    /// the gateway only appends.
    #[serde(default = "defaults::audit_log")]
    pub audit_log: PathBuf,

    /// Maximum request body size in bytes; larger requests are rejected
    /// before decoding (default: 1 MiB).
    #[serde(default = "defaults::max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Maximum concurrent in-flight requests (default: 64). Admission beyond
    /// the bound returns `resource_exhausted`.
    #[serde(default = "defaults::max_in_flight")]
    pub max_in_flight: usize,

    /// `retry-after` hint attached to `resource_exhausted` responses, in
    /// milliseconds (default: 1000).
    #[serde(default = "defaults::retry_after_ms")]
    pub retry_after_ms: u64,

    /// Router stage-2 floor on backend confidence thresholds
    /// (default: 0.0 = disabled).
    #[serde(default)]
    pub confidence_floor: f64,

    /// Idempotency cache: maximum distinct keys retained (default: 1024).
    #[serde(default = "defaults::idempotency_capacity")]
    pub idempotency_capacity: usize,

    /// Idempotency cache: replay window in seconds (default: 600).
    #[serde(default = "defaults::idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication (only
    /// recommended when the admin port is strictly firewalled).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Environment variable names for the two keyrings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretsConfig {
    #[serde(default = "defaults::token_key_env")]
    pub token_key_env: String,
    #[serde(default)]
    pub token_key_previous_env: Option<String>,
    #[serde(default = "defaults::signing_key_env")]
    pub signing_key_env: String,
    #[serde(default)]
    pub signing_key_previous_env: Option<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            token_key_env: defaults::token_key_env(),
            token_key_previous_env: None,
            signing_key_env: defaults::signing_key_env(),
            signing_key_previous_env: None,
        }
    }
}

impl SecretsConfig {
    pub fn token_keyring(&self) -> anyhow::Result<Keyring> {
        resolve_keyring(&self.token_key_env, self.token_key_previous_env.as_deref())
    }

    pub fn signing_keyring(&self) -> anyhow::Result<Keyring> {
        resolve_keyring(&self.signing_key_env, self.signing_key_previous_env.as_deref())
    }
}

fn resolve_keyring(current_env: &str, previous_env: Option<&str>) -> anyhow::Result<Keyring> {
    let current = std::env::var(current_env)
        .with_context(|| format!("secret environment variable `{current_env}` is not set"))?;
    let previous = previous_env
        .map(|var| {
            std::env::var(var)
                .with_context(|| format!("secret environment variable `{var}` is not set"))
        })
        .transpose()?;
    Keyring::new(current.into_bytes(), previous.map(String::into_bytes))
}

/// Policy table overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Per-role cost ceiling overrides in USD, e.g. `user = 0.25`.
    #[serde(default)]
    pub cost_ceilings: HashMap<Role, f64>,
}

/// Detection corpus extensions.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DetectionConfig {
    /// Extra injection patterns appended to the built-in corpus.
    #[serde(default)]
    pub injection_patterns: Vec<String>,
}

mod defaults {
    use std::path::PathBuf;

    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn audit_log() -> PathBuf { PathBuf::from("mpc_audit.log") }
    pub fn max_payload_bytes() -> usize { 1024 * 1024 }
    pub fn max_in_flight() -> usize { 64 }
    pub fn retry_after_ms() -> u64 { 1000 }
    pub fn idempotency_capacity() -> usize { 1024 }
    pub fn idempotency_ttl_secs() -> u64 { 600 }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn token_key_env() -> String { "MPC_TOKEN_KEY".into() }
    pub fn signing_key_env() -> String { "MPC_SIGNING_KEY".into() }
}
