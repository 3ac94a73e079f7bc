//! Backend adapter factory and unified dispatch interface.
//!
//! [`AdapterClient`] is an enum that wraps a concrete adapter chosen at
//! construction time from the backend's connection config. The dispatcher
//! interacts with the same two-method API (`execute`, `health_check`);
//! protocol differences — auth headers, endpoint paths, in-process rule
//! evaluation — are fully encapsulated in the adapter modules. The
//! orchestrator never sees vendor-specific objects.

mod local;
mod openai;
mod rules;

pub use local::LocalAdapter;
pub use openai::OpenAiAdapter;
pub use rules::RuleEngineAdapter;

use serde_json::Value;

use crate::config::{AdapterKind, BackendEntry};

/// Typed adapter failure, split the way the cascade needs it:
/// retryable failures advance the chain, non-retryable ones stop it.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl AdapterError {
    /// Timeouts, transport faults, 5xx-equivalents, and malformed responses
    /// may succeed on a different backend; 4xx-equivalents (bad request,
    /// backend authn) will not.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(_) | Self::Timeout | Self::Protocol(_) => true,
        }
    }

    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Normalized adapter result. Cost is computed by the dispatcher from the
/// backend descriptor; adapters only report what they observed.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub content: String,
    /// Reported confidence in `(0, 1]`; adapters without a native notion of
    /// confidence report a fixed per-protocol default.
    pub confidence: f64,
    pub tokens_used: u32,
}

/// Unified backend client — enum dispatch over concrete adapters.
pub enum AdapterClient {
    OpenAi(OpenAiAdapter),
    Local(LocalAdapter),
    Rules(RuleEngineAdapter),
}

impl AdapterClient {
    /// Build an adapter from a backend's connection config.
    ///
    /// # Errors
    /// Returns an error when an HTTP adapter is configured without a
    /// `base_url` — surfaced at startup validation, but re-checked here so
    /// the dispatcher can trust the constructor.
    pub fn new(entry: &BackendEntry) -> anyhow::Result<Self> {
        Ok(match entry.adapter {
            AdapterKind::OpenAi => {
                let base_url = required_base_url(entry)?;
                Self::OpenAi(OpenAiAdapter::new(
                    base_url,
                    entry.request_timeout_ms,
                    entry.api_key(),
                    entry.model.clone(),
                ))
            }
            AdapterKind::Local => {
                let base_url = required_base_url(entry)?;
                Self::Local(LocalAdapter::new(
                    base_url,
                    entry.request_timeout_ms,
                    entry.model.clone(),
                ))
            }
            AdapterKind::Rules => Self::Rules(RuleEngineAdapter::new()),
        })
    }

    /// Execute the validated prompt against this backend.
    pub async fn execute(
        &self,
        prompt: &str,
        payload: &Value,
    ) -> Result<AdapterResponse, AdapterError> {
        match self {
            Self::OpenAi(a) => a.execute(prompt, payload).await,
            Self::Local(a) => a.execute(prompt, payload).await,
            Self::Rules(a) => a.execute(prompt),
        }
    }

    /// Probe this backend for liveness. Implementation varies by adapter.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        match self {
            Self::OpenAi(a) => a.health_check().await,
            Self::Local(a) => a.health_check().await,
            Self::Rules(_) => Ok(()),
        }
    }
}

fn required_base_url(entry: &BackendEntry) -> anyhow::Result<String> {
    entry
        .base_url
        .as_deref()
        .map(|url| url.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            anyhow::anyhow!("backend `{}` requires a base_url for its adapter", entry.descriptor.id)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendEntry;
    use crate::registry::{BackendDescriptor, BackendType, Capability};
    use serde_json::json;
    use std::collections::BTreeSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry_for(server: &MockServer, adapter: AdapterKind) -> BackendEntry {
        BackendEntry {
            descriptor: BackendDescriptor {
                id: "test:backend".into(),
                backend_type: BackendType::LlmSmall,
                capabilities: BTreeSet::from([Capability::TextGeneration]),
                cost_per_1k_tokens: 0.001,
                avg_latency_ms: 100.0,
                max_tokens: 4096,
                confidence_threshold: 0.0,
                pii_allowed: false,
                sensitivity_allowed: BTreeSet::from([
                    crate::contract::Sensitivity::Public,
                    crate::contract::Sensitivity::Internal,
                ]),
            },
            adapter,
            base_url: Some(server.uri()),
            api_key_env: None,
            model: Some("test-model".into()),
            request_timeout_ms: 5_000,
        }
    }

    fn completion_body(content: &str) -> serde_json::Value {
        json!({
            "choices": [{ "message": { "content": content } }],
            "usage": { "total_tokens": 42 }
        })
    }

    // -----------------------------------------------------------------------
    // AdapterError taxonomy
    // -----------------------------------------------------------------------

    #[test]
    fn five_xx_and_transport_errors_are_retryable() {
        assert!(AdapterError::Status { status: 500, body: String::new() }.retryable());
        assert!(AdapterError::Status { status: 503, body: String::new() }.retryable());
        assert!(AdapterError::Status { status: 429, body: String::new() }.retryable());
        assert!(AdapterError::Timeout.retryable());
        assert!(AdapterError::Transport("reset".into()).retryable());
    }

    #[test]
    fn four_xx_errors_are_not_retryable() {
        assert!(!AdapterError::Status { status: 400, body: String::new() }.retryable());
        assert!(!AdapterError::Status { status: 401, body: String::new() }.retryable());
        assert!(!AdapterError::Status { status: 404, body: String::new() }.retryable());
    }

    // -----------------------------------------------------------------------
    // execute
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn execute_returns_content_and_token_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("The answer.")))
            .mount(&server)
            .await;

        let client = AdapterClient::new(&entry_for(&server, AdapterKind::OpenAi)).unwrap();
        let response = client.execute("question", &json!({})).await.unwrap();
        assert_eq!(response.content, "The answer.");
        assert_eq!(response.tokens_used, 42);
    }

    #[tokio::test]
    async fn execute_maps_5xx_to_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = AdapterClient::new(&entry_for(&server, AdapterKind::OpenAi)).unwrap();
        let err = client.execute("question", &json!({})).await.unwrap_err();
        assert!(matches!(err, AdapterError::Status { status: 503, .. }));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn execute_maps_bad_json_to_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json {{{"))
            .mount(&server)
            .await;

        let client = AdapterClient::new(&entry_for(&server, AdapterKind::OpenAi)).unwrap();
        let err = client.execute("question", &json!({})).await.unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }

    #[tokio::test]
    async fn rules_adapter_needs_no_base_url() {
        let mut entry = entry_for(&MockServer::start().await, AdapterKind::Rules);
        entry.base_url = None;
        let client = AdapterClient::new(&entry).unwrap();
        let response = client.execute("hello there", &json!({})).await.unwrap();
        assert!(response.content.contains("GREETING"));
    }

    #[test]
    fn http_adapter_without_base_url_is_a_config_error() {
        let server_less = BackendEntry {
            base_url: None,
            ..entry_for_dummy()
        };
        assert!(AdapterClient::new(&server_less).is_err());
    }

    fn entry_for_dummy() -> BackendEntry {
        BackendEntry {
            descriptor: BackendDescriptor {
                id: "x".into(),
                backend_type: BackendType::LlmSmall,
                capabilities: BTreeSet::from([Capability::TextGeneration]),
                cost_per_1k_tokens: 0.001,
                avg_latency_ms: 100.0,
                max_tokens: 4096,
                confidence_threshold: 0.0,
                pii_allowed: false,
                sensitivity_allowed: BTreeSet::new(),
            },
            adapter: AdapterKind::OpenAi,
            base_url: None,
            api_key_env: None,
            model: None,
            request_timeout_ms: 5_000,
        }
    }

    // -----------------------------------------------------------------------
    // health_check
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_check_passes_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let client = AdapterClient::new(&entry_for(&server, AdapterKind::OpenAi)).unwrap();
        assert!(client.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn health_check_fails_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = AdapterClient::new(&entry_for(&server, AdapterKind::OpenAi)).unwrap();
        assert!(client.health_check().await.is_err());
    }
}
