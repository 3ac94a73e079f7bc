//! Private / on-prem model adapter.
//!
//! On-prem inference servers (Ollama, vLLM, LocalAI and friends) ship an
//! OpenAI-compatible `/v1/chat/completions` endpoint, so this adapter is
//! intentionally thin — it speaks the same HTTP path, handles the
//! keyless-auth case transparently, and uses the server's root `/` endpoint
//! for health checks rather than `/v1/models`.

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde_json::{json, Value};

use super::{AdapterError, AdapterResponse};

/// On-prem models are typically smaller; their answers are trusted a notch
/// less than the cloud tiers when no confidence is reported.
const DEFAULT_CONFIDENCE: f64 = 0.75;

/// Adapter for a locally-running private inference server.
pub struct LocalAdapter {
    client: Client,
    base_url: String,
    model: Option<String>,
}

impl LocalAdapter {
    /// Build a local adapter. No API key is required for typical deployments.
    pub fn new(base_url: String, timeout_ms: u64, model: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self { client, base_url, model }
    }

    /// Execute a prompt via the server's OpenAI-compat endpoint.
    pub async fn execute(
        &self,
        prompt: &str,
        payload: &Value,
    ) -> Result<AdapterResponse, AdapterError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut body = json!({
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(model) = payload.get("model").and_then(Value::as_str).or(self.model.as_deref())
        {
            body["model"] = json!(model);
        }

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(AdapterError::from_reqwest)?;

        if !status.is_success() {
            return Err(AdapterError::Status { status: status.as_u16(), body: text });
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Protocol(format!("response is not JSON: {e}")))?;

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::Protocol("response has no message content".into()))?
            .to_string();

        let tokens_used = parsed
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let confidence =
            parsed.get("confidence").and_then(Value::as_f64).unwrap_or(DEFAULT_CONFIDENCE);

        Ok(AdapterResponse { content, confidence, tokens_used })
    }

    /// Probe the server root (`GET /`) — inference servers answer it even
    /// when no model is loaded yet.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        anyhow::ensure!(
            response.status().is_success(),
            "health check returned HTTP {}",
            response.status()
        );
        Ok(())
    }
}
