//! OpenAI-compatible chat completions adapter.
//!
//! Covers every cloud backend that speaks the `/v1/chat/completions`
//! protocol — the large/medium/small LLM tiers in a typical registry. The
//! prompt is wrapped in a single user message; generation parameters from
//! the validated payload's `params` object are forwarded as-is.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{AdapterError, AdapterResponse};

/// Confidence reported when the backend response carries no `confidence`
/// field of its own (the common case for chat completions).
const DEFAULT_CONFIDENCE: f64 = 0.9;

/// Adapter for any OpenAI-compatible backend.
///
/// Constructed once per dispatch attempt; [`Client`] wraps an `Arc`
/// internally so construction is cheap.
pub struct OpenAiAdapter {
    client: Client,
    base_url: String,
    model: Option<String>,
}

impl OpenAiAdapter {
    /// Build an adapter for the given base URL and optional bearer token.
    pub fn new(
        base_url: String,
        timeout_ms: u64,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            // Panics on invalid header bytes — surfaces misconfiguration at startup, not at request time.
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("API key contains invalid Authorization header characters"),
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self { client, base_url, model }
    }

    /// Execute a prompt via `POST /v1/chat/completions`.
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
        if let Some(params) = payload.get("params").and_then(Value::as_object) {
            for (key, value) in params {
                body[key.as_str()] = value.clone();
            }
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

    /// Probe the backend with `GET /v1/models`.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        let url = format!("{}/v1/models", self.base_url);
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
