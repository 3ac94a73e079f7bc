//! Deterministic rule/regex engine adapter.
//!
//! Runs entirely in-process — no HTTP, no per-token cost. Rules are
//! evaluated in order and the first hit wins with full confidence; a prompt
//! matching no rule still yields a classification, but at a confidence low
//! enough that a cascade configured with a threshold will escalate to an
//! LLM tier.

use regex::Regex;

use super::{AdapterError, AdapterResponse};

/// Confidence of a rule hit. Rules are deterministic.
const RULE_HIT_CONFIDENCE: f64 = 1.0;

/// Confidence of the catch-all classification.
const FALLBACK_CONFIDENCE: f64 = 0.3;

struct Rule {
    pattern: Regex,
    label: &'static str,
    response: &'static str,
}

/// In-process classifier over a fixed, ordered rule table.
pub struct RuleEngineAdapter {
    rules: Vec<Rule>,
}

impl Default for RuleEngineAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngineAdapter {
    pub fn new() -> Self {
        let table: &[(&str, &str, &str)] = &[
            (
                r"(?i)\b(hello|hi|hey)\b",
                "GREETING",
                "Greeting detected. Classification: GREETING",
            ),
            (
                r"(?i)\b(threat|attack|malicious|exploit|breach)\b",
                "SECURITY_ALERT",
                "Security concern detected. Classification: SECURITY_ALERT",
            ),
            (
                r"(?i)\b(error|exception|failed|traceback|panic)\b",
                "ERROR_LOG",
                "Error detected. Classification: ERROR_LOG",
            ),
        ];
        let rules = table
            .iter()
            .map(|(pattern, label, response)| Rule {
                pattern: Regex::new(pattern).expect("built-in rule pattern must compile"),
                label,
                response,
            })
            .collect();
        Self { rules }
    }

    /// Classify a prompt. Infallible — a rule engine has no transport to
    /// fail on — but typed like the HTTP adapters so the dispatcher treats
    /// every backend uniformly.
    pub fn execute(&self, prompt: &str) -> Result<AdapterResponse, AdapterError> {
        let word_count = prompt.split_whitespace().count() as u32;

        for rule in &self.rules {
            if rule.pattern.is_match(prompt) {
                tracing::debug!(label = rule.label, "rule hit");
                return Ok(AdapterResponse {
                    content: rule.response.to_string(),
                    confidence: RULE_HIT_CONFIDENCE,
                    tokens_used: word_count,
                });
            }
        }

        Ok(AdapterResponse {
            content: "General query. Classification: UNKNOWN".to_string(),
            confidence: FALLBACK_CONFIDENCE,
            tokens_used: word_count,
        })
    }
}
