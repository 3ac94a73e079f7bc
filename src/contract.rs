//! Wire contract between client applications and the gateway.
//!
//! The request [`Envelope`] is the unit of admission: everything the
//! pipeline needs (declared sensitivity, processing hints, auth material)
//! rides in it. Unknown *envelope* fields are preserved into the metadata bag
//! so older gateways tolerate newer clients; unknown *payload* fields are
//! rejected because the payload is the part that reaches a backend.
//!
//! Canonical encoding: `serde_json` without `preserve_order` backs
//! `Value::Object` with a `BTreeMap`, so serializing any decoded value yields
//! sorted keys and minimal separators. Payload signatures and the
//! encode/decode round-trip both rely on this.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorCode, GatewayError};
use crate::registry::Capability;

/// Wire protocol version accepted by this build.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Declared data-classification of a request.
///
/// Single source of truth — the policy engine, registry, and router all
/// import this declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Internal,
    Sensitive,
    Pii,
    Confidential,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Sensitive => "sensitive",
            Self::Pii => "pii",
            Self::Confidential => "confidential",
        }
    }
}

impl std::fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-supplied preference narrowing which backend types are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProcessingHint {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "model:small")]
    ModelSmall,
    #[serde(rename = "model:large")]
    ModelLarge,
    #[serde(rename = "model:private")]
    ModelPrivate,
    #[serde(rename = "rule:engine")]
    RuleEngine,
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl ProcessingHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ModelSmall => "model:small",
            Self::ModelLarge => "model:large",
            Self::ModelPrivate => "model:private",
            Self::RuleEngine => "rule:engine",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for ProcessingHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the response travels back to the caller.
///
/// The core path implements `sync`; the async routes are dispatcher
/// extensions and are rejected at orchestration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnRoute {
    #[default]
    Sync,
    AsyncWebhook,
    AsyncQueue,
}

/// Request kind carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    #[serde(rename = "process_request")]
    Process,
    #[serde(rename = "query_request")]
    Query,
    #[serde(rename = "health_check")]
    Health,
    #[serde(rename = "batch_request")]
    Batch,
}

impl RequestKind {
    /// Policy action string for this kind.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Query => "query",
            Self::Health => "health",
            Self::Batch => "batch",
        }
    }
}

/// Who sent the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub application_id: String,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Per-request processing knobs. Absent fields take the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "defaults::sensitivity")]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub processing_hint: ProcessingHint,
    #[serde(default)]
    pub return_route: ReturnRoute,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "defaults::enabled")]
    pub enable_pii_detection: bool,
    #[serde(default = "defaults::enabled")]
    pub enable_injection_detection: bool,
    #[serde(default)]
    pub max_retries: u32,
    /// Explicit capability override; when absent the router infers one from
    /// the payload-schema name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            sensitivity: defaults::sensitivity(),
            processing_hint: ProcessingHint::Auto,
            return_route: ReturnRoute::Sync,
            timeout_ms: defaults::timeout_ms(),
            enable_pii_detection: true,
            enable_injection_detection: true,
            max_retries: 0,
            capability: None,
        }
    }
}

/// Authentication material: bearer token plus optional payload signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthBlock {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// The request envelope.
///
/// Unknown top-level fields land in `metadata` via the serde flatten; an
/// explicit `"metadata"` object from the client appears there under its own
/// key. Both survive re-encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub mpc_version: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: SourceInfo,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub payload_schema: String,
    pub payload: Value,
    #[serde(default)]
    pub config: ProcessingConfig,
    pub auth: AuthBlock,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Envelope {
    /// The prompt string the detectors and token estimator run over.
    pub fn prompt_text(&self) -> &str {
        self.payload.get("prompt").and_then(Value::as_str).unwrap_or("")
    }
}

/// Decode and structurally validate a request envelope.
///
/// Payload-schema validation is separate ([`SchemaRegistry::validate_payload`])
/// because it needs the registry; this function only checks the envelope
/// frame itself.
pub fn decode(bytes: &[u8]) -> Result<Envelope, GatewayError> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|e| GatewayError::schema(format!("invalid request envelope: {e}")))?;

    if envelope.mpc_version != PROTOCOL_VERSION {
        return Err(GatewayError::schema(format!(
            "unsupported mpc_version `{}` (expected `{PROTOCOL_VERSION}`)",
            envelope.mpc_version
        )));
    }
    if envelope.request_id.is_empty() {
        return Err(GatewayError::schema("request_id must not be empty"));
    }
    if envelope.config.timeout_ms == 0 {
        return Err(GatewayError::schema("config.timeout_ms must be positive"));
    }

    Ok(envelope)
}

/// Re-encode an envelope to canonical bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, GatewayError> {
    serde_json::to_vec(envelope).map_err(|e| GatewayError::internal(format!("envelope encode: {e}")))
}

/// Canonical byte encoding of a payload object — the exact bytes a payload
/// signature covers. Headers may change without invalidating the signature.
pub fn canonical_payload(payload: &Value) -> Vec<u8> {
    serde_json::to_vec(payload).expect("serde_json::Value serialization cannot fail")
}

// ---------------------------------------------------------------------------
// Payload schemas
// ---------------------------------------------------------------------------

/// Expected JSON type of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One field of a named payload schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn field(name: &'static str, kind: FieldKind, required: bool) -> FieldSpec {
    FieldSpec { name, kind, required }
}

/// Registry of named payload schemas.
///
/// Schemas are shape descriptors: field name → expected type + requiredness.
/// Unknown payload fields fail validation; this is the strict half of the
/// contract (the envelope itself is the lenient half).
pub struct SchemaRegistry {
    schemas: std::collections::HashMap<&'static str, Vec<FieldSpec>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemaRegistry {
    /// The schemas this gateway ships with.
    pub fn builtin() -> Self {
        let mut schemas = std::collections::HashMap::new();
        schemas.insert(
            "llm.request.v1",
            vec![
                field("model", FieldKind::String, false),
                field("prompt", FieldKind::String, true),
                field("params", FieldKind::Object, false),
                field("max_tokens", FieldKind::Integer, false),
                field("temperature", FieldKind::Number, false),
            ],
        );
        schemas.insert(
            "llm.response.v1",
            vec![
                field("response", FieldKind::String, true),
                field("tokens", FieldKind::Integer, false),
                field("cost", FieldKind::Number, false),
                field("backend", FieldKind::String, false),
                field("confidence", FieldKind::Number, false),
            ],
        );
        schemas.insert(
            "security.scan.v1",
            vec![
                field("prompt", FieldKind::String, true),
                field("context", FieldKind::Object, false),
            ],
        );
        schemas.insert(
            "text.extract.v1",
            vec![
                field("prompt", FieldKind::String, true),
                field("fields", FieldKind::Array, false),
            ],
        );
        schemas.insert(
            "text.classify.v1",
            vec![
                field("prompt", FieldKind::String, true),
                field("labels", FieldKind::Array, false),
            ],
        );
        Self { schemas }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Validate a payload against a named schema.
    ///
    /// Rejects unknown schema names, non-object payloads, unknown fields,
    /// missing required fields, and type mismatches — in that order, first
    /// failure wins.
    pub fn validate_payload(&self, schema_name: &str, payload: &Value) -> Result<(), GatewayError> {
        let fields = self.schemas.get(schema_name).ok_or_else(|| {
            GatewayError::schema(format!("unknown payload schema `{schema_name}`"))
        })?;

        let object = payload.as_object().ok_or_else(|| {
            GatewayError::schema(format!("payload for `{schema_name}` must be a JSON object"))
        })?;

        for key in object.keys() {
            if !fields.iter().any(|f| f.name == key) {
                return Err(GatewayError::schema(format!(
                    "unknown field `{key}` in payload for `{schema_name}`"
                )));
            }
        }

        for spec in fields {
            match object.get(spec.name) {
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(GatewayError::schema(format!(
                            "field `{}` in `{schema_name}` must be a {}",
                            spec.name,
                            spec.kind.name()
                        )));
                    }
                }
                None if spec.required => {
                    return Err(GatewayError::schema(format!(
                        "missing required field `{}` in payload for `{schema_name}`",
                        spec.name
                    )));
                }
                None => {}
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
    Queued,
    Processing,
}

/// Wire error block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

/// How the accepted attempt was processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub backend: String,
    pub latency_ms: f64,
    pub cost_usd: f64,
    pub confidence: f64,
    pub fallback_used: bool,
}

/// Security findings attached to every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityFlags {
    #[serde(default)]
    pub has_pii: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pii_types: Vec<String>,
    #[serde(default)]
    pub injection_detected: bool,
}

/// The response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub mpc_version: String,
    pub request_id: String,
    pub response_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingInfo>,
    #[serde(default)]
    pub security_flags: SecurityFlags,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn ok(
        request_id: &str,
        result: Value,
        processing: ProcessingInfo,
        security_flags: SecurityFlags,
    ) -> Self {
        Self {
            mpc_version: PROTOCOL_VERSION.to_string(),
            request_id: request_id.to_string(),
            response_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
            processing: Some(processing),
            security_flags,
            metadata: Map::new(),
        }
    }

    pub fn failure(request_id: &str, error: &GatewayError, security_flags: SecurityFlags) -> Self {
        Self {
            mpc_version: PROTOCOL_VERSION.to_string(),
            request_id: request_id.to_string(),
            response_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(ErrorInfo { code: error.code, message: error.message.clone() }),
            processing: None,
            security_flags,
            metadata: Map::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("response envelope serialization cannot fail")
    }
}

mod defaults {
    use super::Sensitivity;

    pub fn sensitivity() -> Sensitivity {
        Sensitivity::Internal
    }
    pub fn timeout_ms() -> u64 {
        30_000
    }
    pub fn enabled() -> bool {
        true
    }
}
