//! Token minting/verification and payload signatures.
//!
//! Two independent secrets drive this module: the token-mint key and the
//! payload-signing key. Both are opaque byte strings (≥ 32 bytes) injected
//! from the environment and held in a [`Keyring`] of current + previous so
//! verification keeps succeeding across a rotation.
//!
//! Tokens are compact two-part strings: `base64url(claims).hex(hmac)`. The
//! HMAC-SHA-256 tag covers the base64 claims segment; claims are canonical
//! JSON so a minted token is reproducible for a given claim set and key.
//! All tag comparisons are constant-time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted secret length. Anything shorter is a configuration error.
pub const MIN_KEY_BYTES: usize = 32;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Tolerated clock skew, applied to `exp` only. `iat` is informational.
pub const CLOCK_SKEW_SECS: i64 = 60;

/// Caller roles. Single declaration — policy and audit import from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Service,
    Admin,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Service => "service",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained permissions carried in a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Execute,
    Admin,
    PiiAccess,
    SensitiveAccess,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::Admin => "admin",
            Self::PiiAccess => "pii_access",
            Self::SensitiveAccess => "sensitive_access",
        }
    }
}

/// The authenticated identity derived from a verified token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub client_id: String,
    pub role: Role,
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Principal {
    /// `admin` implies every other permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission) || self.permissions.contains(&Permission::Admin)
    }
}

/// Current + previous secret for one concern.
///
/// Rotation swaps the whole keyring atomically (same discipline as registry
/// snapshots); verification tries every entry, minting always uses current.
#[derive(Debug, Clone)]
pub struct Keyring {
    current: Vec<u8>,
    previous: Option<Vec<u8>>,
}

impl Keyring {
    pub fn new(current: Vec<u8>, previous: Option<Vec<u8>>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            current.len() >= MIN_KEY_BYTES,
            "secret too short: {} bytes (minimum {MIN_KEY_BYTES})",
            current.len()
        );
        if let Some(prev) = &previous {
            anyhow::ensure!(
                prev.len() >= MIN_KEY_BYTES,
                "previous secret too short: {} bytes (minimum {MIN_KEY_BYTES})",
                prev.len()
            );
        }
        Ok(Self { current, previous })
    }

    fn keys(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.current.as_slice()).chain(self.previous.as_deref())
    }
}

/// Why token verification failed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    client_id: String,
    role: Role,
    permissions: Vec<Permission>,
    iat: i64,
    exp: i64,
    jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    application_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
}

/// Mints and verifies bearer tokens under the token-mint keyring.
pub struct TokenManager {
    keyring: Keyring,
    ttl: Duration,
}

impl TokenManager {
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring, ttl: Duration::seconds(DEFAULT_TOKEN_TTL_SECS) }
    }

    pub fn with_ttl(keyring: Keyring, ttl: Duration) -> Self {
        Self { keyring, ttl }
    }

    /// Mint a token for the given principal attributes.
    pub fn mint(
        &self,
        client_id: &str,
        role: Role,
        permissions: &[Permission],
        application_id: Option<&str>,
    ) -> String {
        let now = Utc::now();
        let claims = Claims {
            client_id: client_id.to_string(),
            role,
            permissions: permissions.to_vec(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: random_token_id(),
            application_id: application_id.map(str::to_string),
            metadata: Map::new(),
        };

        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).expect("claims serialization cannot fail"));
        let tag = hmac_hex(&self.keyring.current, payload.as_bytes());
        format!("{payload}.{tag}")
    }

    /// Verify a token and recover the [`Principal`].
    ///
    /// Rejects: bad signature under every keyring entry, expired (beyond the
    /// 60 s skew), malformed encoding, missing required claims.
    pub fn verify(&self, token: &str) -> Result<Principal, VerifyError> {
        let (payload, tag_hex) = token
            .split_once('.')
            .ok_or_else(|| VerifyError::Invalid("not a two-part token".into()))?;

        let provided =
            hex::decode(tag_hex).map_err(|_| VerifyError::Invalid("malformed signature".into()))?;

        let signed = self.keyring.keys().any(|key| {
            let computed = hmac_raw(key, payload.as_bytes());
            computed.ct_eq(&provided).into()
        });
        if !signed {
            return Err(VerifyError::Invalid("signature mismatch".into()));
        }

        let claim_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| VerifyError::Invalid("malformed claims encoding".into()))?;
        let claims: Claims = serde_json::from_slice(&claim_bytes)
            .map_err(|e| VerifyError::Invalid(format!("bad claims: {e}")))?;

        if Utc::now().timestamp() > claims.exp + CLOCK_SKEW_SECS {
            return Err(VerifyError::Expired);
        }

        Ok(Principal {
            client_id: claims.client_id,
            role: claims.role,
            permissions: claims.permissions,
            application_id: claims.application_id,
            metadata: claims.metadata,
        })
    }
}

/// Signs and verifies payload bytes under the payload-signing keyring.
///
/// The signature covers the canonical payload encoding
/// ([`crate::contract::canonical_payload`]) — not the full envelope — so
/// headers can change without invalidating it.
pub struct PayloadSigner {
    keyring: Keyring,
}

impl PayloadSigner {
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring }
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        hmac_hex(&self.keyring.current, payload)
    }

    /// Constant-time verification against every keyring entry.
    pub fn verify(&self, payload: &[u8], signature_hex: &str) -> bool {
        let Ok(provided) = hex::decode(signature_hex) else {
            return false;
        };
        self.keyring.keys().any(|key| {
            let computed = hmac_raw(key, payload);
            computed.ct_eq(&provided).into()
        })
    }
}

fn hmac_raw(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_hex(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_raw(key, data))
}

fn random_token_id() -> String {
    use rand::RngCore as _;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
