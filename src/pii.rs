//! PII detection, redaction, tokenization, and the PII-aware route guard.
//!
//! Detection runs a fixed, ordered set of compiled patterns — one per
//! [`PiiType`] — followed by post-match validators (Luhn for cards, octet
//! range for IPs, zero-group rejection for SSNs). Overlapping candidates are
//! resolved deterministically: longer span, then higher confidence, then
//! first in text.
//!
//! The injection detector is a companion scanner over the same text: a
//! [`RegexSet`] corpus that yields a boolean, not spans. The corpus extends
//! from configuration, so growing it never touches callers.

use std::collections::HashMap;

use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::contract::{ProcessingHint, Sensitivity};
use crate::registry::RegistrySnapshot;

/// Types of PII the scanner recognizes.
///
/// `name` and `address` are part of the wire vocabulary but have no regex
/// pattern — recognizing them reliably needs ML-grade detection, which is an
/// adapter concern, not a gateway one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Email,
    Phone,
    Ssn,
    CreditCard,
    IpAddress,
    Passport,
    Iban,
    Name,
    Address,
}

impl PiiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Ssn => "ssn",
            Self::CreditCard => "credit_card",
            Self::IpAddress => "ip_address",
            Self::Passport => "passport",
            Self::Iban => "iban",
            Self::Name => "name",
            Self::Address => "address",
        }
    }

    /// SSNs, card numbers, and passports demand the strictest routing.
    pub fn is_high_sensitivity(&self) -> bool {
        matches!(self, Self::Ssn | Self::CreditCard | Self::Passport)
    }

    /// Pattern confidence — how often a raw regex hit for this type is a
    /// true positive after validation.
    fn confidence(&self) -> f64 {
        match self {
            Self::Email => 0.95,
            Self::Phone => 0.85,
            Self::Ssn => 0.90,
            Self::CreditCard => 0.95,
            Self::IpAddress => 0.80,
            Self::Passport => 0.60,
            Self::Iban => 0.70,
            Self::Name | Self::Address => 0.50,
        }
    }
}

impl std::fmt::Display for PiiType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected PII occurrence: type, matched value, byte span, confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiiMatch {
    #[serde(rename = "type")]
    pub pii_type: PiiType,
    pub value: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

/// Result of one scan: every surviving match plus the deduplicated type set.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub has_pii: bool,
    pub matches: Vec<PiiMatch>,
    pub pii_types: Vec<PiiType>,
}

impl Detection {
    fn from_matches(matches: Vec<PiiMatch>) -> Self {
        let mut pii_types: Vec<PiiType> = matches.iter().map(|m| m.pii_type).collect();
        pii_types.sort();
        pii_types.dedup();
        Self { has_pii: !matches.is_empty(), matches, pii_types }
    }

    pub fn has_high_sensitivity_types(&self) -> bool {
        self.pii_types.iter().any(PiiType::is_high_sensitivity)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.pii_types.iter().map(|t| t.as_str().to_string()).collect()
    }
}

/// How detected values are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionStrategy {
    /// `[REDACTED:TYPE]`
    #[default]
    Redact,
    /// `****`
    Mask,
    /// `[TYPE:<first 8 hex of SHA-256(value)>]`
    Hash,
    /// Fresh unguessable token per distinct value, reversible per scan.
    Tokenize,
}

/// Per-scan bidirectional token map. Never leaves the redactor's caller.
#[derive(Debug, Default)]
pub struct TokenMap {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
}

impl TokenMap {
    fn token_for(&mut self, value: &str) -> String {
        if let Some(token) = self.forward.get(value) {
            return token.clone();
        }
        let token = fresh_token();
        self.forward.insert(value.to_string(), token.clone());
        self.reverse.insert(token.clone(), value.to_string());
        token
    }

    /// Reverse tokenization. A true inverse of `tokenize` redaction: tokens
    /// are drawn from a 64-bit random hex namespace, so a redacted substring
    /// colliding with a token is statistically impossible.
    pub fn detokenize(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (token, original) in &self.reverse {
            result = result.replace(token, original);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

fn fresh_token() -> String {
    use rand::RngCore as _;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("TOKEN_{}", hex::encode(bytes))
}

/// Result of a redaction pass.
pub struct Redaction {
    pub text: String,
    pub detection: Detection,
    /// Present only for the `tokenize` strategy.
    pub token_map: Option<TokenMap>,
}

/// Compiled PII scanner. Build once, share freely — detection is pure.
pub struct PiiScanner {
    patterns: Vec<(PiiType, Regex)>,
}

impl Default for PiiScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiScanner {
    pub fn new() -> Self {
        // Iteration order is fixed so identical text always yields the same
        // match set. All patterns match case-insensitively.
        let table: &[(PiiType, &str)] = &[
            (PiiType::Email, r"(?i)\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            (PiiType::Phone, r"(?i)\b(?:\+?1[-.]?)?\(?\d{3}\)?[-.]?\d{3}[-.]?\d{4}\b"),
            (PiiType::Ssn, r"(?i)\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b"),
            (PiiType::CreditCard, r"(?i)\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b"),
            (PiiType::IpAddress, r"(?i)\b(?:\d{1,3}\.){3}\d{1,3}\b"),
            (PiiType::Passport, r"(?i)\b[A-Z]{1,2}\d{6,9}\b"),
            (PiiType::Iban, r"(?i)\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b"),
        ];
        let patterns = table
            .iter()
            .map(|(ty, pattern)| {
                (*ty, Regex::new(pattern).expect("built-in PII pattern must compile"))
            })
            .collect();
        Self { patterns }
    }

    /// Detect all PII in `text`. Deterministic: identical text yields an
    /// identical match set.
    pub fn detect(&self, text: &str) -> Detection {
        let mut candidates = Vec::new();

        for (pii_type, pattern) in &self.patterns {
            for found in pattern.find_iter(text) {
                let value = found.as_str();
                let valid = match pii_type {
                    PiiType::CreditCard => validate_credit_card(value),
                    PiiType::IpAddress => validate_ip_address(value),
                    PiiType::Ssn => validate_ssn(value),
                    _ => true,
                };
                if !valid {
                    continue;
                }
                candidates.push(PiiMatch {
                    pii_type: *pii_type,
                    value: value.to_string(),
                    start: found.start(),
                    end: found.end(),
                    confidence: pii_type.confidence(),
                });
            }
        }

        Detection::from_matches(resolve_overlaps(candidates))
    }

    /// Redact detected PII with the given strategy.
    ///
    /// Matches are rewritten in reverse order of `start` so earlier byte
    /// offsets stay valid while the string shrinks or grows.
    pub fn redact(&self, text: &str, strategy: RedactionStrategy) -> Redaction {
        let detection = self.detect(text);
        if !detection.has_pii {
            return Redaction { text: text.to_string(), detection, token_map: None };
        }

        let mut token_map =
            matches!(strategy, RedactionStrategy::Tokenize).then(TokenMap::default);

        let mut ordered: Vec<&PiiMatch> = detection.matches.iter().collect();
        ordered.sort_by(|a, b| b.start.cmp(&a.start));

        let mut result = text.to_string();
        for found in ordered {
            let replacement = match strategy {
                RedactionStrategy::Redact => {
                    format!("[REDACTED:{}]", found.pii_type.as_str().to_uppercase())
                }
                RedactionStrategy::Mask => "****".to_string(),
                RedactionStrategy::Hash => {
                    let digest = Sha256::digest(found.value.as_bytes());
                    format!(
                        "[{}:{}]",
                        found.pii_type.as_str().to_uppercase(),
                        &hex::encode(digest)[..8]
                    )
                }
                RedactionStrategy::Tokenize => {
                    token_map.as_mut().expect("token map exists for tokenize").token_for(&found.value)
                }
            };
            result.replace_range(found.start..found.end, &replacement);
        }

        Redaction { text: result, detection, token_map }
    }
}

/// Resolve overlapping candidates: (1) longer span wins, (2) higher
/// confidence wins, (3) first-in-text wins.
fn resolve_overlaps(mut candidates: Vec<PiiMatch>) -> Vec<PiiMatch> {
    candidates.sort_by(|a, b| {
        let len_a = a.end - a.start;
        let len_b = b.end - b.start;
        len_b
            .cmp(&len_a)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.start.cmp(&b.start))
    });

    let mut accepted: Vec<PiiMatch> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let overlaps = accepted
            .iter()
            .any(|kept| candidate.start < kept.end && kept.start < candidate.end);
        if !overlaps {
            accepted.push(candidate);
        }
    }

    accepted.sort_by_key(|m| m.start);
    accepted
}

fn validate_credit_card(raw: &str) -> bool {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let mut checksum = 0u32;
    for (i, &digit) in digits.iter().rev().enumerate() {
        let mut d = digit;
        if i % 2 == 1 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        checksum += d;
    }
    checksum % 10 == 0
}

fn validate_ip_address(raw: &str) -> bool {
    let parts: Vec<&str> = raw.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<u16>().map(|n| n <= 255).unwrap_or(false))
}

fn validate_ssn(raw: &str) -> bool {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 9 {
        return false;
    }
    let area = &digits[0..3];
    let group = &digits[3..5];
    let serial = &digits[5..9];
    ![area, group, serial].iter().any(|part| part.bytes().all(|b| b == b'0'))
}

// ---------------------------------------------------------------------------
// Injection detection
// ---------------------------------------------------------------------------

/// Built-in prompt-injection corpus: instruction override, role manipulation,
/// prompt extraction, and delimiter smuggling.
const INJECTION_PATTERNS: &[&str] = &[
    // Direct instruction override
    r"(?i)ignore\s+(all\s+)?previous\s+instructions?",
    r"(?i)ignore\s+(all\s+)?prior\s+instructions?",
    r"(?i)disregard\s+(all\s+)?previous",
    r"(?i)forget\s+(all\s+)?(your\s+)?instructions?",
    r"(?i)override\s+(your\s+)?instructions?",
    // New instruction injection
    r"(?i)new\s+instructions?:",
    r"(?i)updated\s+instructions?:",
    r"(?i)system\s+prompt:",
    r"(?i)\[system\]",
    r"(?i)<system>",
    // Role manipulation
    r"(?i)you\s+are\s+now\s+a",
    r"(?i)act\s+as\s+if\s+you",
    r"(?i)pretend\s+(to\s+be|you\s+are)",
    r"(?i)roleplay\s+as",
    // Prompt extraction
    r"(?i)reveal\s+(your\s+)?system\s+prompt",
    r"(?i)show\s+(me\s+)?(your\s+)?instructions",
    r"(?i)what\s+(are|is)\s+(your\s+)?system\s+prompt",
    // Delimiter smuggling
    r"(?i)end\s+of\s+system\s+prompt",
    r"(?i)</?(system|instructions?)>",
    r"(?i)\[/?INST\]",
    r"(?i)<<SYS>>",
];

/// Boolean prompt-injection scanner.
pub struct InjectionDetector {
    patterns: RegexSet,
}

impl Default for InjectionDetector {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl InjectionDetector {
    /// Build the detector from the built-in corpus plus configured extras.
    pub fn new(extra_patterns: &[String]) -> Self {
        let all: Vec<&str> = INJECTION_PATTERNS
            .iter()
            .copied()
            .chain(extra_patterns.iter().map(String::as_str))
            .collect();
        let patterns = RegexSet::new(&all).expect("injection patterns must compile");
        Self { patterns }
    }

    pub fn detect(&self, text: &str) -> bool {
        self.patterns.is_match(text)
    }
}

// ---------------------------------------------------------------------------
// PII-aware route guard
// ---------------------------------------------------------------------------

/// Decides whether a (detection, hint) combination implies an out-of-policy
/// route before the router ever runs.
///
/// `auto`/`hybrid` hints are never blocked here — the router's sensitivity
/// filter owns those. A forced hint is blocked when no hint-compatible
/// backend in the snapshot accepts PII; high-sensitivity PII additionally
/// requires a hint-compatible backend cleared for `confidential` data.
pub struct PiiGuard;

impl PiiGuard {
    pub fn check(
        detection: &Detection,
        hint: ProcessingHint,
        snapshot: &RegistrySnapshot,
    ) -> Option<String> {
        if !detection.has_pii {
            return None;
        }

        let Some(allowed_types) = crate::registry::hint_backend_types(hint) else {
            return None; // auto / hybrid
        };

        let compatible: Vec<_> = snapshot
            .backends()
            .iter()
            .filter(|b| allowed_types.contains(&b.backend_type))
            .collect();

        if !compatible.iter().any(|b| b.pii_allowed) {
            return Some(format!(
                "hint '{hint}' routes to backends not cleared for PII (detected: {})",
                detection.type_names().join(", ")
            ));
        }

        if detection.has_high_sensitivity_types()
            && !compatible
                .iter()
                .any(|b| b.pii_allowed && b.sensitivity_allowed.contains(&Sensitivity::Confidential))
        {
            return Some(format!(
                "hint '{hint}' routes to backends not cleared for high-sensitivity PII (ssn/credit-card/passport)"
            ));
        }

        None
    }
}
