//! Secret detection and the LTM encryption-at-rest check.
//!
//! Both checks are stateless. Secret detection runs on every write, for every
//! embodiment, and a single match blocks the write.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use foreman_core::{EntryMetadata, Tier};
use foreman_memory::Keyring;

pub const DEFAULT_ENTROPY_THRESHOLD: f64 = 3.5;

/// Shortest credential-field value considered for the entropy check.
const MIN_ENTROPY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    ApiKey,
    GithubToken,
    AwsAccessKey,
    BearerToken,
    PrivateKey,
    InlinePassword,
    /// `api_key: ...`, `token=...` and the like in free text.
    LabelledCredential,
    PasswordField,
    HighEntropyCredential,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretKind::ApiKey => "api_key",
            SecretKind::GithubToken => "github_token",
            SecretKind::AwsAccessKey => "aws_access_key",
            SecretKind::BearerToken => "bearer_token",
            SecretKind::PrivateKey => "private_key",
            SecretKind::InlinePassword => "inline_password",
            SecretKind::LabelledCredential => "labelled_credential",
            SecretKind::PasswordField => "password_field",
            SecretKind::HighEntropyCredential => "high_entropy_credential",
        }
    }
}

struct Detector {
    kind: SecretKind,
    regex: Regex,
}

static DETECTORS: LazyLock<Vec<Detector>> = LazyLock::new(|| {
    [
        (SecretKind::PrivateKey, r"-----BEGIN (?:[A-Z]+ )?PRIVATE KEY-----"),
        (SecretKind::GithubToken, r"\bgh[pousr]_[A-Za-z0-9]{20,}"),
        (SecretKind::ApiKey, r"\bsk-(?:ant-)?[A-Za-z0-9_-]{16,}"),
        (SecretKind::AwsAccessKey, r"\bAKIA[0-9A-Z]{16}\b"),
        (SecretKind::BearerToken, r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]{20,}=*"),
        (SecretKind::InlinePassword, r"(?i)\b(?:password|passwd|pwd)\s*[:=]\s*\S+"),
        (
            SecretKind::LabelledCredential,
            r"(?i)\b(?:api[\s_-]?key|token|secret)\s*[:=]\s*\S+",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| Detector {
        kind,
        regex: Regex::new(pattern).expect("detector patterns are static"),
    })
    .collect()
});

/// One detected secret. Only a redacted preview is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMatch {
    pub kind: SecretKind,
    /// JSON pointer to the offending string value.
    pub pointer: String,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub clean: bool,
    pub secrets_detected: usize,
    pub matches: Vec<SecretMatch>,
}

impl ScanResult {
    /// Count of matches per detector kind.
    pub fn by_kind(&self) -> HashMap<SecretKind, usize> {
        let mut counts = HashMap::new();
        for m in &self.matches {
            *counts.entry(m.kind).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SecretScanner {
    entropy_threshold: f64,
}

impl Default for SecretScanner {
    fn default() -> Self {
        Self::new(DEFAULT_ENTROPY_THRESHOLD)
    }
}

impl SecretScanner {
    pub fn new(entropy_threshold: f64) -> Self {
        Self { entropy_threshold }
    }

    /// Walk every string in `content`; each string yields at most one match.
    pub fn scan(&self, content: &Value) -> ScanResult {
        let mut matches = Vec::new();
        self.walk(content, "", None, &mut matches);
        ScanResult {
            clean: matches.is_empty(),
            secrets_detected: matches.len(),
            matches,
        }
    }

    fn walk(&self, value: &Value, pointer: &str, field: Option<&str>, out: &mut Vec<SecretMatch>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_pointer = format!("{pointer}/{}", escape_pointer(key));
                    self.walk(child, &child_pointer, Some(key), out);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    self.walk(child, &format!("{pointer}/{i}"), field, out);
                }
            }
            Value::String(s) => {
                if let Some(kind) = self.classify(s, field) {
                    out.push(SecretMatch {
                        kind,
                        pointer: if pointer.is_empty() { "/".into() } else { pointer.into() },
                        preview: redact(kind, s),
                    });
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    fn classify(&self, value: &str, field: Option<&str>) -> Option<SecretKind> {
        if let Some(d) = DETECTORS.iter().find(|d| d.regex.is_match(value)) {
            return Some(d.kind);
        }
        let field = field.map(str::to_ascii_lowercase)?;
        if is_password_field(&field) && !value.trim().is_empty() {
            return Some(SecretKind::PasswordField);
        }
        if is_credential_field(&field)
            && value.len() >= MIN_ENTROPY_LEN
            && !value.contains(char::is_whitespace)
            && shannon_entropy(value) >= self.entropy_threshold
        {
            return Some(SecretKind::HighEntropyCredential);
        }
        None
    }
}

/// Scan with the default entropy threshold.
pub fn scan_for_secrets(content: &Value) -> ScanResult {
    SecretScanner::default().scan(content)
}

fn is_password_field(field: &str) -> bool {
    ["password", "passwd", "passphrase", "pwd"]
        .iter()
        .any(|label| field.contains(label))
}

fn is_credential_field(field: &str) -> bool {
    ["secret", "token", "api_key", "apikey", "access_key", "private_key", "credential", "auth"]
        .iter()
        .any(|label| field.contains(label))
}

/// Shannon entropy in bits per character.
pub fn shannon_entropy(s: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in s.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.log2()
        })
        .sum()
}

fn redact(kind: SecretKind, value: &str) -> String {
    match kind {
        SecretKind::PasswordField
        | SecretKind::InlinePassword
        | SecretKind::LabelledCredential
        | SecretKind::PrivateKey => {
            "[REDACTED]".into()
        }
        _ => {
            let prefix: String = value.chars().take(4).collect();
            format!("{prefix}…[REDACTED]")
        }
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Outcome of the encryption-at-rest check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionCheck {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EncryptionCheck {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// LTM must be flagged encrypted and the tenant must have a key. Other tiers pass.
pub fn enforce_encryption(
    tier: Tier,
    metadata: &EntryMetadata,
    tenant: Option<&str>,
    keyring: &Keyring,
) -> EncryptionCheck {
    if !tier.is_tenant_scoped() {
        return EncryptionCheck::ok();
    }
    if !metadata.encrypted {
        return EncryptionCheck::fail("LTM data must be encrypted at rest");
    }
    match tenant {
        None => EncryptionCheck::fail("LTM data must be encrypted with a tenant key, but no tenant was given"),
        Some(t) if !keyring.has_key(t) => {
            EncryptionCheck::fail(format!("no encryption key configured for tenant {t}"))
        }
        Some(_) => EncryptionCheck::ok(),
    }
}
