use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use foreman_core::Embodiment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

/// Root configuration — maps to `fabric.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub tiers: TierConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub boundary: BoundaryConfig,
    pub encryption: EncryptionConfig,
    pub arc: ArcConfig,
    pub logging: LoggingConfig,
    /// Embodiment instances hosted by this process.
    pub instances: Vec<InstanceConfig>,
}

// ── Tiers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// STM entries kept per embodiment instance before eviction.
    pub stm_max_entries: usize,
    /// WM entries kept per embodiment instance before eviction.
    pub wm_max_entries: usize,
    /// Active LTM entries per tenant before the oldest unread are archived.
    pub ltm_archive_threshold: usize,
    /// Lifetime of an STM entry; swept by `expire_short_term`.
    pub stm_ttl_secs: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            stm_max_entries: 1_000,
            wm_max_entries: 10_000,
            ltm_archive_threshold: 100_000,
            stm_ttl_secs: 86_400,
        }
    }
}

// ── Storage ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file, or `:memory:`. Each hosted instance gets its own
    /// file derived from this path.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("fabric.db"),
        }
    }
}

impl StorageConfig {
    pub fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == ":memory:"
    }
}

// ── Sync ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Per-target delivery timeout.
    pub delivery_timeout_ms: u64,
    /// WM collaborating sets: embodiment name → collaborators.
    pub working_sets: BTreeMap<String, Vec<Embodiment>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        use Embodiment::*;
        let mut working_sets = BTreeMap::new();
        working_sets.insert(Foreman.as_str().into(), vec![ForemanApp, LocalBuilder]);
        working_sets.insert(ForemanApp.as_str().into(), vec![Foreman, LocalBuilder]);
        working_sets.insert(LocalBuilder.as_str().into(), vec![Foreman, ForemanApp]);
        working_sets.insert(IsmsRuntime.as_str().into(), vec![CommandMaturion]);
        working_sets.insert(CommandMaturion.as_str().into(), vec![IsmsRuntime]);
        Self {
            delivery_timeout_ms: 2_000,
            working_sets,
        }
    }
}

impl SyncConfig {
    /// Collaborators of `embodiment`. Membership is symmetric: listing B under
    /// A also places A in B's set. The embodiment itself is never included.
    pub fn working_set(&self, embodiment: Embodiment) -> BTreeSet<Embodiment> {
        let mut set = BTreeSet::new();
        for (key, members) in &self.working_sets {
            let Ok(owner) = key.parse::<Embodiment>() else {
                continue;
            };
            if owner == embodiment {
                set.extend(members.iter().copied());
            } else if members.contains(&embodiment) {
                set.insert(owner);
            }
        }
        set.remove(&embodiment);
        set
    }
}

// ── Boundary ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Extra constitutional paths, on top of the built-in list.
    /// A trailing `/` protects everything under that directory.
    pub protected_paths: Vec<String>,
    /// Reject tenant-scoped content that mentions another tenant's id.
    pub detect_cross_tenant_references: bool,
    /// Shannon entropy (bits/char) above which a credential-named field is a secret.
    pub entropy_threshold: f64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            protected_paths: Vec::new(),
            detect_cross_tenant_references: true,
            entropy_threshold: 3.5,
        }
    }
}

// ── Encryption ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Tenant → base64-encoded 32-byte AES-256 key.
    pub tenant_keys: BTreeMap<String, String>,
}

// ── ARC ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArcConfig {
    /// Base64 HMAC key for signing ARC approval tokens. When unset a random
    /// key is generated at startup and tokens do not survive a restart.
    pub signing_key: Option<String>,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
    /// Log file path (None = stderr only).
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
            file: None,
        }
    }
}

// ── Instances ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub embodiment: Embodiment,
    /// Tenant served by this instance; required for isms_runtime to hold LTM.
    #[serde(default)]
    pub tenant: Option<String>,
    /// Instance id; defaults to `<embodiment>` or `<embodiment>@<tenant>`.
    #[serde(default)]
    pub id: Option<String>,
}

impl InstanceConfig {
    pub fn new(embodiment: Embodiment) -> Self {
        Self {
            embodiment,
            tenant: None,
            id: None,
        }
    }

    pub fn for_tenant(embodiment: Embodiment, tenant: impl Into<String>) -> Self {
        Self {
            embodiment,
            tenant: Some(tenant.into()),
            id: None,
        }
    }

    pub fn instance_id(&self) -> String {
        match (&self.id, &self.tenant) {
            (Some(id), _) => id.clone(),
            (None, Some(tenant)) => format!("{}@{}", self.embodiment, tenant),
            (None, None) => self.embodiment.to_string(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A config validation warning or error.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

fn push(
    warnings: &mut Vec<ConfigWarning>,
    field: impl Into<String>,
    message: impl Into<String>,
    severity: WarningSeverity,
    hint: Option<&str>,
) {
    warnings.push(ConfigWarning {
        field: field.into(),
        message: message.into(),
        severity,
        hint: hint.map(str::to_string),
    });
}

impl FabricConfig {
    /// Instances to host; one shared instance per embodiment when none are configured.
    pub fn effective_instances(&self) -> Vec<InstanceConfig> {
        if self.instances.is_empty() {
            Embodiment::ALL.into_iter().map(InstanceConfig::new).collect()
        } else {
            self.instances.clone()
        }
    }

    /// Copy safe to print: key material replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for value in copy.encryption.tenant_keys.values_mut() {
            *value = "[redacted]".into();
        }
        if copy.arc.signing_key.is_some() {
            copy.arc.signing_key = Some("[redacted]".into());
        }
        copy
    }

    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        use WarningSeverity::*;
        let mut warnings = Vec::new();

        // ── Tier limits ───
        if self.tiers.stm_max_entries == 0 {
            push(&mut warnings, "tiers.stm_max_entries", "STM limit is 0, every entry would be evicted", Error, Some("Default is 1000"));
        }
        if self.tiers.wm_max_entries == 0 {
            push(&mut warnings, "tiers.wm_max_entries", "WM limit is 0, every entry would be evicted", Error, Some("Default is 10000"));
        }
        if self.tiers.ltm_archive_threshold == 0 {
            push(&mut warnings, "tiers.ltm_archive_threshold", "LTM archive threshold is 0", Error, Some("Default is 100000 per tenant"));
        }
        if self.tiers.stm_ttl_secs == 0 {
            push(&mut warnings, "tiers.stm_ttl_secs", "STM TTL is 0, entries expire immediately", Warning, Some("Default is 86400 (24h)"));
        }

        // ── Storage ───
        if self.storage.db_path.as_os_str().is_empty() {
            push(&mut warnings, "storage.db_path", "database path is empty", Error, Some("Set to e.g. 'fabric.db' or ':memory:'"));
        }

        // ── Sync ───
        if self.sync.delivery_timeout_ms == 0 {
            push(&mut warnings, "sync.delivery_timeout_ms", "delivery timeout is 0, every delivery would fail", Error, Some("Default is 2000"));
        } else if self.sync.delivery_timeout_ms > 60_000 {
            push(
                &mut warnings,
                "sync.delivery_timeout_ms",
                format!("delivery timeout {}ms is very long", self.sync.delivery_timeout_ms),
                Warning,
                Some("A slow embodiment holds its sync task open this long"),
            );
        }
        for (key, members) in &self.sync.working_sets {
            match key.parse::<Embodiment>() {
                Err(_) => push(
                    &mut warnings,
                    format!("sync.working_sets.{key}"),
                    format!("unknown embodiment '{key}'"),
                    Error,
                    Some("Keys must be embodiment names such as 'foreman' or 'isms_runtime'"),
                ),
                Ok(owner) if members.contains(&owner) => push(
                    &mut warnings,
                    format!("sync.working_sets.{key}"),
                    "working set lists its own embodiment",
                    Info,
                    None,
                ),
                Ok(_) => {}
            }
        }

        // ── Boundary ───
        let t = self.boundary.entropy_threshold;
        if !(t > 0.0 && t <= 8.0) {
            push(&mut warnings, "boundary.entropy_threshold", format!("entropy threshold {t} is out of range"), Error, Some("Shannon entropy per character lies in (0, 8]; default is 3.5"));
        }
        for path in &self.boundary.protected_paths {
            if path.trim().is_empty() {
                push(&mut warnings, "boundary.protected_paths", "empty protected path", Warning, None);
            }
        }

        // ── Encryption keys ───
        for (tenant, key) in &self.encryption.tenant_keys {
            match BASE64.decode(key.trim()) {
                Ok(bytes) if bytes.len() == 32 => {}
                Ok(bytes) => push(
                    &mut warnings,
                    format!("encryption.tenant_keys.{tenant}"),
                    format!("key is {} bytes, AES-256 needs 32", bytes.len()),
                    Error,
                    None,
                ),
                Err(_) => push(
                    &mut warnings,
                    format!("encryption.tenant_keys.{tenant}"),
                    "key is not valid base64",
                    Error,
                    None,
                ),
            }
        }

        // ── ARC ───
        match &self.arc.signing_key {
            None => push(&mut warnings, "arc.signing_key", "no signing key, a random one is generated per process", Warning, Some("ARC approvals issued before a restart will not verify")),
            Some(key) => match BASE64.decode(key.trim()) {
                Ok(bytes) if bytes.len() >= 32 => {}
                Ok(_) => push(&mut warnings, "arc.signing_key", "signing key shorter than 32 bytes", Warning, None),
                Err(_) => push(&mut warnings, "arc.signing_key", "signing key is not valid base64", Error, None),
            },
        }

        // ── Instances ───
        let mut seen = HashSet::new();
        for inst in &self.instances {
            let id = inst.instance_id();
            if !seen.insert(id.clone()) {
                push(&mut warnings, "instances", format!("duplicate instance id '{id}'"), Error, None);
            }
            if inst.embodiment == Embodiment::IsmsRuntime && inst.tenant.is_none() {
                push(&mut warnings, "instances", format!("'{id}' serves no tenant and cannot hold LTM"), Info, None);
            }
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            let hint = format!("Valid values: {}", valid_formats.join(", "));
            push(
                &mut warnings,
                "logging.format",
                format!("unknown log format '{}'", self.logging.format),
                Warning,
                Some(hint.as_str()),
            );
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            let hint = format!("Valid values: {}", valid_levels.join(", "));
            push(
                &mut warnings,
                "logging.level",
                format!("unknown log level '{}'", self.logging.level),
                Warning,
                Some(hint.as_str()),
            );
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
