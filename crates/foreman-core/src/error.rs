use thiserror::Error;

use crate::types::{Severity, Tier};

/// Unified error type for the entire Memory Fabric.
#[derive(Error, Debug)]
pub enum FabricError {
    // ── Boundary violations ────────────────────────────────────
    #[error("tenant isolation violation: {0}")]
    TenantIsolationViolation(String),

    #[error("embodiment privilege violation: {0}")]
    EmbodimentPrivilegeViolation(String),

    #[error("guardrail violation: {rule}: {reason}")]
    GuardrailViolation { rule: String, reason: String },

    #[error("secret detected: {count} match(es) in content, write rejected")]
    SecretDetected { count: usize },

    #[error("encryption policy violation: {0}")]
    EncryptionPolicyViolation(String),

    // ── Concurrency & sync ─────────────────────────────────────
    #[error("version conflict on {tier} entry {id}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        tier: Tier,
        id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("sync delivery to {target} failed: {reason}")]
    SyncDeliveryFailure { target: String, reason: String },

    #[error("conflict cannot be resolved automatically: {0}")]
    ConflictUnresolvable(String),

    // ── Authority review ───────────────────────────────────────
    #[error("ARC approval required: {0}")]
    ArcApprovalRequired(String),

    #[error("ARC approval invalid: {0}")]
    ArcApprovalInvalid(String),

    #[error("Governance Memory is immutable")]
    GovernanceImmutable,

    // ── Entries ────────────────────────────────────────────────
    #[error("{tier} entry not found: {id}")]
    NotFound { tier: Tier, id: String },

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("unknown embodiment: {0}")]
    UnknownEmbodiment(String),

    #[error("unknown tier: {0}")]
    UnknownTier(String),

    // ── Infrastructure ─────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FabricError {
    pub fn severity(&self) -> Severity {
        match self {
            FabricError::TenantIsolationViolation(_)
            | FabricError::GuardrailViolation { .. }
            | FabricError::GovernanceImmutable => Severity::Critical,
            FabricError::EmbodimentPrivilegeViolation(_)
            | FabricError::SecretDetected { .. }
            | FabricError::EncryptionPolicyViolation(_)
            | FabricError::ArcApprovalInvalid(_) => Severity::High,
            FabricError::VersionConflict { .. } => Severity::Low,
            _ => Severity::Medium,
        }
    }

    /// Only version conflicts and delivery failures heal on retry or reconcile.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FabricError::VersionConflict { .. } | FabricError::SyncDeliveryFailure { .. }
        )
    }

    /// Stable snake_case code, used as the audit event type for rejections.
    pub fn code(&self) -> &'static str {
        match self {
            FabricError::TenantIsolationViolation(_) => "tenant_isolation_violation",
            FabricError::EmbodimentPrivilegeViolation(_) => "embodiment_privilege_violation",
            FabricError::GuardrailViolation { .. } => "guardrail_violation",
            FabricError::SecretDetected { .. } => "secret_detected",
            FabricError::EncryptionPolicyViolation(_) => "encryption_policy_violation",
            FabricError::VersionConflict { .. } => "version_conflict",
            FabricError::SyncDeliveryFailure { .. } => "sync_delivery_failure",
            FabricError::ConflictUnresolvable(_) => "conflict_unresolvable",
            FabricError::ArcApprovalRequired(_) => "arc_approval_required",
            FabricError::ArcApprovalInvalid(_) => "arc_approval_invalid",
            FabricError::GovernanceImmutable => "governance_immutable",
            FabricError::NotFound { .. } => "not_found",
            FabricError::InvalidEntry(_) => "invalid_entry",
            FabricError::UnknownEmbodiment(_) => "unknown_embodiment",
            FabricError::UnknownTier(_) => "unknown_tier",
            FabricError::Storage(_) => "storage",
            FabricError::Crypto(_) => "crypto",
            FabricError::Config(_) | FabricError::ConfigValidation { .. } => "config",
            FabricError::Io(_) => "io",
            FabricError::Serialization(_) => "serialization",
            FabricError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
