use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use foreman_config::BoundaryConfig;
use foreman_core::{
    AccessMode, Embodiment, EventBus, FabricError, FabricEvent, Result, Severity, Tier,
};
use foreman_memory::{
    AuditCategory, AuditLog, AuditRecord, Keyring, SizeAction, SizeCheck, TierStore,
    enforce_size_limits,
};

use crate::guardrail::{GuardrailEngine, GuardrailVerdict};
use crate::operation::{BoundaryContext, MemoryOperation, OperationKind};
use crate::privilege::privilege;
use crate::scanner::{EncryptionCheck, SecretScanner, enforce_encryption};

static TENANT_REFERENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\btenant_[a-z0-9_]+").ok());

/// The four checks, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryCheck {
    EmbodimentPrivilege,
    TenantIsolation,
    GuardrailCompliance,
    SafetyBoundary,
}

impl BoundaryCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryCheck::EmbodimentPrivilege => "embodiment_privilege",
            BoundaryCheck::TenantIsolation => "tenant_isolation",
            BoundaryCheck::GuardrailCompliance => "guardrail_compliance",
            BoundaryCheck::SafetyBoundary => "safety_boundary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub check: BoundaryCheck,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Why an operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Violation {
    /// The operation claims a different embodiment than the caller.
    EmbodimentImpersonation { claimed: Embodiment },
    EmbodimentPrivilege { mode: AccessMode },
    TenantContextMissing,
    TenantIsolation { requested: String },
    CrossTenantData { found: Vec<String> },
    Guardrail { rule: String },
    SecretDetected { count: usize },
    EncryptionPolicy,
}

impl Violation {
    /// Audit event type.
    pub fn event_type(&self) -> String {
        match self {
            Violation::EmbodimentImpersonation { .. } => "embodiment_impersonation".into(),
            Violation::EmbodimentPrivilege { .. } => "embodiment_privilege_violation".into(),
            Violation::TenantContextMissing => "tenant_context_missing".into(),
            Violation::TenantIsolation { .. } => "tenant_isolation_violation_attempt".into(),
            Violation::CrossTenantData { .. } => "cross_tenant_data_detected".into(),
            Violation::Guardrail { rule } => rule.clone(),
            Violation::SecretDetected { .. } => "secret_detected".into(),
            Violation::EncryptionPolicy => "encryption_policy_violation".into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Violation::TenantContextMissing
            | Violation::TenantIsolation { .. }
            | Violation::CrossTenantData { .. }
            | Violation::Guardrail { .. } => Severity::Critical,
            Violation::EmbodimentImpersonation { .. }
            | Violation::EmbodimentPrivilege { .. }
            | Violation::SecretDetected { .. }
            | Violation::EncryptionPolicy => Severity::High,
        }
    }

    pub fn is_tenant_violation(&self) -> bool {
        matches!(
            self,
            Violation::TenantContextMissing
                | Violation::TenantIsolation { .. }
                | Violation::CrossTenantData { .. }
        )
    }

    fn category(&self) -> AuditCategory {
        if self.is_tenant_violation() {
            AuditCategory::SecurityEvent
        } else {
            AuditCategory::BoundaryViolation
        }
    }
}

/// Result of [`BoundaryEnforcer::enforce`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
    pub checks_performed: Vec<CheckOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_check: Option<SizeCheck>,
}

impl BoundaryDecision {
    pub fn performed(&self, check: BoundaryCheck) -> bool {
        self.checks_performed.iter().any(|c| c.check == check)
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks_performed.iter().map(|c| c.check.as_str()).collect()
    }

    pub fn pruning_triggered(&self) -> bool {
        self.size_check
            .as_ref()
            .is_some_and(|s| s.action == Some(SizeAction::PruningTriggered))
    }

    /// `Ok(())` when allowed, else the matching typed error.
    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            return Ok(());
        }
        let reason = self.reason.unwrap_or_default();
        Err(match self.violation {
            Some(Violation::EmbodimentImpersonation { .. })
            | Some(Violation::EmbodimentPrivilege { .. }) => {
                FabricError::EmbodimentPrivilegeViolation(reason)
            }
            Some(Violation::TenantContextMissing)
            | Some(Violation::TenantIsolation { .. })
            | Some(Violation::CrossTenantData { .. }) => FabricError::TenantIsolationViolation(reason),
            Some(Violation::Guardrail { rule }) if rule == "governance_immutability" => {
                FabricError::GovernanceImmutable
            }
            Some(Violation::Guardrail { rule }) => FabricError::GuardrailViolation { rule, reason },
            Some(Violation::SecretDetected { count }) => FabricError::SecretDetected { count },
            Some(Violation::EncryptionPolicy) => FabricError::EncryptionPolicyViolation(reason),
            None => FabricError::Other(anyhow::anyhow!("operation rejected: {reason}")),
        })
    }
}

struct Rejection {
    violation: Violation,
    reason: String,
}

impl Rejection {
    fn new(violation: Violation, reason: impl Into<String>) -> Self {
        Self {
            violation,
            reason: reason.into(),
        }
    }
}

/// The authorization pipeline every fabric operation passes through.
///
/// Checks run in order (privilege, tenant isolation, guardrails, safety) and
/// stop at the first failure. Each decision, allowed or not, is appended to
/// the audit log before `enforce` returns.
#[derive(Clone)]
pub struct BoundaryEnforcer {
    audit: AuditLog,
    keyring: Arc<Keyring>,
    guardrails: Arc<GuardrailEngine>,
    scanner: SecretScanner,
    detect_cross_tenant: bool,
    events: Option<EventBus>,
}

impl BoundaryEnforcer {
    pub fn new(audit: AuditLog, keyring: Arc<Keyring>, config: &BoundaryConfig) -> Self {
        Self {
            audit,
            keyring,
            guardrails: Arc::new(GuardrailEngine::new(&config.protected_paths)),
            scanner: SecretScanner::new(config.entropy_threshold),
            detect_cross_tenant: config.detect_cross_tenant_references,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn scanner(&self) -> &SecretScanner {
        &self.scanner
    }

    pub fn enforce(&self, operation: &MemoryOperation, context: &BoundaryContext) -> Result<BoundaryDecision> {
        self.run(operation, context, None)
    }

    /// As [`enforce`](Self::enforce), also projecting the tier size after a write into `store`.
    pub fn enforce_in(
        &self,
        operation: &MemoryOperation,
        context: &BoundaryContext,
        store: &TierStore,
    ) -> Result<BoundaryDecision> {
        self.run(operation, context, Some(store))
    }

    fn run(
        &self,
        operation: &MemoryOperation,
        context: &BoundaryContext,
        store: Option<&TierStore>,
    ) -> Result<BoundaryDecision> {
        let mut checks = Vec::new();
        let mut size_check = None;

        let outcome: std::result::Result<(), (BoundaryCheck, Rejection)> = (|| {
            use BoundaryCheck::*;
            let detail = self
                .check_privilege(operation, context)
                .map_err(|r| (EmbodimentPrivilege, r))?;
            checks.push(passed(EmbodimentPrivilege, detail));

            let detail = self
                .check_tenant(operation, context)
                .map_err(|r| (TenantIsolation, r))?;
            checks.push(passed(TenantIsolation, detail));

            let detail = self
                .check_guardrails(operation)
                .map_err(|r| (GuardrailCompliance, r))?;
            checks.push(passed(GuardrailCompliance, detail));

            let detail = self
                .check_safety(operation, store, &mut size_check)
                .map_err(|r| (SafetyBoundary, r))?;
            checks.push(passed(SafetyBoundary, detail));
            Ok(())
        })();

        let decision = match outcome {
            Ok(()) => BoundaryDecision {
                allowed: true,
                reason: None,
                severity: None,
                violation: None,
                checks_performed: checks,
                size_check,
            },
            Err((check, rejection)) => {
                checks.push(CheckOutcome {
                    check,
                    passed: false,
                    detail: Some(rejection.reason.clone()),
                });
                BoundaryDecision {
                    allowed: false,
                    reason: Some(rejection.reason),
                    severity: Some(rejection.violation.severity()),
                    violation: Some(rejection.violation),
                    checks_performed: checks,
                    size_check,
                }
            }
        };

        self.record(operation, context, &decision)?;
        Ok(decision)
    }

    // ── Checks ─────────────────────────────────────────────────

    fn check_privilege(
        &self,
        operation: &MemoryOperation,
        context: &BoundaryContext,
    ) -> std::result::Result<Option<String>, Rejection> {
        if operation.embodiment != context.embodiment {
            return Err(Rejection::new(
                Violation::EmbodimentImpersonation {
                    claimed: operation.embodiment,
                },
                format!(
                    "Embodiment privilege violation: operation claims '{}' but caller is '{}'",
                    operation.embodiment, context.embodiment
                ),
            ));
        }
        let Some(mode) = operation.kind.access_mode() else {
            return Ok(Some("not covered by the privilege table".into()));
        };
        let access = privilege(context.embodiment, operation.tier);
        if access.allows(mode) {
            Ok(Some(format!("{} has {access} on {}", context.embodiment, operation.tier)))
        } else {
            Err(Rejection::new(
                Violation::EmbodimentPrivilege { mode },
                format!(
                    "Embodiment privilege violation: '{}' does not have '{mode}' privilege for tier '{}'",
                    context.embodiment, operation.tier
                ),
            ))
        }
    }

    fn check_tenant(
        &self,
        operation: &MemoryOperation,
        context: &BoundaryContext,
    ) -> std::result::Result<Option<String>, Rejection> {
        if !operation.tier.is_tenant_scoped() && operation.tenant_id.is_none() {
            return Ok(Some("not tenant-scoped".into()));
        }
        let (requested, authenticated) = match (operation.tenant_id.as_deref(), context.tenant()) {
            (Some(r), Some(a)) => (r, a),
            _ => {
                return Err(Rejection::new(
                    Violation::TenantContextMissing,
                    format!(
                        "Tenant isolation violation: {} operation needs both a requested and an authenticated tenant",
                        operation.tier
                    ),
                ));
            }
        };
        if requested != authenticated {
            return Err(Rejection::new(
                Violation::TenantIsolation {
                    requested: requested.to_string(),
                },
                "Tenant isolation violation: authenticated tenant mismatch",
            ));
        }

        if self.detect_cross_tenant {
            if let Some(content) = &operation.content {
                let found = foreign_tenants(content, requested);
                if !found.is_empty() {
                    return Err(Rejection::new(
                        Violation::CrossTenantData { found: found.clone() },
                        format!(
                            "Tenant isolation violation: content references other tenants ({})",
                            found.join(", ")
                        ),
                    ));
                }
            }
        }
        Ok(Some(format!("tenant {requested} verified")))
    }

    fn check_guardrails(
        &self,
        operation: &MemoryOperation,
    ) -> std::result::Result<Option<String>, Rejection> {
        match self.guardrails.evaluate(operation) {
            GuardrailVerdict::Approve => Ok(None),
            GuardrailVerdict::Deny { rule, reason } => Err(Rejection::new(
                Violation::Guardrail { rule },
                format!("Guardrail violation: {reason}"),
            )),
        }
    }

    fn check_safety(
        &self,
        operation: &MemoryOperation,
        store: Option<&TierStore>,
        size_check: &mut Option<SizeCheck>,
    ) -> std::result::Result<Option<String>, Rejection> {
        if let Some(content) = &operation.content {
            let scan = self.scanner.scan(content);
            if !scan.clean {
                for m in &scan.matches {
                    debug!(kind = m.kind.as_str(), pointer = %m.pointer, preview = %m.preview, "secret match");
                }
                return Err(Rejection::new(
                    Violation::SecretDetected {
                        count: scan.secrets_detected,
                    },
                    format!(
                        "{} secret(s) detected in content; write blocked",
                        scan.secrets_detected
                    ),
                ));
            }
        }

        let writes = matches!(operation.kind, OperationKind::Write | OperationKind::Update);
        if writes && operation.tier.is_tenant_scoped() {
            let encryption = match &operation.metadata {
                Some(metadata) => enforce_encryption(
                    operation.tier,
                    metadata,
                    operation.tenant_id.as_deref(),
                    &self.keyring,
                ),
                None => EncryptionCheck {
                    valid: false,
                    reason: Some("LTM data must be encrypted at rest".into()),
                },
            };
            if !encryption.valid {
                return Err(Rejection::new(
                    Violation::EncryptionPolicy,
                    encryption
                        .reason
                        .unwrap_or_else(|| "LTM data must be encrypted at rest".into()),
                ));
            }
        }

        if operation.kind == OperationKind::Write {
            if let Some(store) = store {
                let scope = if operation.tier.is_tenant_scoped() {
                    operation.tenant_id.as_deref()
                } else {
                    None
                };
                // A storage error here only skips the projection.
                if let Ok(count) = store.count_active(operation.tier, scope) {
                    let check = enforce_size_limits(operation.tier, count + 1, store.limits());
                    if check.action.is_some() {
                        debug!(tier = %operation.tier, count = check.count, "write will trigger pruning");
                    }
                    *size_check = Some(check);
                }
            }
        }
        Ok(None)
    }

    // ── Audit ──────────────────────────────────────────────────

    fn record(
        &self,
        operation: &MemoryOperation,
        context: &BoundaryContext,
        decision: &BoundaryDecision,
    ) -> Result<()> {
        let summary = json!({
            "operation": operation.kind.as_str(),
            "tier": operation.tier,
            "embodiment": operation.embodiment,
            "requestedTenant": operation.tenant_id,
            "authenticatedTenant": context.authenticated_tenant_id,
            "target": operation.target,
            "checks": decision.checks_performed,
            "sizeCheck": decision.size_check,
        });

        let record = match &decision.violation {
            None => {
                let mut record = AuditRecord::new(
                    AuditCategory::MemoryOperation,
                    format!("{}_allowed", operation.kind.as_str()),
                    Severity::Low,
                    format!("{} {} allowed", operation.kind.as_str(), operation.tier),
                );
                if decision.pruning_triggered() {
                    record = record.metadata(json!({ "action": "pruning_triggered", "detail": summary }));
                } else {
                    record = record.metadata(summary);
                }
                record
            }
            Some(violation) => {
                let reason = decision.reason.clone().unwrap_or_default();
                warn!(
                    embodiment = %context.embodiment,
                    tier = %operation.tier,
                    violation = %violation.event_type(),
                    severity = %violation.severity(),
                    "boundary violation: {reason}"
                );
                if let Some(events) = &self.events {
                    events.publish(FabricEvent::BoundaryViolation {
                        embodiment: context.embodiment,
                        tier: operation.tier,
                        reason: reason.clone(),
                        severity: violation.severity(),
                    });
                }
                AuditRecord::new(
                    violation.category(),
                    violation.event_type(),
                    violation.severity(),
                    reason,
                )
                .metadata(merge(summary, json!({ "violation": violation })))
            }
        };

        let record = record
            .source(context.embodiment)
            .tenant(operation.tenant_id.as_deref().or(context.tenant()));
        let record = match &operation.entry_id {
            Some(id) => record.entry(id),
            None => record,
        };
        self.audit.append(record)?;
        Ok(())
    }
}

fn passed(check: BoundaryCheck, detail: Option<String>) -> CheckOutcome {
    CheckOutcome {
        check,
        passed: true,
        detail,
    }
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Value::Object(base_map), Value::Object(extra_map)) = (&mut base, extra) {
        base_map.extend(extra_map);
    }
    base
}

/// Tenant ids other than `own` mentioned in string values of `content`.
fn foreign_tenants(content: &Value, own: &str) -> Vec<String> {
    let Some(pattern) = TENANT_REFERENCE.as_ref() else {
        return Vec::new();
    };
    let mut found = Vec::new();
    let mut stack = vec![content];
    while let Some(value) = stack.pop() {
        match value {
            Value::String(s) => {
                for m in pattern.find_iter(s) {
                    let id = m.as_str();
                    if !id.eq_ignore_ascii_case(own) && !found.iter().any(|f: &String| f == id) {
                        found.push(id.to_string());
                    }
                }
            }
            Value::Array(items) => stack.extend(items.iter()),
            Value::Object(map) => stack.extend(map.values()),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }
    found.sort();
    found
}
