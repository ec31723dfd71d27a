use foreman_core::Tier;
use tracing::info;

use crate::operation::{MemoryOperation, OperationKind};

/// Paths that no embodiment may write, whatever its privileges.
pub const CONSTITUTIONAL_PATHS: &[&str] = &[
    "BUILD_PHILOSOPHY.md",
    "foreman/constitution/",
    "foreman/governance/",
    ".github/foreman/agent-contract.md",
    ".github/agents/",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardrailVerdict {
    Approve,
    Deny { rule: String, reason: String },
}

impl GuardrailVerdict {
    fn deny(rule: &str, reason: impl Into<String>) -> Self {
        GuardrailVerdict::Deny {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// A hard-coded protection rule.
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, operation: &MemoryOperation) -> GuardrailVerdict;
}

/// Applies every registered rule; the first denial wins.
pub struct GuardrailEngine {
    rules: Vec<Box<dyn Guardrail>>,
}

impl Default for GuardrailEngine {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl GuardrailEngine {
    /// Built-in rules, with `extra_paths` protected on top of [`CONSTITUTIONAL_PATHS`].
    pub fn new(extra_paths: &[String]) -> Self {
        let mut protected: Vec<String> = CONSTITUTIONAL_PATHS.iter().map(|p| p.to_string()).collect();
        protected.extend(extra_paths.iter().map(|p| normalize(p)));

        let mut engine = Self { rules: Vec::new() };
        engine.add_rule(Box::new(BoundaryModificationGuardrail));
        engine.add_rule(Box::new(ConstitutionalPathGuardrail { protected }));
        engine.add_rule(Box::new(GovernanceImmutabilityGuardrail));
        engine.add_rule(Box::new(ProgrammaticDeletionGuardrail));
        engine
    }

    pub fn add_rule(&mut self, rule: Box<dyn Guardrail>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn evaluate(&self, operation: &MemoryOperation) -> GuardrailVerdict {
        for rule in &self.rules {
            match rule.evaluate(operation) {
                GuardrailVerdict::Approve => continue,
                verdict @ GuardrailVerdict::Deny { .. } => {
                    info!(
                        rule = rule.name(),
                        tier = %operation.tier,
                        kind = operation.kind.as_str(),
                        "guardrail denied operation"
                    );
                    return verdict;
                }
            }
        }
        GuardrailVerdict::Approve
    }
}

fn normalize(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let mut rest = path.as_str();
    loop {
        if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
        } else {
            break;
        }
    }
    rest.to_string()
}

// ── Built-in guardrails ────────────────────────────────────────

/// No operation may alter the privilege table or the isolation rules.
struct BoundaryModificationGuardrail;

impl Guardrail for BoundaryModificationGuardrail {
    fn name(&self) -> &str {
        "boundary_modification"
    }

    fn evaluate(&self, operation: &MemoryOperation) -> GuardrailVerdict {
        if operation.kind == OperationKind::ModifyBoundary {
            GuardrailVerdict::deny(
                self.name(),
                "boundary rules cannot be modified through the fabric",
            )
        } else {
            GuardrailVerdict::Approve
        }
    }
}

/// Root governance documents and agent contracts are never written.
struct ConstitutionalPathGuardrail {
    protected: Vec<String>,
}

impl Guardrail for ConstitutionalPathGuardrail {
    fn name(&self) -> &str {
        "constitutional_file_modification"
    }

    fn evaluate(&self, operation: &MemoryOperation) -> GuardrailVerdict {
        if !operation.kind.is_mutation() {
            return GuardrailVerdict::Approve;
        }
        let Some(target) = operation.target.as_deref() else {
            return GuardrailVerdict::Approve;
        };
        let target = normalize(target);
        let hit = self.protected.iter().find(|p| {
            if p.ends_with('/') {
                target.starts_with(p.as_str()) || format!("{target}/") == **p
            } else {
                target == **p
            }
        });
        match hit {
            Some(p) => GuardrailVerdict::deny(
                self.name(),
                format!("'{target}' is a constitutional path (protected: {p})"),
            ),
            None => GuardrailVerdict::Approve,
        }
    }
}

/// Governance Memory only ever grows.
struct GovernanceImmutabilityGuardrail;

impl Guardrail for GovernanceImmutabilityGuardrail {
    fn name(&self) -> &str {
        "governance_immutability"
    }

    fn evaluate(&self, operation: &MemoryOperation) -> GuardrailVerdict {
        match (operation.tier, operation.kind) {
            (Tier::Governance, OperationKind::Update | OperationKind::Delete) => {
                GuardrailVerdict::deny(self.name(), "Governance Memory is immutable")
            }
            _ => GuardrailVerdict::Approve,
        }
    }
}

/// Explicit deletion exists only as approval-gated LTM erasure.
struct ProgrammaticDeletionGuardrail;

impl Guardrail for ProgrammaticDeletionGuardrail {
    fn name(&self) -> &str {
        "programmatic_deletion"
    }

    fn evaluate(&self, operation: &MemoryOperation) -> GuardrailVerdict {
        if operation.kind == OperationKind::Delete && operation.tier != Tier::Ltm {
            GuardrailVerdict::deny(
                self.name(),
                format!("{} entries are not deleted explicitly", operation.tier),
            )
        } else {
            GuardrailVerdict::Approve
        }
    }
}
