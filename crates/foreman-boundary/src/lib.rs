//! # foreman-boundary
//!
//! The authorization side of the Memory Fabric: the static embodiment
//! privilege table, secret and encryption checks, guardrails protecting
//! constitutional artifacts, the [`BoundaryEnforcer`] pipeline that composes
//! them, and ARC approval tokens for operations that need a human.

pub mod arc;
pub mod enforcer;
pub mod guardrail;
pub mod operation;
pub mod privilege;
pub mod scanner;

pub use arc::{
    ArcAction, ArcApproval, ArcDecision, ArcReview, ArcReviewQueue, ArcToken, ArcVerifier,
    HmacArcVerifier,
};
pub use enforcer::{BoundaryCheck, BoundaryDecision, BoundaryEnforcer, CheckOutcome, Violation};
pub use guardrail::{CONSTITUTIONAL_PATHS, Guardrail, GuardrailEngine, GuardrailVerdict};
pub use operation::{BoundaryContext, MemoryOperation, OperationKind};
pub use privilege::{Access, has_privilege, matrix, privilege, readers, writers};
pub use scanner::{
    EncryptionCheck, ScanResult, SecretKind, SecretMatch, SecretScanner, enforce_encryption,
    scan_for_secrets, shannon_entropy,
};
