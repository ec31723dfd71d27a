//! # foreman-memory
//!
//! Durable storage for the Memory Fabric:
//!
//! - **Tier store**: SQLite-backed entries partitioned by tier, written with
//!   compare-and-set on the version field. LTM bodies are sealed per tenant
//!   and every replaced LTM version is kept in an immutable history table.
//! - **Size limits**: STM/WM evict the oldest entries, LTM archives the oldest
//!   unread entries per tenant.
//! - **Audit log**: an append-only, hash-chained ledger of every boundary
//!   decision, sync event and ARC decision, plus the LTM access log.

pub mod audit;
pub mod keyring;
pub mod limits;
pub mod store;

pub use audit::{
    AccessLogRecord, AccessResult, AccessType, AuditCategory, AuditEvent, AuditFilter, AuditLog,
    AuditRecord, ChainReport,
};
pub use keyring::Keyring;
pub use limits::{SizeAction, SizeCheck, TierLimits, enforce_size_limits};
pub use store::{EntryCursor, EntryRef, PrunePolicy, PutOutcome, QueryFilter, TierStore};
