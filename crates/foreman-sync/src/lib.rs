//! # foreman-sync
//!
//! Keeps embodiment instances consistent. After an entry commits on one
//! instance the [`SyncEngine`] fans it out, concurrently and with a per-target
//! timeout, to every instance allowed to read it, subject to the tier's
//! propagation rule:
//!
//! - **STM** stays local.
//! - **WM** reaches the origin's working set, within one tenant.
//! - **EM / SM / Governance** reach every embodiment that can read them.
//! - **LTM** reaches only isms_runtime instances serving the entry's tenant;
//!   anything else is blocked and logged as a security event.
//!
//! Diverging copies are settled by the [`ConflictResolver`].

pub mod conflict;
pub mod engine;
pub mod peer;

pub use conflict::{
    ConflictRecord, ConflictResolver, ConflictType, Resolution, VersionSnapshot, detect_conflict,
    resolve_last_write_wins,
};
pub use engine::{
    HealthStatus, ReconcileReport, ReconcileStatus, SyncEngine, SyncHealth, SyncReport, SyncStatus,
    SyncTarget,
};
pub use peer::{EmbodimentPeer, LocalPeer};
