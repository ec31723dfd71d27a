//! # foreman-core
//!
//! Shared vocabulary of the Foreman Memory Fabric: tiers, embodiments,
//! memory entries, the unified error type, and the fabric event bus.
//! Every other crate in the workspace builds on these types.

pub mod entry;
pub mod error;
pub mod event;
pub mod types;

pub use entry::{EntryMetadata, IsolationBoundary, MemoryContent, MemoryEntry, now_millis};
pub use error::{FabricError, Result};
pub use event::{EventBus, FabricEvent};
pub use types::*;
