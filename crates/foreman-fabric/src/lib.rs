//! # foreman-fabric
//!
//! The Entry API of the Memory Fabric. A [`MemoryFabric`] hosts one
//! [`TierStore`](foreman_memory::TierStore) per configured embodiment
//! instance and routes every call through the boundary enforcer before it
//! touches storage. Writes commit locally and return; propagation to the
//! other instances runs in the background through the sync engine.
//!
//! ```no_run
//! # async fn demo() -> foreman_core::Result<()> {
//! use foreman_boundary::BoundaryContext;
//! use foreman_config::FabricConfig;
//! use foreman_core::{Embodiment, MemoryContent, Tier};
//! use foreman_fabric::{MemoryFabric, StoreRequest};
//!
//! let fabric = MemoryFabric::new(FabricConfig::default())?;
//! let ctx = BoundaryContext::new(Embodiment::Foreman);
//! let content = MemoryContent::new("note", serde_json::json!({ "text": "wave 3 complete" }));
//! fabric
//!     .store(&ctx, StoreRequest::new(Tier::Em, "build", "foreman", content))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod fabric;
pub mod recall;
pub mod request;

pub use builder::{FabricBuilder, resolve_db_path};
pub use fabric::{HostedInstance, MemoryFabric};
pub use recall::RecallCursor;
pub use request::{StoreRequest, UpdateRequest};
