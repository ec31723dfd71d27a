//! # foreman-config
//!
//! Configuration for the Memory Fabric. Reads `fabric.toml`, then applies
//! `FOREMAN_*` environment overrides on top.
//!
//! Supports hot-reload via filesystem watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::FabricConfig;
pub use schema::{
    ArcConfig, BoundaryConfig, ConfigWarning, EncryptionConfig, InstanceConfig, LoggingConfig,
    StorageConfig, SyncConfig, TierConfig, WarningSeverity,
};
