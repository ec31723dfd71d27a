//! # foreman-cli
//!
//! Operator command-line interface for the Memory Fabric.
//!
//! ## Commands
//!
//! - `foreman config` — Show the effective configuration (keys redacted)
//! - `foreman doctor` — Audit configuration for problems
//! - `foreman privileges` — Print the embodiment privilege matrix
//! - `foreman audit` — Browse the governance audit log, or verify its chain
//! - `foreman status` — Show hosted instances, entry counts and sync health
//! - `foreman scan` — Check a JSON payload for secrets before storing it

pub mod commands;

pub use commands::Cli;
