//! Runbook - a YAML task runner built on a concurrent task graph
//!
//! Tasks are declared in `runbook.yml`, routed through an optional context,
//! fused into a dependency graph and executed locally, in containers or on
//! remote hosts. Tasks hand environment to their dependents only through
//! explicit propagation channels.

// Public modules
pub mod cli;
pub mod config;
pub mod error;
pub mod runner;
pub mod ui;
pub mod utils;

// Re-export commonly used types
pub use error::{Result, RunbookError};

/// Current version of runbook
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
