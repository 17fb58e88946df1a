//! Command-line front end for the key-value ring.
//!
//! Provides:
//! - `ringkv node`: run one node server
//! - `ringkv orchestrator`: manage a ring from an idle pool, driven by
//!   commands read from stdin

pub mod commands;
pub mod config;

pub use commands::{Command, CommandResult};
pub use config::CliConfig;
