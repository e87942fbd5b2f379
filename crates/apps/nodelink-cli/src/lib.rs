//! Command-line interface for nodelink nodes.
//!
//! This crate provides the `nodelink` binary. It includes commands for:
//!
//! - **Identity**: Initialize the node and display its identity
//! - **Node Management**: Serve contact points and connect to static contacts
//! - **Diagnostics**: Ping a contact point, list reachable nodes and routes
//!
//! # Quick Start
//!
//! ```bash
//! # Initialize the data directory and node id
//! nodelink init
//!
//! # Serve on the configured contact point
//! nodelink start
//!
//! # From another machine
//! nodelink ping broker:10.0.0.5:21000
//! nodelink peers broker:10.0.0.5:21000
//! ```
//!
//! # Output Formats
//!
//! All commands support `--format` for output control:
//!
//! - `human` (default): Human-readable with colors
//! - `json`: Machine-readable JSON
//!
//! # Configuration
//!
//! Configuration is loaded from `config.toml` in the data directory
//! (`NODELINK_DATA_DIR` or the platform data directory). Override with
//! `--config`.

pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod output;
pub mod signals;

// Re-export main types
pub use cli::{Cli, Commands, OutputFormatArg};
pub use config::CliConfig;
pub use context::NodeContext;
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, Render};
