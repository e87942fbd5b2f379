//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::output::OutputFormat;

/// nodelink CLI.
#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(version)]
#[command(about = "Run and inspect nodelink nodes")]
#[command(
    long_about = "nodelink connects nodes over pluggable transports and routes requests between them.\n\nRun 'nodelink init' to get started."
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "NODELINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format (human or json).
    #[arg(short, long, global = true, default_value = "human")]
    pub format: OutputFormatArg,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Output format argument for clap.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormatArg {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => OutputFormat::Human,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

/// CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    // =========================================================================
    // Identity Commands
    // =========================================================================
    /// Initialize the node.
    ///
    /// Creates the data directory, the settings store and the persistent
    /// node id, and writes a default configuration file.
    Init,

    /// Show identity information.
    ///
    /// Displays the node id, display name and configured contact points.
    Whoami,

    // =========================================================================
    // Node Commands
    // =========================================================================
    /// Start the node in the foreground.
    ///
    /// Serves the configured contact point, connects to static contacts
    /// and runs health checks until Ctrl+C.
    Start,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Connect to a contact point and measure health-check round trips.
    Ping {
        /// Contact point, e.g. broker:10.0.0.5:21000.
        contact: String,

        /// Number of health checks to send.
        #[arg(short = 'n', long, default_value = "3")]
        count: u32,
    },

    /// List the nodes reachable through a contact point.
    Peers {
        /// Contact point, e.g. broker:10.0.0.5:21000.
        contact: String,

        /// Only show workflow hosts.
        #[arg(short, long)]
        workflow_hosts: bool,
    },

    /// Show every route discovered through a contact point.
    Routes {
        /// Contact point, e.g. broker:10.0.0.5:21000.
        contact: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        let cli = Cli::try_parse_from(["nodelink", "ping", "broker:10.0.0.5:21000", "-n", "5"]).unwrap();
        match cli.command {
            Commands::Ping { contact, count } => {
                assert_eq!(contact, "broker:10.0.0.5:21000");
                assert_eq!(count, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["nodelink", "peers", "virtual:b:1", "--format", "json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormatArg::Json));
        assert!(matches!(cli.command, Commands::Peers { workflow_hosts: false, .. }));
    }

    #[test]
    fn test_missing_contact_rejected() {
        assert!(Cli::try_parse_from(["nodelink", "routes"]).is_err());
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(Cli::try_parse_from(["nodelink", "whoami", "--format", "xml"]).is_err());
    }
}
