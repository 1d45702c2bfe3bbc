//! Command-line interface and logging setup

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Pairlink daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "pairlink-daemon")]
#[command(about = "Secure device pairing and messaging daemon", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: <config dir>/pairlink/daemon.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Force debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon until Ctrl-C (default)
    Run,

    /// List trusted and declined devices
    Devices,

    /// Forget a device
    Unpair {
        /// Device ID
        device_id: String,
    },

    /// Print the fingerprint of this device's certificate
    Fingerprint,
}

/// Initialize logging
///
/// `RUST_LOG` wins over the configured level; `--verbose` wins over both.
pub fn init_logging(configured_level: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new(Level::DEBUG.as_str())
    } else {
        let level = configured_level.parse::<Level>().with_context(|| {
            format!(
                "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
                configured_level
            )
        })?;
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level.as_str()))
            .context("Failed to create log filter")?
    };

    fmt().with_env_filter(filter).with_target(true).init();

    debug!("Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_run() {
        let cli = Cli::parse_from(["pairlink-daemon"]);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::parse_from([
            "pairlink-daemon",
            "--verbose",
            "--config",
            "/tmp/daemon.toml",
            "unpair",
            "2000",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/daemon.toml")));
        assert_eq!(
            cli.command,
            Some(Command::Unpair {
                device_id: "2000".to_string()
            })
        );

        let cli = Cli::parse_from(["pairlink-daemon", "fingerprint"]);
        assert_eq!(cli.command, Some(Command::Fingerprint));
    }
}
