//! Command line interface of the `relayframe` binary.
//!
//! Also compiled by the build script to render the man page, so it only
//! depends on `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command line arguments for the `relayframe` binary.
#[derive(Debug, Parser)]
#[command(
    name = "relayframe",
    version,
    about = "RPC load balancer and proxy multiplexing requests over framed backend connections"
)]
pub struct Cli {
    /// Role to run.
    #[command(subcommand)]
    pub command: Command,

    /// Most verbose log level emitted.
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,
}

/// Process roles.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Balance one service's workers behind a registered frontend.
    Lb {
        /// TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Route requests to every service of a product.
    Proxy {
        /// TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Command {
    /// Configuration file of the selected role.
    #[must_use]
    pub fn config(&self) -> &PathBuf {
        match self {
            Self::Lb { config } | Self::Proxy { config } => config,
        }
    }
}

/// Log levels accepted by `--log-level`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages.
    Info,
    /// Debugging detail.
    Debug,
    /// Everything.
    Trace,
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::rstest;

    use super::{Cli, Command, LogLevel};

    #[rstest]
    #[case(&["relayframe", "lb", "--config", "lb.toml"], true)]
    #[case(&["relayframe", "proxy", "-c", "lb.toml"], false)]
    fn parses_role_and_config(#[case] args: &[&str], #[case] is_lb: bool) {
        let cli = Cli::parse_from(args);
        assert_eq!(matches!(cli.command, Command::Lb { .. }), is_lb);
        assert_eq!(cli.command.config().to_str(), Some("lb.toml"));
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    fn log_level_is_global() {
        let cli = Cli::parse_from(["relayframe", "proxy", "--config", "p.toml", "--log-level", "debug"]);
        assert_eq!(cli.log_level, LogLevel::Debug);
    }

    #[test]
    fn config_is_required() {
        assert!(Cli::try_parse_from(["relayframe", "lb"]).is_err());
    }
}
