//! CLI argument parsing for optrap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "optrap")]
#[command(version)]
#[command(about = "Operation-table interception engine self-check tool", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output (to stderr)
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the built-in interception scenarios over a synthetic operations table
    Selftest {
        /// Engine configuration file (TOML)
        #[arg(short = 'c', long = "config", value_name = "FILE")]
        config: Option<PathBuf>,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate an engine configuration file and print the effective settings
    CheckConfig {
        /// Engine configuration file (TOML)
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_selftest_defaults() {
        let cli = Cli::parse_from(["optrap", "selftest"]);
        assert!(!cli.debug);
        match cli.command {
            Command::Selftest { config, format } => {
                assert!(config.is_none());
                assert_eq!(format, OutputFormat::Text);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_selftest_with_config_and_json() {
        let cli = Cli::parse_from([
            "optrap",
            "selftest",
            "--config",
            "engine.toml",
            "--format",
            "json",
        ]);
        match cli.command {
            Command::Selftest { config, format } => {
                assert_eq!(config, Some(PathBuf::from("engine.toml")));
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_debug_is_global() {
        let cli = Cli::parse_from(["optrap", "check-config", "engine.toml", "--debug"]);
        assert!(cli.debug);
        assert!(matches!(cli.command, Command::CheckConfig { .. }));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["optrap"]).is_err());
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["optrap", "selftest", "--format", "csv"]).is_err());
    }
}
