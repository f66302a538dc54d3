//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ec - evaluation coordinator for simulation optimization campaigns
#[derive(Parser)]
#[command(
    name = "ec",
    about = "Evaluation coordinator for multi-stage simulation optimization campaigns",
    version,
    after_help = "Logs are written to: ~/.local/share/evalcoord/logs/evalcoord.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run a local optimization campaign
    Run {
        /// Override the history output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Summary format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Evaluate a grid or random parameter scan
    Scan {
        /// Override the history output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Summary format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Load and validate the configuration, then print the resolved pipeline
    Validate,

    /// Print a saved history file
    History {
        /// CSV or JSON Lines history file
        path: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,

        /// Only show the best N genuinely evaluated rows
        #[arg(short, long)]
        top: Option<usize>,
    },
}

/// Output format for summaries and history listings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Path of the log file written by the binary
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("evalcoord")
        .join("logs")
        .join("evalcoord.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["ec", "run"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                output: None,
                format: OutputFormat::Text
            }
        ));
    }

    #[test]
    fn test_cli_parse_scan_json() {
        let cli = Cli::parse_from(["ec", "scan", "--format", "json", "-o", "results"]);
        if let Command::Scan { output, format } = cli.command {
            assert_eq!(output, Some(PathBuf::from("results")));
            assert_eq!(format, OutputFormat::Json);
        } else {
            panic!("Expected Scan command");
        }
    }

    #[test]
    fn test_cli_parse_history() {
        let cli = Cli::parse_from(["ec", "history", "out/history.csv", "--top", "5"]);
        if let Command::History { path, format, top } = cli.command {
            assert_eq!(path, PathBuf::from("out/history.csv"));
            assert_eq!(format, OutputFormat::Text);
            assert_eq!(top, Some(5));
        } else {
            panic!("Expected History command");
        }
    }

    #[test]
    fn test_cli_with_config_and_level() {
        let cli = Cli::parse_from(["ec", "-c", "/path/to/campaign.yml", "--log-level", "debug", "validate"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/campaign.yml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Command::Validate));
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_history_requires_path() {
        assert!(Cli::try_parse_from(["ec", "history"]).is_err());
    }
}
