//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::Priority;

/// StratD - strategy run scheduler
#[derive(Parser)]
#[command(
    name = "sd",
    about = "Schedule strategy runs over item universes and watch their progress",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Daemon,

    /// Submit a run
    Submit {
        /// Strategy code
        strategy: String,

        /// Items to evaluate (e.g. tickers)
        #[arg(required = true, num_args = 1..)]
        items: Vec<String>,

        /// Run priority (high, normal, low)
        #[arg(short, long)]
        priority: Option<Priority>,

        /// Strategy parameter as key=value; value is parsed as JSON when possible
        #[arg(short = 'P', long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Stream progress until the run finishes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show a run's status
    Status {
        run_id: String,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Cancel a queued or running run
    Cancel { run_id: String },

    /// Show running and queued runs
    Queue {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stream a run's progress events
    Watch {
        run_id: String,

        /// Print heartbeat events too
        #[arg(long)]
        heartbeats: bool,
    },

    /// Show a run's item results
    Results {
        run_id: String,

        /// Only passing items
        #[arg(long, conflicts_with = "failed")]
        passed: bool,

        /// Only failing items
        #[arg(long)]
        failed: bool,

        /// Only items with this classification
        #[arg(long)]
        classification: Option<String>,

        /// Minimum score
        #[arg(long)]
        min_score: Option<f64>,

        /// Only items whose evaluation errored
        #[arg(long)]
        errors: bool,

        /// Maximum number of results
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List recent runs
    Runs {
        /// Number of runs to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Only runs of this strategy
        #[arg(short, long)]
        strategy: Option<String>,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List registered strategies
    Strategies,

    /// Show scheduler counters
    Stats,

    /// Check the daemon is alive
    Ping,

    /// Ask the daemon to stop
    Shutdown,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stratd")
        .join("logs")
        .join("stratd.log")
}

/// Split `key=value`, parsing the value as JSON and falling back to a string
pub fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Parameter '{}' is not KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Parameter '{}' has an empty key", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Output format for query commands
#[derive(Clone, Debug, Default)]
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
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
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
