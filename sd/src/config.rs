//! StratD configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::events::BroadcastConfig;
use crate::ipc::default_socket_path;
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerConfig;

/// Upper bound for `scheduler.default-run-estimate-secs` (30 days)
const MAX_RUN_ESTIMATE_SECS: u64 = 30 * 24 * 60 * 60;

/// Main StratD configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admission and concurrency limits
    pub scheduler: SchedulerConfig,

    /// Per-run worker pool
    pub worker: WorkerConfig,

    /// Progress history and subscriber limits
    pub broadcast: BroadcastConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// IPC socket configuration
    pub ipc: IpcConfig,

    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Check limits that would leave the daemon unable to run anything
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(eyre::eyre!("scheduler.max-concurrent must be at least 1"));
        }
        if self.worker.max_workers == 0 {
            return Err(eyre::eyre!("worker.max-workers must be at least 1"));
        }
        if self.broadcast.subscriber_capacity == 0 {
            return Err(eyre::eyre!("broadcast.subscriber-capacity must be at least 1"));
        }
        if self.scheduler.default_run_estimate_secs > MAX_RUN_ESTIMATE_SECS {
            return Err(eyre::eyre!(
                "scheduler.default-run-estimate-secs must be at most {}",
                MAX_RUN_ESTIMATE_SECS
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .stratd.yml
        let local_config = PathBuf::from(".stratd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/stratd/stratd.yml
        if let Some(user_config) = user_config_path() {
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => std::iter::once(PathBuf::from(".stratd.yml"))
                .chain(user_config_path())
                .collect(),
        };
        candidates
            .into_iter()
            .find(|path| path.exists())
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|content| serde_yaml::from_str::<Self>(&content).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("stratd").join("stratd.yml"))
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/stratd on Linux)
        let db_path = dirs::data_local_dir()
            .map(|d| d.join("stratd"))
            .unwrap_or_else(|| PathBuf::from(".stratd"))
            .join("stratd.db");
        Self { db_path }
    }
}

/// IPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    #[serde(rename = "socket-path")]
    pub socket_path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}
