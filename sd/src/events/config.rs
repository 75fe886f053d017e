//! Progress broadcaster configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broadcaster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Events retained per run for replay
    #[serde(rename = "history-capacity")]
    pub history_capacity: usize,

    /// Buffered events per subscriber before it is dropped as a slow consumer
    #[serde(rename = "subscriber-capacity")]
    pub subscriber_capacity: usize,

    /// Idle time before a subscriber receives a synthetic heartbeat
    #[serde(rename = "heartbeat-secs")]
    pub heartbeat_secs: u64,

    /// Age after which an unwatched run's history is swept
    #[serde(rename = "history-max-age-secs")]
    pub history_max_age_secs: u64,

    /// How often the sweep runs
    #[serde(rename = "sweep-interval-secs")]
    pub sweep_interval_secs: u64,

    /// Keep history of finished runs for late subscribers until swept
    #[serde(rename = "retain-history-after-completion")]
    pub retain_history_after_completion: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            subscriber_capacity: 256,
            heartbeat_secs: 30,
            history_max_age_secs: 3600,
            sweep_interval_secs: 300,
            retain_history_after_completion: true,
        }
    }
}

impl BroadcastConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn history_max_age(&self) -> Duration {
        Duration::from_secs(self.history_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
