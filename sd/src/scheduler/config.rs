//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::Priority;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max runs executing at once
    #[serde(rename = "max-concurrent", default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Max runs waiting in the queue; further submissions are rejected
    #[serde(rename = "max-queue-size", default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Priority for submissions that do not name one
    #[serde(rename = "default-priority", default)]
    pub default_priority: Priority,

    /// Run duration assumed for start estimates before any run has finished
    #[serde(rename = "default-run-estimate-secs", default = "default_run_estimate_secs")]
    pub default_run_estimate_secs: u64,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_queue_size() -> usize {
    100
}

fn default_run_estimate_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            default_priority: Priority::Normal,
            default_run_estimate_secs: default_run_estimate_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Get the default run estimate as a Duration
    pub fn default_run_estimate(&self) -> Duration {
        Duration::from_secs(self.default_run_estimate_secs)
    }

    /// Concurrency cap, never zero
    pub fn slots(&self) -> usize {
        self.max_concurrent.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.default_priority, Priority::Normal);
        assert_eq!(config.default_run_estimate(), Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_overrides() {
        let config: SchedulerConfig =
            serde_yaml::from_str("max-concurrent: 1\nmax-queue-size: 5\ndefault-priority: high\n").unwrap();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_queue_size, 5);
        assert_eq!(config.default_priority, Priority::High);
        assert_eq!(config.default_run_estimate_secs, 60);
    }

    #[test]
    fn test_zero_concurrency_still_has_a_slot() {
        let config = SchedulerConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert_eq!(config.slots(), 1);
    }
}
