//! Execution worker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-run worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent evaluator calls within one run
    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// How long in-flight items may keep running after a cancel
    #[serde(rename = "grace-period-ms")]
    pub grace_period_ms: u64,

    /// Completed items between OverallProgress events
    #[serde(rename = "progress-interval")]
    pub progress_interval: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            grace_period_ms: 5000,
            progress_interval: 10,
        }
    }
}

impl WorkerConfig {
    /// `min(max_workers, items)`, never zero
    pub fn pool_size(&self, items: usize) -> usize {
        self.max_workers.min(items).max(1)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn progress_interval(&self) -> usize {
        self.progress_interval.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size() {
        let config = WorkerConfig::default();
        assert_eq!(config.pool_size(3), 3);
        assert_eq!(config.pool_size(100), 8);
        assert_eq!(config.pool_size(0), 1);
    }

    #[test]
    fn test_yaml_keys() {
        let config: WorkerConfig = serde_yaml::from_str("max-workers: 2\ngrace-period-ms: 250\n").unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.grace_period(), Duration::from_millis(250));
        assert_eq!(config.progress_interval, 10);
    }
}
