//! Queue types for the scheduler

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Parameters, Priority};

/// A run waiting for a slot
///
/// Ordered so that `BinaryHeap::pop` yields the next run to start: higher
/// priority first, then earlier enqueue.
#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub run_id: String,
    pub priority: Priority,
    /// Strictly increasing per scheduler; breaks priority ties FIFO
    pub enqueue_seq: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedRun {
    pub fn new(run_id: impl Into<String>, priority: Priority, enqueue_seq: u64) -> Self {
        Self {
            run_id: run_id.into(),
            priority,
            enqueue_seq,
            enqueued_at: Utc::now(),
        }
    }
}

impl Eq for QueuedRun {}

impl PartialEq for QueuedRun {
    fn eq(&self, other: &Self) -> bool {
        self.run_id == other.run_id
    }
}

impl Ord for QueuedRun {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Priority::High is the smallest value, so reverse both keys for the max-heap
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}

impl PartialOrd for QueuedRun {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Submission request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub strategy_code: String,
    pub items: Vec<String>,
    #[serde(default)]
    pub parameters: Parameters,
    /// Falls back to the configured default priority
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl RunRequest {
    pub fn new(strategy_code: impl Into<String>, items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            strategy_code: strategy_code.into(),
            items: items.into_iter().map(Into::into).collect(),
            parameters: Parameters::new(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Trim items, reject blanks and drop duplicates (first occurrence wins)
pub fn normalize_items(items: Vec<String>) -> Result<Vec<String>, String> {
    let mut seen = std::collections::HashSet::new();
    let mut normalized = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let item = item.trim();
        if item.is_empty() {
            return Err(format!("item {} is blank", index));
        }
        if seen.insert(item.to_string()) {
            normalized.push(item.to_string());
        }
    }
    if normalized.is_empty() {
        return Err("no items submitted".to_string());
    }
    Ok(normalized)
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_submitted: u64,
    pub total_rejected: u64,
    pub total_started: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    /// Wall time of runs that finished after starting
    pub total_run_time_ms: u64,
    /// Runs that finished after starting
    pub total_finished: u64,
    pub peak_queue_depth: usize,
    pub peak_concurrent: usize,
}

impl SchedulerStats {
    /// Mean wall time of finished runs, if any
    pub fn average_run_duration(&self) -> Option<Duration> {
        if self.total_finished == 0 {
            return None;
        }
        Some(Duration::from_millis(self.total_run_time_ms / self.total_finished))
    }
}

/// Status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Running,
    Queued,
}

impl std::fmt::Display for QueueEntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Queued => write!(f, "queued"),
        }
    }
}

/// One row of the queue listing
///
/// Running runs have position 0; queued runs are numbered from 1 in the
/// order they will start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub run_id: String,
    pub strategy_code: String,
    pub priority: Priority,
    pub status: QueueEntryStatus,
    pub position: usize,
    pub universe_size: usize,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_start: Option<DateTime<Utc>>,
}
