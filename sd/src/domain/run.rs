//! Run domain type
//!
//! A Run is one submitted execution of a strategy over a set of items.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratstore::{IndexValue, Record, now_ms};
use thiserror::Error;
use tracing::debug;

use super::{Parameters, Priority};

/// Run lifecycle status
///
/// Transitions are one-directional: `Queued -> Running -> {Completed | Error | Cancelled}`
/// or `Queued -> Cancelled`. Terminal runs are never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for a slot
    #[default]
    Queued,
    /// Items are being evaluated
    Running,
    /// Every item was processed
    Completed,
    /// A run-fatal condition stopped processing
    Error,
    /// Stopped by an explicit cancel
    Cancelled,
}

impl RunStatus {
    /// Completed, Error and Cancelled are terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Cancelled | Self::Error),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Error | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// Rejected status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid run transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Persistent metadata of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier, generated at submission
    pub run_id: String,

    /// Registered strategy that evaluates the items
    pub strategy_code: String,

    /// Opaque strategy parameters
    #[serde(default)]
    pub parameters: Parameters,

    pub priority: Priority,

    pub status: RunStatus,

    pub submitted_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of distinct items submitted
    pub universe_size: usize,

    /// Items with a recorded result
    #[serde(default)]
    pub processed_count: usize,

    /// Items whose result passed
    #[serde(default)]
    pub qualifying_count: usize,

    /// Wall time between start and terminal status
    #[serde(default)]
    pub duration_ms: Option<u64>,

    /// Message for runs that ended in Error
    #[serde(default)]
    pub error_message: Option<String>,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Run {
    /// Create a queued run
    pub fn new(
        run_id: impl Into<String>,
        strategy_code: impl Into<String>,
        parameters: Parameters,
        priority: Priority,
        universe_size: usize,
    ) -> Self {
        let run_id = run_id.into();
        let strategy_code = strategy_code.into();
        debug!(%run_id, %strategy_code, ?priority, universe_size, "Run::new: called");
        Self {
            run_id,
            strategy_code,
            parameters,
            priority,
            status: RunStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            universe_size,
            processed_count: 0,
            qualifying_count: 0,
            duration_ms: None,
            error_message: None,
            updated_at: now_ms(),
        }
    }

    /// Check if the run is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            debug!(run_id = %self.run_id, from = %self.status, to = %next, "Run::transition: rejected");
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now_ms();
        Ok(())
    }

    /// Queued -> Running
    pub fn mark_running(&mut self) -> Result<(), InvalidTransition> {
        debug!(run_id = %self.run_id, "Run::mark_running: called");
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record progress counters on a running run
    pub fn record_progress(&mut self, processed: usize, qualifying: usize) -> Result<(), InvalidTransition> {
        if self.status != RunStatus::Running {
            return Err(InvalidTransition {
                from: self.status,
                to: RunStatus::Running,
            });
        }
        self.processed_count = processed;
        self.qualifying_count = qualifying;
        self.updated_at = now_ms();
        Ok(())
    }

    /// Move to a terminal status
    ///
    /// Duration is measured from `started_at`; runs cancelled while queued
    /// never started and get no duration.
    pub fn finalize(&mut self, outcome: &RunFinalization) -> Result<(), InvalidTransition> {
        debug!(run_id = %self.run_id, status = %outcome.status, "Run::finalize: called");
        if !outcome.status.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to: outcome.status,
            });
        }
        self.transition(outcome.status)?;
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(processed) = outcome.processed_count {
            self.processed_count = processed;
        }
        if let Some(qualifying) = outcome.qualifying_count {
            self.qualifying_count = qualifying;
        }
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
        self.error_message = outcome.error_message.clone();
        Ok(())
    }
}

/// Terminal values written by `finalize`
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinalization {
    pub status: RunStatus,
    pub processed_count: Option<usize>,
    pub qualifying_count: Option<usize>,
    pub error_message: Option<String>,
}

impl RunFinalization {
    /// Normal completion with final counters
    pub fn completed(processed: usize, qualifying: usize) -> Self {
        Self {
            status: RunStatus::Completed,
            processed_count: Some(processed),
            qualifying_count: Some(qualifying),
            error_message: None,
        }
    }

    /// Cancellation, keeping whatever counters the worker reached
    pub fn cancelled(counts: Option<(usize, usize)>) -> Self {
        Self {
            status: RunStatus::Cancelled,
            processed_count: counts.map(|(p, _)| p),
            qualifying_count: counts.map(|(_, q)| q),
            error_message: None,
        }
    }

    /// Run-fatal error
    pub fn error(message: impl Into<String>, counts: Option<(usize, usize)>) -> Self {
        Self {
            status: RunStatus::Error,
            processed_count: counts.map(|(p, _)| p),
            qualifying_count: counts.map(|(_, q)| q),
            error_message: Some(message.into()),
        }
    }
}

impl Record for Run {
    fn id(&self) -> &str {
        &self.run_id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "runs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("strategy_code".to_string(), IndexValue::String(self.strategy_code.clone()));
        fields.insert("priority".to_string(), IndexValue::String(self.priority.to_string()));
        fields.insert(
            "submitted_at".to_string(),
            IndexValue::Int(self.submitted_at.timestamp_millis()),
        );
        fields
    }
}
