//! IPC message types for daemon communication
//!
//! Simple JSON-over-newline protocol. Each message is a single line of JSON followed by `\n`.
//! Every request gets exactly one response line, except `Subscribe`, which is
//! answered with a stream of `Event` lines ending after a terminal event.

use serde::{Deserialize, Serialize};

use crate::domain::{ItemResult, Parameters, Priority, ResultFilter, Run};
use crate::events::ProgressEvent;
use crate::scheduler::{QueueEntry, RunRequest, SchedulerStats};

fn default_list_limit() -> usize {
    20
}

/// Messages from CLI to Daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    /// Queue a new run
    Submit {
        strategy_code: String,
        items: Vec<String>,
        #[serde(default)]
        parameters: Parameters,
        #[serde(default)]
        priority: Option<Priority>,
    },

    /// Current persisted state of a run
    GetStatus { run_id: String },

    /// Cancel a queued or running run
    Cancel { run_id: String },

    /// Running and queued runs with start estimates
    GetQueue,

    /// Stream progress events for a run
    Subscribe { run_id: String },

    /// Item results of a run in sequence order
    GetResults {
        run_id: String,
        #[serde(default)]
        filter: ResultFilter,
    },

    /// Most recent runs
    ListRuns {
        #[serde(default = "default_list_limit")]
        limit: usize,
        #[serde(default)]
        strategy: Option<String>,
    },

    /// Registered strategy codes
    ListStrategies,

    /// Scheduler counters
    GetStats,

    /// Ping to check if daemon is alive
    Ping,

    /// Request daemon to stop gracefully
    Shutdown,
}

impl From<RunRequest> for DaemonMessage {
    fn from(request: RunRequest) -> Self {
        Self::Submit {
            strategy_code: request.strategy_code,
            items: request.items,
            parameters: request.parameters,
            priority: request.priority,
        }
    }
}

/// A registered strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrategyInfo {
    pub code: String,
    pub description: String,
}

/// Responses from Daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    /// Acknowledgment
    Ok,

    /// Run accepted
    Submitted { run_id: String },

    /// Submission refused; `code` is one of the stable submit error codes
    Rejected { code: String, message: String },

    /// Run state
    Status { run: Run },

    /// No run with that id
    NotFound { run_id: String },

    /// Outcome of a cancel request
    CancelResult { run_id: String, accepted: bool },

    /// Queue listing
    Queue { entries: Vec<QueueEntry> },

    /// One progress event of a subscription
    Event { event: ProgressEvent },

    /// Item results
    Results { run_id: String, results: Vec<ItemResult> },

    /// Recent runs, newest first
    Runs { runs: Vec<Run> },

    /// Registered strategies
    Strategies { strategies: Vec<StrategyInfo> },

    /// Scheduler counters
    Stats { stats: SchedulerStats },

    /// Pong response to ping
    Pong { version: String },

    /// Error response
    Error { message: String },
}
