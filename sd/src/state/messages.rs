//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{InvalidTransition, ItemResult, ResultFilter, Run, RunFinalization};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Channel error")]
    ChannelError,
}

impl From<stratstore::StoreError> for StateError {
    fn from(err: stratstore::StoreError) -> Self {
        StateError::StoreError(err.to_string())
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Run operations
    CreateRun {
        run: Run,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetRun {
        run_id: String,
        reply: oneshot::Sender<StateResponse<Option<Run>>>,
    },
    MarkRunning {
        run_id: String,
        reply: oneshot::Sender<StateResponse<Run>>,
    },
    UpdateRunProgress {
        run_id: String,
        processed: usize,
        qualifying: usize,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    FinalizeRun {
        run_id: String,
        outcome: RunFinalization,
        reply: oneshot::Sender<StateResponse<Run>>,
    },
    ListRecentRuns {
        limit: usize,
        strategy: Option<String>,
        reply: oneshot::Sender<StateResponse<Vec<Run>>>,
    },

    // ItemResult operations
    UpsertItemResult {
        result: ItemResult,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetItemResults {
        run_id: String,
        filter: ResultFilter,
        reply: oneshot::Sender<StateResponse<Vec<ItemResult>>>,
    },

    // Startup recovery
    RecoverInterrupted {
        reply: oneshot::Sender<StateResponse<Vec<Run>>>,
    },

    // Shutdown
    Shutdown,
}
