//! Submission errors

use thiserror::Error;

use crate::state::StateError;

/// Reasons a submission is rejected
///
/// Returned synchronously from `submit`; nothing is persisted for a
/// rejected run.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Queue full: {max_queue_size} runs already waiting")]
    QueueFull { max_queue_size: usize },

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StateError),
}

impl SubmitError {
    /// Stable error code for clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownStrategy(_) => "unknown_strategy",
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::QueueFull { .. } => "queue_full",
            Self::ShuttingDown => "shutting_down",
            Self::Store(_) => "store",
        }
    }
}
