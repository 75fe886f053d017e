//! ItemEvaluator trait definition

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Evaluation, Parameters};

/// Item-level evaluation failure
///
/// Recorded on the item's result; never fails the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("Evaluation failed: {0}")]
    Failed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Strategy plugin that evaluates one item at a time
///
/// Invoked concurrently from a run's worker pool, so implementations must
/// not share mutable state across calls.
#[async_trait]
pub trait ItemEvaluator: Send + Sync {
    /// Evaluate a single item
    async fn evaluate(&self, item_key: &str, parameters: &Parameters) -> Result<Evaluation, EvaluationError>;

    /// Check parameters at submission; an error rejects the run
    fn validate(&self, _parameters: &Parameters) -> Result<(), String> {
        Ok(())
    }

    /// One-line description for listings
    fn description(&self) -> &str {
        ""
    }
}
