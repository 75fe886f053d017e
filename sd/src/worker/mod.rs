//! Execution worker
//!
//! Runs one Run's items through its strategy's evaluator on a bounded pool,
//! persisting results and emitting progress as items complete.

mod config;
mod control;
mod execution;

pub use config::WorkerConfig;
pub use control::RunControl;
pub use execution::{ExecutionWorker, RunJob, RunOutcome};
