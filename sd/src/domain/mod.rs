//! Domain types for StratD
//!
//! Core domain types: Run, ItemResult, Priority.
//! Run and ItemResult implement the Record trait for StratStore persistence.

mod id;
mod item_result;
mod priority;
mod run;

pub use id::generate_run_id;
pub use item_result::{Evaluation, ItemResult, ResultFilter};
pub use priority::Priority;
pub use run::{InvalidTransition, Run, RunFinalization, RunStatus};

// Re-export stratstore types for convenience
pub use stratstore::{Filter, FilterOp, IndexValue, Record, Store};

/// Opaque strategy parameters (string -> JSON value)
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Open metrics map attached to results and events; the key set varies per strategy
pub type Metrics = serde_json::Map<String, serde_json::Value>;
