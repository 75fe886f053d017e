//! StratD - Strategy run scheduler with progress fan-out
//!
//! Clients submit strategy runs, each evaluating a list of named items.
//! Runs wait in a priority queue for one of a bounded number of execution
//! slots, evaluate their items on a bounded per-run worker pool, and stream
//! progress to any number of subscribers.
//!
//! # Core Concepts
//!
//! - **Admission**: submissions are validated and queued, or rejected synchronously
//! - **Bounded execution**: at most `max-concurrent` runs, each with at most `max-workers` items in flight
//! - **Failure isolation**: a failing item is recorded and the run carries on
//! - **Progress fan-out**: late subscribers replay history, slow ones are dropped
//! - **Cooperative cancellation**: in-flight items get a grace period, then are abandoned
//!
//! # Modules
//!
//! - [`scheduler`] - Priority queue, concurrency cap, cancellation routing
//! - [`worker`] - Per-run execution over the item universe
//! - [`events`] - Progress events, broadcaster and subscriptions
//! - [`state`] - Actor owning the persistent run store
//! - [`strategy`] - Item evaluators and the strategy registry
//! - [`daemon`] - Component wiring and the IPC server
//! - [`ipc`] - Unix socket protocol and client

pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod events;
pub mod ipc;
pub mod scheduler;
pub mod state;
pub mod strategy;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use daemon::Daemon;
pub use domain::{
    Evaluation, Filter, FilterOp, IndexValue, ItemResult, Parameters, Priority, Record, ResultFilter, Run,
    RunStatus, Store,
};
pub use error::SubmitError;
pub use events::{BroadcastConfig, ProgressBroadcaster, ProgressEmitter, ProgressEvent, ProgressEventType, Subscription};
pub use ipc::{DaemonClient, DaemonMessage, DaemonResponse};
pub use scheduler::{QueueEntry, QueueEntryStatus, RunRequest, Scheduler, SchedulerConfig, SchedulerStats};
pub use state::{StateCommand, StateError, StateManager, StateResponse};
pub use strategy::{EvaluationError, ItemEvaluator, StrategyRegistry};
pub use worker::{ExecutionWorker, RunControl, RunOutcome, WorkerConfig};
