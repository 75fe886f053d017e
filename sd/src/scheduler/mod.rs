//! Run scheduler
//!
//! Owns the priority queue of submitted runs, enforces the concurrency cap,
//! and routes cancellation to queued or running runs.

mod config;
mod core;
mod queue;

pub use config::SchedulerConfig;
pub use core::Scheduler;
pub use queue::{QueueEntry, QueueEntryStatus, QueuedRun, RunRequest, SchedulerStats, normalize_items};
