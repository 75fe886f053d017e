//! Progress distribution
//!
//! Workers emit [`ProgressEvent`]s through a per-run [`ProgressEmitter`]; the
//! [`ProgressBroadcaster`] keeps a bounded history per run and fans events out
//! to any number of [`Subscription`]s.
//!
//! ```text
//!   ExecutionWorker ──emit──▶ ProgressBroadcaster ──try_send──▶ Subscription (IPC Subscribe)
//!   Scheduler ───────emit──▶   (history ring buffer)  └───────▶ Subscription ...
//! ```
//!
//! Subscribers that join late replay the retained history before live events.
//! A subscriber whose queue fills up is dropped; the producer never waits.

mod broadcaster;
mod config;
mod emitter;
mod subscription;
mod types;

pub use broadcaster::ProgressBroadcaster;
pub use config::BroadcastConfig;
pub use emitter::ProgressEmitter;
pub use subscription::Subscription;
pub use types::{PROCESSING_CEILING, ProgressEvent, ProgressEventType, processing_percent, stage};
