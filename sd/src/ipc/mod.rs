//! Inter-Process Communication between the CLI and the daemon
//!
//! Unix Domain Socket carrying newline-delimited JSON. The CLI connects,
//! writes one request, and reads either one response or, for `Subscribe`,
//! a stream of progress events.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;

pub use client::{DaemonClient, EventStream};
pub use listener::{cleanup_socket, create_listener_at, read_message, send_response};
pub use messages::{DaemonMessage, DaemonResponse, StrategyInfo};

/// Default socket path for daemon IPC
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("stratd")
        .join("stratd.sock")
}
