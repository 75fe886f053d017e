//! State management with actor pattern
//!
//! StateManager owns the StratStore and processes messages via channels,
//! providing thread-safe, serialized access to persistent run state.

mod manager;
mod messages;

pub use manager::{INTERRUPTED_MESSAGE, StateManager};
pub use messages::{StateCommand, StateError, StateResponse};
