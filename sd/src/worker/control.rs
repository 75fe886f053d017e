//! Run cancellation control

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct ControlState {
    cancel_requested: bool,
    sealed: bool,
}

/// Cancellation handle shared by the scheduler and a run's worker
///
/// A cancel request and the worker's terminal decision are ordered by one
/// lock: a cancel accepted before [`RunControl::seal`] always ends the run
/// Cancelled, and a cancel after it is refused.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    token: CancellationToken,
    state: Arc<Mutex<ControlState>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask the worker to stop dispatching items
    ///
    /// Returns false when the run has already been sealed for finalization.
    pub fn request_cancel(&self) -> bool {
        let mut state = self.lock();
        if state.sealed {
            debug!("RunControl::request_cancel: already sealed");
            return false;
        }
        state.cancel_requested = true;
        self.token.cancel();
        true
    }

    /// Close the run to further cancels; returns whether one was accepted
    pub fn seal(&self) -> bool {
        let mut state = self.lock();
        state.sealed = true;
        state.cancel_requested
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Resolves once a cancel has been accepted
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
