//! Subscriber side of the progress broadcaster

use std::collections::VecDeque;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use super::broadcaster::Inner;
use super::types::ProgressEvent;

/// A single consumer's view of one run's progress
///
/// Yields the replayed history first, then live events. When no event
/// arrives within the heartbeat interval a synthetic `Heartbeat` is
/// produced. The subscription ends after the run's terminal event, or when
/// the broadcaster drops it as a slow consumer.
pub struct Subscription {
    run_id: String,
    subscriber_id: Option<u64>,
    replay: VecDeque<ProgressEvent>,
    rx: Option<mpsc::Receiver<ProgressEvent>>,
    heartbeat_interval: Duration,
    last_percent: f64,
    finished: bool,
    owner: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub(super) fn live(
        run_id: &str,
        subscriber_id: u64,
        replay: VecDeque<ProgressEvent>,
        rx: mpsc::Receiver<ProgressEvent>,
        heartbeat_interval: Duration,
        last_percent: f64,
        owner: Weak<Mutex<Inner>>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            subscriber_id: Some(subscriber_id),
            replay,
            rx: Some(rx),
            heartbeat_interval,
            last_percent,
            finished: false,
            owner,
        }
    }

    pub(super) fn replay_only(run_id: &str, replay: VecDeque<ProgressEvent>, heartbeat_interval: Duration) -> Self {
        Self {
            run_id: run_id.to_string(),
            subscriber_id: None,
            replay,
            rx: None,
            heartbeat_interval,
            last_percent: 0.0,
            finished: false,
            owner: Weak::new(),
        }
    }

    /// A detached subscription over a fixed list of events
    ///
    /// Used when a run finished long enough ago that its history was
    /// released and only a terminal summary can be produced.
    pub fn from_events(run_id: impl Into<String>, events: Vec<ProgressEvent>) -> Self {
        let run_id = run_id.into();
        Self::replay_only(&run_id, events.into(), Duration::from_secs(30))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Whether this subscriber is registered for live events
    pub fn is_live(&self) -> bool {
        self.rx.is_some()
    }

    fn observe(&mut self, event: &ProgressEvent) {
        self.last_percent = self.last_percent.max(event.progress_percent);
        if event.is_terminal() {
            self.finished = true;
        }
    }

    /// Next event, or None once the stream has ended
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        if let Some(event) = self.replay.pop_front() {
            self.observe(&event);
            if self.finished {
                self.detach();
            }
            return Some(event);
        }

        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => {
                self.finished = true;
                return None;
            }
        };

        match tokio::time::timeout(self.heartbeat_interval, rx.recv()).await {
            Ok(Some(event)) => {
                self.observe(&event);
                if self.finished {
                    self.detach();
                }
                Some(event)
            }
            Ok(None) => {
                debug!(run_id = %self.run_id, "Subscription::next_event: channel closed");
                self.finished = true;
                None
            }
            Err(_) => Some(ProgressEvent::heartbeat(self.run_id.clone(), self.last_percent)),
        }
    }

    /// Convert into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next_event().await?;
            Some((event, sub))
        })
    }

    fn detach(&mut self) {
        self.rx = None;
        let Some(subscriber_id) = self.subscriber_id.take() else {
            return;
        };
        if let Some(owner) = self.owner.upgrade() {
            let mut inner = owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.detach(&self.run_id, subscriber_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("run_id", &self.run_id)
            .field("subscriber_id", &self.subscriber_id)
            .field("pending_replay", &self.replay.len())
            .field("finished", &self.finished)
            .finish()
    }
}
