//! Progress Broadcaster - per-run fan-out with replayable history
//!
//! Every run gets a bounded history ring buffer and a set of subscribers.
//! Publishing never blocks the producer: each subscriber has its own bounded
//! queue and is dropped when that queue is full.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::config::BroadcastConfig;
use super::emitter::ProgressEmitter;
use super::subscription::Subscription;
use super::types::ProgressEvent;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
}

struct RunChannel {
    history: VecDeque<ProgressEvent>,
    subscribers: Vec<SubscriberSlot>,
    last_event_at: Instant,
    last_percent: f64,
    terminal: bool,
}

impl RunChannel {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            subscribers: Vec::new(),
            last_event_at: Instant::now(),
            last_percent: 0.0,
            terminal: false,
        }
    }

    fn prune_closed(&mut self) {
        self.subscribers.retain(|s| !s.tx.is_closed());
    }
}

#[derive(Default)]
pub(super) struct Inner {
    runs: HashMap<String, RunChannel>,
    next_subscriber_id: u64,
}

impl Inner {
    pub(super) fn detach(&mut self, run_id: &str, subscriber_id: u64) {
        if let Some(channel) = self.runs.get_mut(run_id) {
            channel.subscribers.retain(|s| s.id != subscriber_id);
            debug!(%run_id, subscriber_id, remaining = channel.subscribers.len(), "ProgressBroadcaster: subscriber detached");
        }
    }
}

/// Central progress fan-out, shared by workers, the scheduler and the IPC layer
pub struct ProgressBroadcaster {
    config: BroadcastConfig,
    inner: Arc<Mutex<Inner>>,
}

impl ProgressBroadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        debug!(?config, "ProgressBroadcaster::new: called");
        Self {
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an emitter bound to one run
    pub fn emitter_for(self: &Arc<Self>, run_id: impl Into<String>) -> ProgressEmitter {
        ProgressEmitter::new(run_id, Arc::clone(self))
    }

    /// Publish an event for its run
    ///
    /// Non-heartbeat events after the run's terminal event are discarded.
    /// Percent is raised to the last published value so subscribers never
    /// see it go backwards.
    pub fn publish(&self, mut event: ProgressEvent) {
        let capacity = self.config.history_capacity.max(1);
        let mut inner = self.lock();
        let channel = inner
            .runs
            .entry(event.run_id.clone())
            .or_insert_with(RunChannel::new);

        if channel.terminal && !event.is_heartbeat() {
            debug!(run_id = %event.run_id, event_type = %event.event_type, "ProgressBroadcaster::publish: run already terminal, dropping");
            return;
        }

        if event.progress_percent < channel.last_percent {
            event.progress_percent = channel.last_percent;
        }
        channel.last_percent = event.progress_percent;
        channel.last_event_at = Instant::now();

        debug!(
            run_id = %event.run_id,
            event_type = %event.event_type,
            percent = event.progress_percent,
            subscribers = channel.subscribers.len(),
            "ProgressBroadcaster::publish"
        );

        if !event.is_heartbeat() {
            if channel.history.len() >= capacity {
                channel.history.pop_front();
            }
            channel.history.push_back(event.clone());
        }

        channel.subscribers.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(run_id = %event.run_id, subscriber_id = slot.id, "ProgressBroadcaster: slow subscriber dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(run_id = %event.run_id, subscriber_id = slot.id, "ProgressBroadcaster: subscriber gone");
                false
            }
        });

        if event.is_terminal() {
            channel.terminal = true;
            // Subscribers end on the terminal event; closing their senders lets
            // them drain and finish.
            channel.subscribers.clear();
        }
    }

    /// Attach a subscriber to a run
    ///
    /// The replay snapshot and the live registration happen under one lock,
    /// so the subscriber sees every event exactly once and in order. A run
    /// whose history already ends in a terminal event gets the replay only.
    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let heartbeat = self.config.heartbeat_interval();
        let subscriber_capacity = self.config.subscriber_capacity.max(1);
        let mut inner = self.lock();
        let subscriber_id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;

        let channel = inner.runs.entry(run_id.to_string()).or_insert_with(RunChannel::new);
        channel.prune_closed();
        let replay: VecDeque<ProgressEvent> = channel.history.iter().cloned().collect();
        let last_percent = channel.last_percent;

        if channel.terminal {
            debug!(%run_id, replay = replay.len(), "ProgressBroadcaster::subscribe: run finished, replay only");
            return Subscription::replay_only(run_id, replay, heartbeat);
        }

        let (tx, rx) = mpsc::channel(subscriber_capacity);
        channel.subscribers.push(SubscriberSlot { id: subscriber_id, tx });
        info!(%run_id, subscriber_id, replay = replay.len(), "ProgressBroadcaster::subscribe: subscriber attached");

        Subscription::live(
            run_id,
            subscriber_id,
            replay,
            rx,
            heartbeat,
            last_percent,
            Arc::downgrade(&self.inner),
        )
    }

    /// Called once a run has reached a terminal status
    ///
    /// Releases the run's history when nobody is watching and history is not
    /// retained after completion; retained history is left to [`sweep`].
    /// Returns true when the history was released.
    ///
    /// [`sweep`]: ProgressBroadcaster::sweep
    pub fn cleanup(&self, run_id: &str) -> bool {
        if self.config.retain_history_after_completion {
            debug!(%run_id, "ProgressBroadcaster::cleanup: history retained");
            return false;
        }
        let mut inner = self.lock();
        let release = match inner.runs.get_mut(run_id) {
            Some(channel) => {
                channel.prune_closed();
                channel.terminal && channel.subscribers.is_empty()
            }
            None => false,
        };
        if release {
            inner.runs.remove(run_id);
            debug!(%run_id, "ProgressBroadcaster::cleanup: history released");
        }
        release
    }

    /// Drop state for runs with no subscribers and no events newer than `max_age`
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut inner = self.lock();
        let before = inner.runs.len();
        inner.runs.retain(|_, channel| {
            channel.prune_closed();
            !(channel.subscribers.is_empty() && channel.last_event_at.elapsed() >= max_age)
        });
        let swept = before - inner.runs.len();
        if swept > 0 {
            info!(swept, remaining = inner.runs.len(), "ProgressBroadcaster::sweep: released stale runs");
        }
        swept
    }

    /// Live subscribers of a run
    pub fn subscriber_count(&self, run_id: &str) -> usize {
        let mut inner = self.lock();
        inner
            .runs
            .get_mut(run_id)
            .map(|channel| {
                channel.prune_closed();
                channel.subscribers.len()
            })
            .unwrap_or(0)
    }

    /// Snapshot of a run's retained history
    pub fn history(&self, run_id: &str) -> Vec<ProgressEvent> {
        self.lock()
            .runs
            .get(run_id)
            .map(|channel| channel.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether anything is retained for the run
    pub fn has_history(&self, run_id: &str) -> bool {
        self.lock()
            .runs
            .get(run_id)
            .is_some_and(|channel| !channel.history.is_empty())
    }

    /// Number of runs with broadcaster state
    pub fn tracked_runs(&self) -> usize {
        self.lock().runs.len()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}
