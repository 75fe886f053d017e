//! Scheduler implementation

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{ItemResult, Parameters, Priority, ResultFilter, Run, RunFinalization, RunStatus, generate_run_id};
use crate::error::SubmitError;
use crate::events::{ProgressBroadcaster, ProgressEvent, ProgressEventType, Subscription, processing_percent, stage};
use crate::state::{StateError, StateManager};
use crate::strategy::{ItemEvaluator, StrategyRegistry};
use crate::worker::{ExecutionWorker, RunControl, RunJob, RunOutcome, WorkerConfig};

use super::config::SchedulerConfig;
use super::queue::{QueueEntry, QueueEntryStatus, QueuedRun, RunRequest, SchedulerStats, normalize_items};

/// A queued run's execution inputs, held until promotion
struct PendingRun {
    strategy_code: String,
    items: Vec<String>,
    parameters: Arc<Parameters>,
    evaluator: Arc<dyn ItemEvaluator>,
}

/// A promoted run
struct RunningRun {
    strategy_code: String,
    priority: Priority,
    universe_size: usize,
    enqueued_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    control: RunControl,
}

/// Internal state protected by mutex
struct SchedulerInner {
    /// Priority queue of waiting runs
    queue: BinaryHeap<QueuedRun>,

    /// Execution inputs for queued runs, keyed by run_id
    pending: HashMap<String, PendingRun>,

    /// Currently running runs
    running: HashMap<String, RunningRun>,

    next_seq: u64,

    /// Statistics
    stats: SchedulerStats,
}

struct Shared {
    config: SchedulerConfig,
    inner: Mutex<SchedulerInner>,
    notify: Notify,
    state: StateManager,
    broadcaster: Arc<ProgressBroadcaster>,
    registry: StrategyRegistry,
    worker: ExecutionWorker,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// The Scheduler owns the run queue, enforces the concurrency cap and
/// routes cancellation.
///
/// Cheap to clone; every clone drives the same queue. Once
/// [`Scheduler::start`] has been called, a submission that finds a free slot
/// is promoted before `submit` returns; the control loop promotes queued runs
/// as slots free up.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Terminal event for a run whose history is no longer retained
fn terminal_event(run: &Run) -> ProgressEvent {
    let percent = processing_percent(run.processed_count, run.universe_size);
    let event = match run.status {
        RunStatus::Completed => ProgressEvent::new(
            &run.run_id,
            ProgressEventType::Completed,
            stage::COMPLETED,
            100.0,
            format!(
                "Completed: {} of {} items qualified",
                run.qualifying_count, run.universe_size
            ),
        ),
        RunStatus::Cancelled => ProgressEvent::new(
            &run.run_id,
            ProgressEventType::Cancelled,
            stage::CANCELLED,
            percent,
            format!("Cancelled after {} of {} items", run.processed_count, run.universe_size),
        ),
        _ => ProgressEvent::new(
            &run.run_id,
            ProgressEventType::Error,
            stage::FAILED,
            percent,
            run.error_message.clone().unwrap_or_else(|| "run failed".to_string()),
        ),
    };
    event.with_counts(run.processed_count, run.universe_size)
}

impl Scheduler {
    /// Create a new scheduler; call [`Scheduler::start`] to begin promoting runs
    pub fn new(
        config: SchedulerConfig,
        worker_config: WorkerConfig,
        state: StateManager,
        broadcaster: Arc<ProgressBroadcaster>,
        registry: StrategyRegistry,
    ) -> Self {
        debug!(?config, ?worker_config, strategies = ?registry.codes(), "Scheduler::new: called");
        let worker = ExecutionWorker::new(worker_config, state.clone(), Arc::clone(&broadcaster));
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(SchedulerInner {
                    queue: BinaryHeap::new(),
                    pending: HashMap::new(),
                    running: HashMap::new(),
                    next_seq: 0,
                    stats: SchedulerStats::default(),
                }),
                notify: Notify::new(),
                state,
                broadcaster,
                registry,
                worker,
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.shared.registry
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.shared.broadcaster
    }

    pub fn state(&self) -> &StateManager {
        &self.shared.state
    }

    async fn reject(&self, err: SubmitError) -> SubmitError {
        debug!(error = %err, "Scheduler::submit: rejected");
        self.shared.inner.lock().await.stats.total_rejected += 1;
        err
    }

    /// Validate and enqueue a run, returning its id immediately
    pub async fn submit(&self, request: RunRequest) -> Result<String, SubmitError> {
        let RunRequest {
            strategy_code,
            items,
            parameters,
            priority,
        } = request;
        debug!(%strategy_code, items = items.len(), ?priority, "Scheduler::submit: called");

        if self.shared.shutdown.is_cancelled() {
            return Err(self.reject(SubmitError::ShuttingDown).await);
        }

        let Some(evaluator) = self.shared.registry.get(&strategy_code) else {
            return Err(self.reject(SubmitError::UnknownStrategy(strategy_code)).await);
        };

        let items = match normalize_items(items) {
            Ok(items) => items,
            Err(reason) => return Err(self.reject(SubmitError::InvalidParameters(reason)).await),
        };

        if let Err(reason) = evaluator.validate(&parameters) {
            return Err(self.reject(SubmitError::InvalidParameters(reason)).await);
        }

        let priority = priority.unwrap_or(self.shared.config.default_priority);
        let mut inner = self.shared.inner.lock().await;

        if inner.queue.len() >= self.shared.config.max_queue_size {
            debug!(queued = inner.queue.len(), "Scheduler::submit: queue full");
            inner.stats.total_rejected += 1;
            return Err(SubmitError::QueueFull {
                max_queue_size: self.shared.config.max_queue_size,
            });
        }

        let run_id = generate_run_id(&strategy_code);
        let run = Run::new(&run_id, &strategy_code, parameters.clone(), priority, items.len());
        if let Err(e) = self.shared.state.create_run(run).await {
            inner.stats.total_rejected += 1;
            return Err(e.into());
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push(QueuedRun::new(&run_id, priority, seq));
        inner.pending.insert(
            run_id.clone(),
            PendingRun {
                strategy_code: strategy_code.clone(),
                items,
                parameters: Arc::new(parameters),
                evaluator,
            },
        );
        inner.stats.total_submitted += 1;
        inner.stats.peak_queue_depth = inner.stats.peak_queue_depth.max(inner.queue.len());
        info!(%run_id, %strategy_code, %priority, queued = inner.queue.len(), "Run submitted");

        if self.shared.started.load(Ordering::Acquire) {
            self.promote_locked(&mut inner).await;
        }
        Ok(run_id)
    }

    /// Spawn the control loop that promotes queued runs into free slots
    pub fn start(&self) -> JoinHandle<()> {
        debug!("Scheduler::start: called");
        self.shared.started.store(true, Ordering::Release);
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.control_loop().await })
    }

    async fn control_loop(&self) {
        info!(max_concurrent = self.shared.config.slots(), "Scheduler control loop started");
        loop {
            self.promote_ready().await;
            tokio::select! {
                _ = self.shared.notify.notified() => {}
                _ = self.shared.shutdown.cancelled() => break,
            }
        }
        info!("Scheduler control loop stopped");
    }

    async fn promote_ready(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.promote_locked(&mut inner).await;
    }

    /// Start queued runs while slots are free; the caller holds the queue lock
    async fn promote_locked(&self, inner: &mut SchedulerInner) {
        while inner.running.len() < self.shared.config.slots() && !self.shared.shutdown.is_cancelled() {
            let Some(next) = inner.queue.pop() else {
                break;
            };
            let Some(pending) = inner.pending.remove(&next.run_id) else {
                debug!(run_id = %next.run_id, "Scheduler::promote_ready: no pending inputs, skipping");
                continue;
            };
            let run_id = next.run_id.clone();

            if let Err(e) = self.shared.state.mark_running(&run_id).await {
                error!(%run_id, error = %e, "Scheduler::promote_ready: could not start run");
                let message = format!("Failed to start run: {}", e);
                if let Err(e) = self
                    .shared
                    .state
                    .finalize_run(&run_id, RunFinalization::error(message.clone(), None))
                    .await
                {
                    warn!(%run_id, error = %e, "Scheduler::promote_ready: could not persist error status");
                }
                self.shared
                    .broadcaster
                    .emitter_for(run_id.clone())
                    .error(&message, 0, pending.items.len());
                self.shared.broadcaster.cleanup(&run_id);
                inner.stats.total_failed += 1;
                continue;
            }

            let control = RunControl::new();
            inner.running.insert(
                run_id.clone(),
                RunningRun {
                    strategy_code: pending.strategy_code.clone(),
                    priority: next.priority,
                    universe_size: pending.items.len(),
                    enqueued_at: next.enqueued_at,
                    started_at: Utc::now(),
                    control: control.clone(),
                },
            );
            inner.stats.total_started += 1;
            inner.stats.peak_concurrent = inner.stats.peak_concurrent.max(inner.running.len());
            info!(%run_id, priority = %next.priority, running = inner.running.len(), "Run promoted");

            let job = RunJob {
                run_id: run_id.clone(),
                items: pending.items,
                parameters: pending.parameters,
                evaluator: pending.evaluator,
            };
            let scheduler = self.clone();
            tokio::spawn(async move {
                let outcome = scheduler.shared.worker.run(job, control).await;
                scheduler.finish(&run_id, outcome).await;
            });
        }
    }

    /// Free a slot after a worker returns
    async fn finish(&self, run_id: &str, outcome: RunOutcome) {
        debug!(%run_id, status = %outcome.status(), "Scheduler::finish: called");
        let mut inner = self.shared.inner.lock().await;
        if let Some(running) = inner.running.remove(run_id) {
            let elapsed = (Utc::now() - running.started_at).num_milliseconds().max(0) as u64;
            inner.stats.total_run_time_ms += elapsed;
            inner.stats.total_finished += 1;
        }
        match outcome {
            RunOutcome::Completed { .. } => inner.stats.total_completed += 1,
            RunOutcome::Cancelled { .. } => inner.stats.total_cancelled += 1,
            RunOutcome::Failed { .. } => inner.stats.total_failed += 1,
        }
        let running = inner.running.len();
        drop(inner);

        info!(%run_id, running, "Run finished, slot freed");
        self.shared.broadcaster.cleanup(run_id);
        self.shared.notify.notify_one();
    }

    /// Cancel a run
    ///
    /// A queued run is removed and marked Cancelled before this returns. A
    /// running run is signalled and finishes Cancelled once its in-flight
    /// items drain or the grace period ends. Returns false for terminal or
    /// unknown runs.
    pub async fn cancel(&self, run_id: &str) -> bool {
        debug!(%run_id, "Scheduler::cancel: called");
        let mut inner = self.shared.inner.lock().await;

        if let Some(pending) = inner.pending.remove(run_id) {
            inner.queue.retain(|q| q.run_id != run_id);
            if let Err(e) = self
                .shared
                .state
                .finalize_run(run_id, RunFinalization::cancelled(None))
                .await
            {
                warn!(%run_id, error = %e, "Scheduler::cancel: could not persist cancelled status");
            }
            inner.stats.total_cancelled += 1;
            drop(inner);

            self.shared
                .broadcaster
                .emitter_for(run_id)
                .cancelled(0, pending.items.len(), 0);
            self.shared.broadcaster.cleanup(run_id);
            info!(%run_id, "Queued run cancelled");
            return true;
        }

        if let Some(running) = inner.running.get(run_id) {
            let accepted = running.control.request_cancel();
            info!(%run_id, accepted, "Cancel requested for running run");
            return accepted;
        }

        debug!(%run_id, "Scheduler::cancel: not queued or running");
        false
    }

    /// Running runs (position 0) followed by queued runs in start order
    pub async fn queue_status(&self) -> Vec<QueueEntry> {
        debug!("Scheduler::queue_status: called");
        let inner = self.shared.inner.lock().await;
        let now = Utc::now();
        let average = inner
            .stats
            .average_run_duration()
            .unwrap_or_else(|| self.shared.config.default_run_estimate());
        let average_ms = i64::try_from(average.as_millis()).unwrap_or(i64::MAX);
        let running_count = inner.running.len();

        let mut running: Vec<QueueEntry> = inner
            .running
            .iter()
            .map(|(run_id, r)| QueueEntry {
                run_id: run_id.clone(),
                strategy_code: r.strategy_code.clone(),
                priority: r.priority,
                status: QueueEntryStatus::Running,
                position: 0,
                universe_size: r.universe_size,
                enqueued_at: r.enqueued_at,
                started_at: Some(r.started_at),
                estimated_start: None,
            })
            .collect();
        running.sort_by_key(|e| e.started_at);

        let mut queued: Vec<&QueuedRun> = inner.queue.iter().collect();
        queued.sort_by(|a, b| b.cmp(a));

        let entries = queued.into_iter().enumerate().map(|(ahead, q)| {
            let (strategy_code, universe_size) = inner
                .pending
                .get(&q.run_id)
                .map(|p| (p.strategy_code.clone(), p.items.len()))
                .unwrap_or_default();
            let wait_ms = i64::try_from(running_count + ahead)
                .unwrap_or(i64::MAX)
                .saturating_mul(average_ms);
            let estimated_start = chrono::TimeDelta::try_milliseconds(wait_ms)
                .and_then(|wait| now.checked_add_signed(wait))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            QueueEntry {
                run_id: q.run_id.clone(),
                strategy_code,
                priority: q.priority,
                status: QueueEntryStatus::Queued,
                position: ahead + 1,
                universe_size,
                enqueued_at: q.enqueued_at,
                started_at: None,
                estimated_start: Some(estimated_start),
            }
        });

        running.extend(entries);
        running
    }

    /// Persisted run, if known
    pub async fn status(&self, run_id: &str) -> Result<Option<Run>, StateError> {
        debug!(%run_id, "Scheduler::status: called");
        self.shared.state.get_run(run_id).await
    }

    /// Results of a known run in sequence order
    pub async fn results(&self, run_id: &str, filter: ResultFilter) -> Result<Vec<ItemResult>, StateError> {
        debug!(%run_id, ?filter, "Scheduler::results: called");
        self.shared.state.get_run_required(run_id).await?;
        self.shared.state.get_item_results(run_id, filter).await
    }

    /// Most recent runs, optionally for one strategy
    pub async fn recent_runs(&self, limit: usize, strategy: Option<String>) -> Result<Vec<Run>, StateError> {
        debug!(limit, ?strategy, "Scheduler::recent_runs: called");
        self.shared.state.list_recent_runs(limit, strategy).await
    }

    /// Subscribe to a known run's progress
    ///
    /// A finished run whose history has been released yields a single
    /// terminal event built from its stored state.
    pub async fn subscribe(&self, run_id: &str) -> Result<Subscription, StateError> {
        debug!(%run_id, "Scheduler::subscribe: called");
        let run = self.shared.state.get_run_required(run_id).await?;
        if run.is_terminal() && !self.shared.broadcaster.has_history(run_id) {
            debug!(%run_id, status = %run.status, "Scheduler::subscribe: history released, synthesizing terminal event");
            return Ok(Subscription::from_events(run_id, vec![terminal_event(&run)]));
        }
        Ok(self.shared.broadcaster.subscribe(run_id))
    }

    /// Get the scheduler statistics
    pub async fn stats(&self) -> SchedulerStats {
        debug!("Scheduler::stats: called");
        self.shared.inner.lock().await.stats.clone()
    }

    pub async fn running_count(&self) -> usize {
        self.shared.inner.lock().await.running.len()
    }

    /// Stop promoting, cancel everything, and wait up to `timeout` for
    /// running workers to finish
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Scheduler shutting down");
        self.shared.shutdown.cancel();

        let (queued, running): (Vec<String>, Vec<String>) = {
            let inner = self.shared.inner.lock().await;
            (inner.pending.keys().cloned().collect(), inner.running.keys().cloned().collect())
        };
        for run_id in queued.iter().chain(running.iter()) {
            self.cancel(run_id).await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.running_count().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.running_count().await;
                warn!(remaining, "Scheduler::shutdown: workers still running at deadline");
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        info!("Scheduler stopped");
    }
}
