//! ExecutionWorker - drives one run's items through its evaluator
//!
//! Items are evaluated on a bounded pool of tasks. Completed items are
//! collected by the worker itself, which assigns sequence numbers in
//! completion order and performs every write for the run one at a time.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::config::WorkerConfig;
use super::control::RunControl;
use crate::domain::{Evaluation, ItemResult, Metrics, Parameters, RunFinalization, RunStatus};
use crate::events::{ProgressBroadcaster, ProgressEmitter};
use crate::state::StateManager;
use crate::strategy::{EvaluationError, ItemEvaluator};

/// Everything a worker needs to execute one run
pub struct RunJob {
    pub run_id: String,
    pub items: Vec<String>,
    pub parameters: Arc<Parameters>,
    pub evaluator: Arc<dyn ItemEvaluator>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        processed: usize,
        qualifying: usize,
        errors: usize,
        duration_ms: u64,
    },
    Cancelled {
        processed: usize,
        qualifying: usize,
    },
    Failed {
        message: String,
        processed: usize,
    },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Cancelled { .. } => RunStatus::Cancelled,
            Self::Failed { .. } => RunStatus::Error,
        }
    }

    pub fn processed(&self) -> usize {
        match self {
            Self::Completed { processed, .. } | Self::Cancelled { processed, .. } | Self::Failed { processed, .. } => {
                *processed
            }
        }
    }
}

type ItemOutput = (String, Result<Evaluation, EvaluationError>, u64);

#[derive(Debug, Default)]
struct Tally {
    processed: usize,
    qualifying: usize,
    errors: usize,
    next_sequence: u64,
}

impl Tally {
    fn counts(&self) -> (usize, usize) {
        (self.processed, self.qualifying)
    }
}

/// Executes runs; one call to [`ExecutionWorker::run`] per run
#[derive(Clone)]
pub struct ExecutionWorker {
    config: WorkerConfig,
    state: StateManager,
    broadcaster: Arc<ProgressBroadcaster>,
}

fn spawn_item(
    in_flight: &mut JoinSet<ItemOutput>,
    item_key: String,
    parameters: Arc<Parameters>,
    evaluator: Arc<dyn ItemEvaluator>,
) {
    in_flight.spawn(async move {
        let started = Instant::now();
        let evaluation = AssertUnwindSafe(evaluator.evaluate(&item_key, &parameters))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(EvaluationError::Failed("evaluator panicked".to_string())));
        (item_key, evaluation, started.elapsed().as_millis() as u64)
    });
}

impl ExecutionWorker {
    pub fn new(config: WorkerConfig, state: StateManager, broadcaster: Arc<ProgressBroadcaster>) -> Self {
        debug!(?config, "ExecutionWorker::new: called");
        Self {
            config,
            state,
            broadcaster,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Execute a run that the scheduler has already marked Running
    ///
    /// Item failures are recorded and never stop the run. A failure to
    /// persist is run-fatal. Once `control` is cancelled no new items are
    /// started; in-flight items get the grace period to finish, after which
    /// they are abandoned and left out of the results.
    pub async fn run(&self, job: RunJob, control: RunControl) -> RunOutcome {
        let RunJob {
            run_id,
            items,
            parameters,
            evaluator,
        } = job;
        let total = items.len();
        let pool = self.config.pool_size(total);
        let emitter = self.broadcaster.emitter_for(run_id.clone());
        let started = Instant::now();

        info!(%run_id, total, pool, "ExecutionWorker::run: starting");
        emitter.started(total);

        let mut pending = items.into_iter();
        let mut in_flight: JoinSet<ItemOutput> = JoinSet::new();
        let mut grace_deadline: Option<tokio::time::Instant> = None;
        let mut tally = Tally::default();
        let mut fatal: Option<String> = None;

        loop {
            while !control.is_cancelled() && in_flight.len() < pool {
                let Some(item_key) = pending.next() else {
                    break;
                };
                debug!(%run_id, %item_key, "ExecutionWorker::run: dispatching item");
                spawn_item(&mut in_flight, item_key, Arc::clone(&parameters), Arc::clone(&evaluator));
            }

            if in_flight.is_empty() {
                break;
            }

            let deadline = grace_deadline;
            let grace_expired = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = control.cancelled(), if grace_deadline.is_none() => {
                    info!(%run_id, in_flight = in_flight.len(), "ExecutionWorker::run: cancel received, draining in-flight items");
                    grace_deadline = Some(tokio::time::Instant::now() + self.config.grace_period());
                }
                _ = grace_expired => {
                    warn!(%run_id, abandoned = in_flight.len(), "ExecutionWorker::run: grace period expired");
                    in_flight.abort_all();
                    break;
                }
                joined = in_flight.join_next() => {
                    match joined {
                        Some(Ok(output)) => {
                            if let Err(message) = self.record(&run_id, output, total, &mut tally, &emitter).await {
                                error!(%run_id, %message, "ExecutionWorker::run: run-fatal error");
                                fatal = Some(message);
                                in_flight.abort_all();
                                break;
                            }
                        }
                        Some(Err(e)) => debug!(%run_id, error = %e, "ExecutionWorker::run: item task ended without output"),
                        None => {}
                    }
                }
            }
        }

        let cancel_requested = control.seal();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if cancel_requested {
            self.finish_cancelled(&run_id, total, tally, &emitter).await
        } else if let Some(message) = fatal {
            self.finish_failed(&run_id, message, total, tally, &emitter).await
        } else {
            self.finish_completed(&run_id, total, tally, elapsed_ms, &emitter).await
        }
    }

    /// Persist one finished item and emit its progress
    async fn record(
        &self,
        run_id: &str,
        output: ItemOutput,
        total: usize,
        tally: &mut Tally,
        emitter: &ProgressEmitter,
    ) -> Result<(), String> {
        let (item_key, evaluation, elapsed_ms) = output;
        tally.next_sequence += 1;
        let sequence = tally.next_sequence;

        let result = match evaluation {
            Ok(evaluation) => ItemResult::from_evaluation(run_id, &item_key, evaluation, sequence, elapsed_ms),
            Err(e) => {
                warn!(%run_id, %item_key, error = %e, "ExecutionWorker::record: item evaluation failed");
                ItemResult::from_error(run_id, &item_key, e.to_string(), sequence, elapsed_ms)
            }
        };

        let mut metrics = Metrics::new();
        metrics.insert("passed".to_string(), json!(result.passed));
        metrics.insert("sequence_number".to_string(), json!(sequence));
        metrics.insert("processing_time_ms".to_string(), json!(elapsed_ms));
        if let Some(score) = result.score {
            metrics.insert("score".to_string(), json!(score));
        }
        if let Some(ref err) = result.error {
            metrics.insert("error".to_string(), json!(err));
        }
        let passed = result.passed;
        let is_error = result.is_error();

        self.state
            .upsert_item_result(result)
            .await
            .map_err(|e| format!("Failed to persist result for {}: {}", item_key, e))?;

        tally.processed += 1;
        if passed {
            tally.qualifying += 1;
        }
        if is_error {
            tally.errors += 1;
        }
        emitter.item_progress(&item_key, tally.processed, total, metrics);

        if tally.processed % self.config.progress_interval() == 0 || tally.processed == total {
            emitter.overall_progress(tally.processed, total, tally.qualifying, tally.errors);
            self.state
                .update_run_progress(run_id, tally.processed, tally.qualifying)
                .await
                .map_err(|e| format!("Failed to persist progress: {}", e))?;
        }
        Ok(())
    }

    async fn finish_completed(
        &self,
        run_id: &str,
        total: usize,
        tally: Tally,
        elapsed_ms: u64,
        emitter: &ProgressEmitter,
    ) -> RunOutcome {
        match self
            .state
            .finalize_run(run_id, RunFinalization::completed(tally.processed, tally.qualifying))
            .await
        {
            Ok(run) => {
                let duration_ms = run.duration_ms.unwrap_or(elapsed_ms);
                info!(%run_id, processed = tally.processed, qualifying = tally.qualifying, errors = tally.errors, duration_ms, "ExecutionWorker: run completed");
                emitter.completed(total, tally.qualifying, tally.errors, duration_ms);
                RunOutcome::Completed {
                    processed: tally.processed,
                    qualifying: tally.qualifying,
                    errors: tally.errors,
                    duration_ms,
                }
            }
            Err(e) => {
                let message = format!("Failed to finalize run: {}", e);
                self.finish_failed(run_id, message, total, tally, emitter).await
            }
        }
    }

    async fn finish_cancelled(&self, run_id: &str, total: usize, tally: Tally, emitter: &ProgressEmitter) -> RunOutcome {
        match self
            .state
            .finalize_run(run_id, RunFinalization::cancelled(Some(tally.counts())))
            .await
        {
            Ok(_) => {
                info!(%run_id, processed = tally.processed, "ExecutionWorker: run cancelled");
                emitter.cancelled(tally.processed, total, tally.qualifying);
                RunOutcome::Cancelled {
                    processed: tally.processed,
                    qualifying: tally.qualifying,
                }
            }
            Err(e) => {
                let message = format!("Failed to finalize cancelled run: {}", e);
                error!(%run_id, %message, "ExecutionWorker: finalize failed");
                emitter.error(&message, tally.processed, total);
                RunOutcome::Failed {
                    message,
                    processed: tally.processed,
                }
            }
        }
    }

    async fn finish_failed(
        &self,
        run_id: &str,
        message: String,
        total: usize,
        tally: Tally,
        emitter: &ProgressEmitter,
    ) -> RunOutcome {
        if let Err(e) = self
            .state
            .finalize_run(run_id, RunFinalization::error(message.clone(), Some(tally.counts())))
            .await
        {
            error!(%run_id, error = %e, "ExecutionWorker: could not persist error status");
        }
        emitter.error(&message, tally.processed, total);
        RunOutcome::Failed {
            message,
            processed: tally.processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, ResultFilter, Run};
    use crate::events::ProgressEventType;
    use crate::strategy::testing::ScriptedEvaluator;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn setup(config: WorkerConfig) -> (ExecutionWorker, StateManager, Arc<ProgressBroadcaster>) {
        let state = StateManager::in_memory().unwrap();
        let broadcaster = Arc::new(ProgressBroadcaster::default());
        let worker = ExecutionWorker::new(config, state.clone(), Arc::clone(&broadcaster));
        (worker, state, broadcaster)
    }

    async fn start_run(state: &StateManager, run_id: &str, items: &[&str]) -> Vec<String> {
        let run = Run::new(run_id, "scripted", Parameters::new(), Priority::Normal, items.len());
        state.create_run(run).await.unwrap();
        state.mark_running(run_id).await.unwrap();
        items.iter().map(|s| s.to_string()).collect()
    }

    fn job(run_id: &str, items: Vec<String>, evaluator: Arc<ScriptedEvaluator>) -> RunJob {
        RunJob {
            run_id: run_id.to_string(),
            items,
            parameters: Arc::new(Parameters::new()),
            evaluator,
        }
    }

    #[tokio::test]
    async fn test_all_items_processed_with_unique_sequence() {
        let (worker, state, broadcaster) = setup(WorkerConfig {
            max_workers: 4,
            ..WorkerConfig::default()
        })
        .await;
        let keys: Vec<String> = (0..25).map(|i| format!("T{:02}", i)).collect();
        let refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        let items = start_run(&state, "r1", &refs).await;

        let evaluator = ScriptedEvaluator::new().with_delay(Duration::from_millis(1)).shared();
        let outcome = worker.run(job("r1", items, evaluator), RunControl::new()).await;
        assert_eq!(outcome.status(), RunStatus::Completed);
        assert_eq!(outcome.processed(), 25);

        let results = state.get_item_results("r1", ResultFilter::default()).await.unwrap();
        assert_eq!(results.len(), 25);
        let sequences: Vec<u64> = results.iter().map(|r| r.sequence_number).collect();
        assert_eq!(sequences, (1..=25).collect::<Vec<u64>>());

        let history = broadcaster.history("r1");
        let overall = history
            .iter()
            .filter(|e| e.event_type == ProgressEventType::OverallProgress)
            .count();
        assert_eq!(overall, 3);
        assert_eq!(history.last().map(|e| e.event_type), Some(ProgressEventType::Completed));

        let run = state.get_run_required("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.processed_count, 25);
        assert_eq!(run.qualifying_count, 25);
        assert!(run.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_item_failure_is_isolated() {
        let (worker, state, _broadcaster) = setup(WorkerConfig::default()).await;
        let items = start_run(&state, "r1", &["A", "B", "C", "D", "E"]).await;
        let evaluator = ScriptedEvaluator::new().failing("C").shared();

        let outcome = worker.run(job("r1", items, evaluator), RunControl::new()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Completed {
                processed: 5,
                qualifying: 4,
                errors: 1,
                ..
            }
        ));

        let results = state.get_item_results("r1", ResultFilter::default()).await.unwrap();
        assert_eq!(results.len(), 5);
        let failed: Vec<_> = results.iter().filter(|r| r.is_error()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item_key, "C");
        assert!(!failed[0].passed);
        assert_eq!(
            state.get_run_required("r1").await.unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_abandons_stuck_item_after_grace() {
        let (worker, state, broadcaster) = setup(WorkerConfig {
            grace_period_ms: 100,
            ..WorkerConfig::default()
        })
        .await;
        let items = start_run(&state, "r1", &["A", "X", "B"]).await;
        let evaluator = ScriptedEvaluator::new().hanging("X").shared();
        let control = RunControl::new();

        let run_worker = worker.clone();
        let run_control = control.clone();
        let handle = tokio::spawn(async move { run_worker.run(job("r1", items, evaluator), run_control).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(control.request_cancel());

        let started = Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.status(), RunStatus::Cancelled);

        let results = state.get_item_results("r1", ResultFilter::default()).await.unwrap();
        assert!(results.len() <= 2);
        assert!(results.iter().all(|r| r.item_key != "X"));
        assert_eq!(
            state.get_run_required("r1").await.unwrap().status,
            RunStatus::Cancelled
        );
        let last = broadcaster.history("r1").pop().unwrap();
        assert_eq!(last.event_type, ProgressEventType::Cancelled);
        assert!(!control.request_cancel());
    }

    #[tokio::test]
    async fn test_cancel_before_start_dispatches_nothing() {
        let (worker, state, _broadcaster) = setup(WorkerConfig::default()).await;
        let items = start_run(&state, "r1", &["A", "B"]).await;
        let evaluator = ScriptedEvaluator::new().shared();
        let control = RunControl::new();
        control.request_cancel();

        let outcome = worker.run(job("r1", items, Arc::clone(&evaluator)), control).await;
        assert_eq!(
            outcome,
            RunOutcome::Cancelled {
                processed: 0,
                qualifying: 0
            }
        );
        assert_eq!(evaluator.calls(), 0);
    }

    #[tokio::test]
    async fn test_pool_is_bounded() {
        let (worker, state, _broadcaster) = setup(WorkerConfig {
            max_workers: 2,
            grace_period_ms: 50,
            ..WorkerConfig::default()
        })
        .await;
        let items = start_run(&state, "r1", &["A", "B", "C", "D"]).await;
        let evaluator = ScriptedEvaluator::new()
            .hanging("A")
            .hanging("B")
            .hanging("C")
            .hanging("D")
            .shared();
        let control = RunControl::new();

        let run_worker = worker.clone();
        let run_control = control.clone();
        let run_evaluator = Arc::clone(&evaluator);
        let handle = tokio::spawn(async move { run_worker.run(job("r1", items, run_evaluator), run_control).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(evaluator.calls(), 2);
        control.request_cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status(), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_store_failure_is_run_fatal() {
        let (worker, state, broadcaster) = setup(WorkerConfig::default()).await;
        let items = start_run(&state, "r1", &["A", "B"]).await;
        state.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = worker.run(job("r1", items, ScriptedEvaluator::new().shared()), RunControl::new()).await;
        assert!(matches!(outcome, RunOutcome::Failed { processed: 0, .. }));
        let types: HashSet<_> = broadcaster.history("r1").iter().map(|e| e.event_type).collect();
        assert!(types.contains(&ProgressEventType::Error));
        assert!(!types.contains(&ProgressEventType::Completed));
    }
}
