//! StateManager - actor that owns the StratStore
//!
//! Processes commands via channels for thread-safe access to persistent state.
//! Every write goes through the single actor task, so writes for a run are
//! applied one at a time even while its items are evaluated concurrently.

use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{Filter, ItemResult, ResultFilter, Run, RunFinalization, RunStatus, Store};

use super::messages::{StateCommand, StateError, StateResponse};

/// Message on runs closed by startup recovery
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor over an on-disk store
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "StateManager::spawn: called");
        let mut store = Store::open(store_path.as_ref())?;

        let run_count = store.rebuild_indexes::<Run>()?;
        let result_count = store.rebuild_indexes::<ItemResult>()?;
        info!(run_count, result_count, "Rebuilt indexes for Run and ItemResult records");

        Ok(Self::start(store))
    }

    /// Spawn a StateManager over a throwaway in-memory store
    pub fn in_memory() -> eyre::Result<Self> {
        debug!("StateManager::in_memory: called");
        Ok(Self::start(Store::open_in_memory()?))
    }

    fn start(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Run operations ===

    /// Persist a new Run
    pub async fn create_run(&self, run: Run) -> StateResponse<String> {
        debug!(run_id = %run.run_id, strategy_code = %run.strategy_code, "create_run: called");
        self.request(|reply| StateCommand::CreateRun { run, reply }).await
    }

    /// Get a Run by ID
    pub async fn get_run(&self, run_id: &str) -> StateResponse<Option<Run>> {
        debug!(%run_id, "get_run: called");
        let run_id = run_id.to_string();
        self.request(|reply| StateCommand::GetRun { run_id, reply }).await
    }

    /// Get a Run by ID, returning error if not found
    pub async fn get_run_required(&self, run_id: &str) -> StateResponse<Run> {
        debug!(%run_id, "get_run_required: called");
        self.get_run(run_id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("Run {}", run_id)))
    }

    /// Queued -> Running
    pub async fn mark_running(&self, run_id: &str) -> StateResponse<Run> {
        debug!(%run_id, "mark_running: called");
        let run_id = run_id.to_string();
        self.request(|reply| StateCommand::MarkRunning { run_id, reply }).await
    }

    /// Record progress counters on a running Run
    pub async fn update_run_progress(&self, run_id: &str, processed: usize, qualifying: usize) -> StateResponse<()> {
        debug!(%run_id, processed, qualifying, "update_run_progress: called");
        let run_id = run_id.to_string();
        self.request(|reply| StateCommand::UpdateRunProgress {
            run_id,
            processed,
            qualifying,
            reply,
        })
        .await
    }

    /// Move a Run to its terminal status
    ///
    /// Fails with `InvalidTransition` if the Run is already terminal.
    pub async fn finalize_run(&self, run_id: &str, outcome: RunFinalization) -> StateResponse<Run> {
        debug!(%run_id, status = %outcome.status, "finalize_run: called");
        let run_id = run_id.to_string();
        self.request(|reply| StateCommand::FinalizeRun { run_id, outcome, reply })
            .await
    }

    /// Most recently submitted Runs first
    pub async fn list_recent_runs(&self, limit: usize, strategy: Option<String>) -> StateResponse<Vec<Run>> {
        debug!(limit, ?strategy, "list_recent_runs: called");
        self.request(|reply| StateCommand::ListRecentRuns { limit, strategy, reply })
            .await
    }

    // === ItemResult operations ===

    /// Insert or overwrite the result for `(run_id, item_key)`
    pub async fn upsert_item_result(&self, result: ItemResult) -> StateResponse<()> {
        debug!(run_id = %result.run_id, item_key = %result.item_key, seq = result.sequence_number, "upsert_item_result: called");
        self.request(|reply| StateCommand::UpsertItemResult { result, reply })
            .await
    }

    /// A run's results in sequence order
    pub async fn get_item_results(&self, run_id: &str, filter: ResultFilter) -> StateResponse<Vec<ItemResult>> {
        debug!(%run_id, ?filter, "get_item_results: called");
        let run_id = run_id.to_string();
        self.request(|reply| StateCommand::GetItemResults { run_id, filter, reply })
            .await
    }

    // === Recovery ===

    /// Close out runs a previous process left Queued or Running
    pub async fn recover_interrupted(&self) -> StateResponse<Vec<Run>> {
        debug!("recover_interrupted: called");
        self.request(|reply| StateCommand::RecoverInterrupted { reply }).await
    }

    /// Shutdown the StateManager
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

fn load_run(store: &Store, run_id: &str) -> StateResponse<Run> {
    store
        .get::<Run>(run_id)?
        .ok_or_else(|| StateError::NotFound(format!("Run {}", run_id)))
}

fn mark_running(store: &mut Store, run_id: &str) -> StateResponse<Run> {
    let mut run = load_run(store, run_id)?;
    run.mark_running()?;
    store.update(run.clone())?;
    Ok(run)
}

fn update_progress(store: &mut Store, run_id: &str, processed: usize, qualifying: usize) -> StateResponse<()> {
    let mut run = load_run(store, run_id)?;
    run.record_progress(processed, qualifying)?;
    store.update(run)?;
    Ok(())
}

fn finalize(store: &mut Store, run_id: &str, outcome: &RunFinalization) -> StateResponse<Run> {
    let mut run = load_run(store, run_id)?;
    run.finalize(outcome)?;
    store.update(run.clone())?;
    Ok(run)
}

fn list_recent(store: &Store, limit: usize, strategy: Option<String>) -> StateResponse<Vec<Run>> {
    let mut filters = Vec::new();
    if let Some(strategy) = strategy {
        debug!(%strategy, "actor_loop: ListRecentRuns adding strategy filter");
        filters.push(Filter::eq("strategy_code", strategy));
    }
    let mut runs: Vec<Run> = store.list(&filters)?;
    runs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    runs.truncate(limit);
    Ok(runs)
}

fn item_results(store: &Store, run_id: &str, filter: &ResultFilter) -> StateResponse<Vec<ItemResult>> {
    let mut results: Vec<ItemResult> = store.list(&filter.to_store_filters(run_id))?;
    results.sort_by_key(|r| r.sequence_number);
    if let Some(limit) = filter.limit {
        results.truncate(limit);
    }
    Ok(results)
}

fn recover(store: &mut Store) -> StateResponse<Vec<Run>> {
    let mut recovered = Vec::new();
    for status in [RunStatus::Queued, RunStatus::Running] {
        let runs: Vec<Run> = store.list(&[Filter::eq("status", status.to_string())])?;
        for mut run in runs {
            let counts = Some((run.processed_count, run.qualifying_count));
            run.finalize(&RunFinalization::error(INTERRUPTED_MESSAGE, counts))?;
            warn!(run_id = %run.run_id, was = %status, "Recovered interrupted run as error");
            store.update(run.clone())?;
            recovered.push(run);
        }
    }
    Ok(recovered)
}

/// Actor loop that processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateRun { run, reply } => {
                debug!(run_id = %run.run_id, "actor_loop: CreateRun command");
                let result = store.create(run).map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::GetRun { run_id, reply } => {
                debug!(%run_id, "actor_loop: GetRun command");
                let result = store.get::<Run>(&run_id).map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::MarkRunning { run_id, reply } => {
                debug!(%run_id, "actor_loop: MarkRunning command");
                let _ = reply.send(mark_running(&mut store, &run_id));
            }

            StateCommand::UpdateRunProgress {
                run_id,
                processed,
                qualifying,
                reply,
            } => {
                debug!(%run_id, processed, qualifying, "actor_loop: UpdateRunProgress command");
                let _ = reply.send(update_progress(&mut store, &run_id, processed, qualifying));
            }

            StateCommand::FinalizeRun { run_id, outcome, reply } => {
                debug!(%run_id, status = %outcome.status, "actor_loop: FinalizeRun command");
                let _ = reply.send(finalize(&mut store, &run_id, &outcome));
            }

            StateCommand::ListRecentRuns { limit, strategy, reply } => {
                debug!(limit, ?strategy, "actor_loop: ListRecentRuns command");
                let _ = reply.send(list_recent(&store, limit, strategy));
            }

            StateCommand::UpsertItemResult { result, reply } => {
                debug!(id = %result.id, "actor_loop: UpsertItemResult command");
                let result = store.upsert(result).map(|_| ()).map_err(StateError::from);
                let _ = reply.send(result);
            }

            StateCommand::GetItemResults { run_id, filter, reply } => {
                debug!(%run_id, "actor_loop: GetItemResults command");
                let _ = reply.send(item_results(&store, &run_id, &filter));
            }

            StateCommand::RecoverInterrupted { reply } => {
                debug!("actor_loop: RecoverInterrupted command");
                let _ = reply.send(recover(&mut store));
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
