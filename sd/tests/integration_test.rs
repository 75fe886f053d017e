//! Integration tests for StratD
//!
//! These tests run a real daemon over an on-disk store and talk to it through
//! the IPC client.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stratd::config::Config;
use stratd::daemon::Daemon;
use stratd::domain::{Evaluation, Parameters, Priority, ResultFilter, Run, RunStatus};
use stratd::events::ProgressEventType;
use stratd::ipc::DaemonClient;
use stratd::scheduler::{QueueEntryStatus, RunRequest};
use stratd::state::{INTERRUPTED_MESSAGE, StateManager};
use stratd::strategy::{EvaluationError, ItemEvaluator, StrategyRegistry};
use tempfile::TempDir;

// =============================================================================
// Test evaluators
// =============================================================================

/// Each evaluation waits for a permit released by the test
struct Gated {
    gate: Semaphore,
}

impl Gated {
    fn new() -> Arc<Self> {
        Arc::new(Self { gate: Semaphore::new(0) })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl ItemEvaluator for Gated {
    async fn evaluate(&self, _item_key: &str, _parameters: &Parameters) -> Result<Evaluation, EvaluationError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| EvaluationError::Failed(e.to_string()))?;
        permit.forget();
        Ok(Evaluation {
            passed: true,
            ..Default::default()
        })
    }
}

/// Never finishes the listed items; fails the ones marked to fail
struct Scripted {
    hang: HashSet<&'static str>,
    fail: HashSet<&'static str>,
}

#[async_trait]
impl ItemEvaluator for Scripted {
    async fn evaluate(&self, item_key: &str, _parameters: &Parameters) -> Result<Evaluation, EvaluationError> {
        if self.hang.contains(item_key) {
            std::future::pending::<()>().await;
        }
        if self.fail.contains(item_key) {
            return Err(EvaluationError::Failed(format!("no data for {}", item_key)));
        }
        Ok(Evaluation {
            passed: true,
            score: Some(1.0),
            ..Default::default()
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct TestDaemon {
    client: DaemonClient,
    shutdown: CancellationToken,
    handle: JoinHandle<eyre::Result<()>>,
    gate: Arc<Gated>,
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.db_path = dir.join("stratd.db");
    config.ipc.socket_path = dir.join("stratd.sock");
    config.worker.grace_period_ms = 200;
    config
}

fn test_registry(gate: Arc<Gated>) -> StrategyRegistry {
    let mut registry = StrategyRegistry::with_builtins();
    registry.register("gated", gate);
    registry.register(
        "scripted",
        Arc::new(Scripted {
            hang: HashSet::from(["X"]),
            fail: HashSet::from(["I3"]),
        }),
    );
    registry
}

async fn start(config: Config) -> TestDaemon {
    let gate = Gated::new();
    let socket_path = config.ipc.socket_path.clone();
    let daemon = Daemon::new(config, test_registry(gate.clone())).await.unwrap();
    let shutdown = daemon.shutdown_token();
    let handle = tokio::spawn(async move { daemon.run().await });

    let client = DaemonClient::with_socket_path(socket_path);
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.ping().await.is_err() {
        assert!(Instant::now() < deadline, "daemon never came up");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    TestDaemon {
        client,
        shutdown,
        handle,
        gate,
    }
}

impl TestDaemon {
    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
    }

    async fn wait_for(&self, run_id: &str, status: RunStatus, within: Duration) -> Run {
        let deadline = Instant::now() + within;
        loop {
            let run = self.client.status(run_id).await.unwrap().expect("run exists");
            if run.status == status {
                return run;
            }
            assert!(
                Instant::now() < deadline,
                "run {} is {} after {:?}, wanted {}",
                run_id,
                run.status,
                within,
                status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test]
async fn test_queue_full_on_extra_submission() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(temp_dir.path());
    config.scheduler.max_concurrent = 1;
    config.scheduler.max_queue_size = 2;
    let daemon = start(config).await;

    // Occupies the only slot, so it never counts against the queue
    daemon.client.submit(RunRequest::new("gated", ["A"])).await.unwrap();
    daemon.client.submit(RunRequest::new("gated", ["B"])).await.unwrap();
    daemon.client.submit(RunRequest::new("gated", ["C"])).await.unwrap();
    let err = daemon
        .client
        .submit(RunRequest::new("gated", ["D"]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("queue_full"), "{}", err);

    assert_eq!(daemon.client.list_runs(10, None).await.unwrap().len(), 3);

    daemon.gate.release(3);
    daemon.stop().await;
}

#[tokio::test]
async fn test_single_slot_promotes_next_run_without_further_calls() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(temp_dir.path());
    config.scheduler.max_concurrent = 1;
    let daemon = start(config).await;

    // Back to back: A takes the free slot during its own submission
    let a = daemon.client.submit(RunRequest::new("gated", ["A1"])).await.unwrap();
    let b = daemon.client.submit(RunRequest::new("gated", ["B1"])).await.unwrap();

    let queue = daemon.client.queue().await.unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].run_id, a);
    assert_eq!(queue[0].status, QueueEntryStatus::Running);
    assert_eq!(queue[0].position, 0);
    assert_eq!(queue[1].run_id, b);
    assert_eq!(queue[1].status, QueueEntryStatus::Queued);
    assert_eq!(queue[1].position, 1);

    // A completes; B must start on its own
    daemon.gate.release(1);
    daemon.wait_for(&a, RunStatus::Completed, Duration::from_secs(2)).await;
    daemon.wait_for(&b, RunStatus::Running, Duration::from_secs(2)).await;

    daemon.gate.release(1);
    daemon.wait_for(&b, RunStatus::Completed, Duration::from_secs(2)).await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_high_priority_promoted_before_earlier_normal() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(temp_dir.path());
    config.scheduler.max_concurrent = 1;
    let daemon = start(config).await;

    let blocker = daemon.client.submit(RunRequest::new("gated", ["A"])).await.unwrap();
    daemon.wait_for(&blocker, RunStatus::Running, Duration::from_secs(2)).await;

    let normal = daemon.client.submit(RunRequest::new("gated", ["N"])).await.unwrap();
    let high = daemon
        .client
        .submit(RunRequest::new("gated", ["H"]).with_priority(Priority::High))
        .await
        .unwrap();

    daemon.gate.release(1);
    daemon.wait_for(&high, RunStatus::Running, Duration::from_secs(2)).await;
    let normal_run = daemon.client.status(&normal).await.unwrap().unwrap();
    assert_eq!(normal_run.status, RunStatus::Queued);

    daemon.gate.release(2);
    daemon.wait_for(&normal, RunStatus::Completed, Duration::from_secs(2)).await;
    daemon.stop().await;
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_queued_run_never_runs() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(temp_dir.path());
    config.scheduler.max_concurrent = 1;
    let daemon = start(config).await;

    let a = daemon.client.submit(RunRequest::new("gated", ["A"])).await.unwrap();
    daemon.wait_for(&a, RunStatus::Running, Duration::from_secs(2)).await;
    let b = daemon.client.submit(RunRequest::new("gated", ["B"])).await.unwrap();

    assert!(daemon.client.cancel(&b).await.unwrap());
    assert_eq!(
        daemon.client.status(&b).await.unwrap().unwrap().status,
        RunStatus::Cancelled
    );

    daemon.gate.release(1);
    daemon.wait_for(&a, RunStatus::Completed, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let b_run = daemon.client.status(&b).await.unwrap().unwrap();
    assert_eq!(b_run.status, RunStatus::Cancelled);
    assert!(b_run.started_at.is_none());
    daemon.stop().await;
}

#[tokio::test]
async fn test_cancel_running_run_with_stuck_item() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());
    let grace = config.worker.grace_period();
    let daemon = start(config).await;

    let run_id = daemon
        .client
        .submit(RunRequest::new("scripted", ["A", "X", "B"]))
        .await
        .unwrap();
    daemon.wait_for(&run_id, RunStatus::Running, Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(daemon.client.cancel(&run_id).await.unwrap());
    daemon
        .wait_for(&run_id, RunStatus::Cancelled, grace + Duration::from_secs(1))
        .await;

    let results = daemon.client.results(&run_id, ResultFilter::default()).await.unwrap();
    assert!(results.len() <= 2);
    assert!(results.iter().all(|r| r.item_key != "X"));

    // Stays cancelled
    tokio::time::sleep(grace).await;
    assert_eq!(
        daemon.client.status(&run_id).await.unwrap().unwrap().status,
        RunStatus::Cancelled
    );
    assert!(!daemon.client.cancel(&run_id).await.unwrap());
    daemon.stop().await;
}

// =============================================================================
// Results and progress
// =============================================================================

#[tokio::test]
async fn test_item_failure_is_isolated() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let daemon = start(test_config(temp_dir.path())).await;

    let run_id = daemon
        .client
        .submit(RunRequest::new("scripted", ["I1", "I2", "I3", "I4", "I5"]))
        .await
        .unwrap();
    let run = daemon.wait_for(&run_id, RunStatus::Completed, Duration::from_secs(2)).await;
    assert_eq!(run.processed_count, 5);

    let results = daemon.client.results(&run_id, ResultFilter::default()).await.unwrap();
    assert_eq!(results.len(), 5);
    let failed: Vec<_> = results.iter().filter(|r| r.error.is_some()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].item_key, "I3");
    assert!(!failed[0].passed);

    let errors_only = ResultFilter {
        errors_only: true,
        ..Default::default()
    };
    assert_eq!(daemon.client.results(&run_id, errors_only).await.unwrap().len(), 1);
    daemon.stop().await;
}

#[tokio::test]
async fn test_watch_sees_monotonic_progress_to_completion() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let daemon = start(test_config(temp_dir.path())).await;

    let items: Vec<String> = (0..30).map(|i| format!("T{:02}", i)).collect();
    let run_id = daemon.client.submit(RunRequest::new("gated", items)).await.unwrap();
    let mut events = daemon.client.subscribe(&run_id).await.unwrap();
    daemon.gate.release(30);

    let mut last = 0.0;
    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.next_event())
        .await
        .unwrap()
        .unwrap()
    {
        assert!(event.progress_percent >= last, "percent went backwards");
        last = event.progress_percent;
        if event.progress_percent == 100.0 {
            assert_eq!(event.event_type, ProgressEventType::Completed);
        }
        seen.push(event.event_type);
    }
    assert_eq!(seen.last(), Some(&ProgressEventType::Completed));
    assert_eq!(
        seen.iter().filter(|t| **t == ProgressEventType::OverallProgress).count(),
        3
    );
    daemon.stop().await;
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_restart_marks_interrupted_runs_as_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(temp_dir.path());

    // A previous process left one run Queued and one Running
    {
        let state = StateManager::spawn(&config.storage.db_path).unwrap();
        for (run_id, running) in [("left-queued", false), ("left-running", true)] {
            let run = Run::new(run_id, "pass_all", Parameters::new(), Priority::Normal, 3);
            state.create_run(run).await.unwrap();
            if running {
                state.mark_running(run_id).await.unwrap();
            }
        }
        state.shutdown().await.unwrap();
    }

    let daemon = start(config).await;
    for run_id in ["left-queued", "left-running"] {
        let run = daemon.client.status(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    }

    // New work still runs
    let run_id = daemon.client.submit(RunRequest::new("pass_all", ["A"])).await.unwrap();
    daemon.wait_for(&run_id, RunStatus::Completed, Duration::from_secs(2)).await;
    daemon.stop().await;
}
