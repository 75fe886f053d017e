//! Daemon: wires the components together and serves IPC requests
//!
//! Every component is constructed once here; request handlers only ever see
//! clones of the same `Scheduler`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SubmitError;
use crate::events::ProgressBroadcaster;
use crate::ipc::{DaemonMessage, DaemonResponse, StrategyInfo, cleanup_socket, create_listener_at, read_message, send_response};
use crate::scheduler::{RunRequest, Scheduler};
use crate::state::{StateError, StateManager};
use crate::strategy::StrategyRegistry;

/// Extra time allowed past the worker grace period when stopping
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(2);

/// The running service
pub struct Daemon {
    config: Config,
    state: StateManager,
    scheduler: Scheduler,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Open the configured store and build the daemon
    pub async fn new(config: Config, registry: StrategyRegistry) -> Result<Self> {
        debug!(db_path = %config.storage.db_path.display(), "Daemon::new: called");
        let state = StateManager::spawn(&config.storage.db_path).context("Failed to open run store")?;
        Self::with_state(config, state, registry).await
    }

    /// Build the daemon over an existing state actor
    ///
    /// Runs left Queued or Running by a previous process are closed out as
    /// errors before anything new is accepted.
    pub async fn with_state(config: Config, state: StateManager, registry: StrategyRegistry) -> Result<Self> {
        debug!(strategies = ?registry.codes(), "Daemon::with_state: called");
        config.validate()?;

        let recovered = state
            .recover_interrupted()
            .await
            .context("Failed to recover interrupted runs")?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Marked interrupted runs as errored");
        }

        let broadcaster = Arc::new(ProgressBroadcaster::new(config.broadcast.clone()));
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            config.worker.clone(),
            state.clone(),
            broadcaster,
            registry,
        );

        Ok(Self {
            config,
            state,
            scheduler,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.config.ipc.socket_path
    }

    /// Token that stops [`Daemon::serve`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured socket and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let (listener, socket_path) = create_listener_at(&self.config.ipc.socket_path)?;
        info!(?socket_path, "IPC socket listening");
        let result = self.serve(listener).await;
        cleanup_socket(&socket_path);
        result
    }

    /// Serve IPC connections on `listener` until the shutdown token fires
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        debug!("Daemon::serve: called");
        let control_handle = self.scheduler.start();
        let sweep_handle = self.spawn_sweeper();
        info!("Daemon running");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            debug!("serve: IPC connection accepted");
                            let scheduler = self.scheduler.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, scheduler, shutdown).await {
                                    warn!(error = %e, "IPC connection error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "serve: IPC accept error"),
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!("serve: shutdown requested");
                    break;
                }
            }
        }

        info!("Daemon shutting down...");
        sweep_handle.abort();
        self.scheduler
            .shutdown(self.config.worker.grace_period() + SHUTDOWN_MARGIN)
            .await;
        if let Err(e) = control_handle.await {
            error!(error = %e, "Scheduler control loop panicked");
        }
        if let Err(e) = self.state.shutdown().await {
            warn!(error = %e, "StateManager already stopped");
        }
        info!("Daemon stopped");
        Ok(())
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self.scheduler.broadcaster());
        let period = self.config.broadcast.sweep_interval();
        let max_age = self.config.broadcast.history_max_age();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let evicted = broadcaster.sweep(max_age);
                if evicted > 0 {
                    info!(evicted, "Swept stale progress history");
                }
            }
        })
    }
}

fn submit_response(result: Result<String, SubmitError>) -> DaemonResponse {
    match result {
        Ok(run_id) => DaemonResponse::Submitted { run_id },
        Err(e) => DaemonResponse::Rejected {
            code: e.code().to_string(),
            message: e.to_string(),
        },
    }
}

fn state_error_response(run_id: String, error: StateError) -> DaemonResponse {
    match error {
        StateError::NotFound(_) => DaemonResponse::NotFound { run_id },
        other => DaemonResponse::Error {
            message: other.to_string(),
        },
    }
}

/// Handle one IPC connection: a request and its response or event stream
pub async fn handle_connection(mut stream: UnixStream, scheduler: Scheduler, shutdown: CancellationToken) -> Result<()> {
    let msg = read_message(&mut stream).await?;
    debug!(?msg, "handle_connection: received message");

    let response = match msg {
        DaemonMessage::Submit {
            strategy_code,
            items,
            parameters,
            priority,
        } => {
            let request = RunRequest {
                strategy_code,
                items,
                parameters,
                priority,
            };
            submit_response(scheduler.submit(request).await)
        }
        DaemonMessage::GetStatus { run_id } => match scheduler.status(&run_id).await {
            Ok(Some(run)) => DaemonResponse::Status { run },
            Ok(None) => DaemonResponse::NotFound { run_id },
            Err(e) => state_error_response(run_id, e),
        },
        DaemonMessage::Cancel { run_id } => {
            let accepted = scheduler.cancel(&run_id).await;
            DaemonResponse::CancelResult { run_id, accepted }
        }
        DaemonMessage::GetQueue => DaemonResponse::Queue {
            entries: scheduler.queue_status().await,
        },
        DaemonMessage::Subscribe { run_id } => {
            return stream_events(stream, &scheduler, run_id).await;
        }
        DaemonMessage::GetResults { run_id, filter } => match scheduler.results(&run_id, filter).await {
            Ok(results) => DaemonResponse::Results { run_id, results },
            Err(e) => state_error_response(run_id, e),
        },
        DaemonMessage::ListRuns { limit, strategy } => match scheduler.recent_runs(limit, strategy).await {
            Ok(runs) => DaemonResponse::Runs { runs },
            Err(e) => DaemonResponse::Error { message: e.to_string() },
        },
        DaemonMessage::ListStrategies => DaemonResponse::Strategies {
            strategies: scheduler
                .registry()
                .describe()
                .into_iter()
                .map(|(code, description)| StrategyInfo { code, description })
                .collect(),
        },
        DaemonMessage::GetStats => DaemonResponse::Stats {
            stats: scheduler.stats().await,
        },
        DaemonMessage::Ping => DaemonResponse::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        DaemonMessage::Shutdown => {
            info!("Shutdown requested via IPC");
            send_response(&mut stream, &DaemonResponse::Ok).await?;
            shutdown.cancel();
            return Ok(());
        }
    };

    send_response(&mut stream, &response).await
}

/// Forward a run's progress events until a terminal event or client disconnect
async fn stream_events(mut stream: UnixStream, scheduler: &Scheduler, run_id: String) -> Result<()> {
    debug!(%run_id, "stream_events: called");
    let mut subscription = match scheduler.subscribe(&run_id).await {
        Ok(subscription) => subscription,
        Err(e) => return send_response(&mut stream, &state_error_response(run_id, e)).await,
    };

    let (mut reader, mut writer) = stream.split();
    let mut probe = [0u8; 64];
    loop {
        tokio::select! {
            event = subscription.next_event() => {
                let Some(event) = event else {
                    break;
                };
                if let Err(e) = send_response(&mut writer, &DaemonResponse::Event { event }).await {
                    debug!(%run_id, error = %e, "stream_events: client went away");
                    break;
                }
            }
            read = reader.read(&mut probe) => {
                // Clients send nothing after the request; EOF or error means disconnect
                if matches!(read, Ok(0) | Err(_)) {
                    debug!(%run_id, "stream_events: client disconnected");
                    break;
                }
            }
        }
    }
    Ok(())
}
