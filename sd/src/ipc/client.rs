//! IPC client for communicating with the daemon
//!
//! Provides a simple interface for the CLI to send requests to the daemon
//! via Unix Domain Socket.

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use super::default_socket_path;
use super::listener::MAX_MESSAGE_SIZE;
use super::messages::{DaemonMessage, DaemonResponse, StrategyInfo};
use crate::domain::{ItemResult, ResultFilter, Run};
use crate::events::ProgressEvent;
use crate::scheduler::{QueueEntry, RunRequest, SchedulerStats};

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn unexpected(response: DaemonResponse) -> eyre::Report {
    match response {
        DaemonResponse::Error { message } => eyre::eyre!("Daemon error: {}", message),
        DaemonResponse::NotFound { run_id } => eyre::eyre!("Run not found: {}", run_id),
        other => eyre::eyre!("Unexpected response: {:?}", other),
    }
}

/// Client for communicating with the daemon via IPC
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(default_socket_path())
    }

    /// Create a client with a custom socket path
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Submit a run, returning its id
    ///
    /// Rejections come back as errors carrying the submit error code.
    pub async fn submit(&self, request: RunRequest) -> Result<String> {
        debug!(strategy_code = %request.strategy_code, items = request.items.len(), "DaemonClient: submitting run");
        match self.send_message(request.into()).await? {
            DaemonResponse::Submitted { run_id } => Ok(run_id),
            DaemonResponse::Rejected { code, message } => Err(eyre::eyre!("Submission rejected ({}): {}", code, message)),
            other => Err(unexpected(other)),
        }
    }

    /// Persisted state of a run, `None` if unknown
    pub async fn status(&self, run_id: &str) -> Result<Option<Run>> {
        debug!(%run_id, "DaemonClient: getting status");
        let msg = DaemonMessage::GetStatus {
            run_id: run_id.to_string(),
        };
        match self.send_message(msg).await? {
            DaemonResponse::Status { run } => Ok(Some(run)),
            DaemonResponse::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    /// Request cancellation; `false` if the run was already terminal or unknown
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        debug!(%run_id, "DaemonClient: cancelling run");
        let msg = DaemonMessage::Cancel {
            run_id: run_id.to_string(),
        };
        match self.send_message(msg).await? {
            DaemonResponse::CancelResult { accepted, .. } => Ok(accepted),
            other => Err(unexpected(other)),
        }
    }

    pub async fn queue(&self) -> Result<Vec<QueueEntry>> {
        debug!("DaemonClient: getting queue");
        match self.send_message(DaemonMessage::GetQueue).await? {
            DaemonResponse::Queue { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn results(&self, run_id: &str, filter: ResultFilter) -> Result<Vec<ItemResult>> {
        debug!(%run_id, ?filter, "DaemonClient: getting results");
        let msg = DaemonMessage::GetResults {
            run_id: run_id.to_string(),
            filter,
        };
        match self.send_message(msg).await? {
            DaemonResponse::Results { results, .. } => Ok(results),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_runs(&self, limit: usize, strategy: Option<String>) -> Result<Vec<Run>> {
        debug!(limit, ?strategy, "DaemonClient: listing runs");
        match self.send_message(DaemonMessage::ListRuns { limit, strategy }).await? {
            DaemonResponse::Runs { runs } => Ok(runs),
            other => Err(unexpected(other)),
        }
    }

    pub async fn strategies(&self) -> Result<Vec<StrategyInfo>> {
        debug!("DaemonClient: listing strategies");
        match self.send_message(DaemonMessage::ListStrategies).await? {
            DaemonResponse::Strategies { strategies } => Ok(strategies),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        debug!("DaemonClient: getting stats");
        match self.send_message(DaemonMessage::GetStats).await? {
            DaemonResponse::Stats { stats } => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Check if daemon is alive and get its version
    pub async fn ping(&self) -> Result<String> {
        debug!("DaemonClient: pinging daemon");
        match self.send_message(DaemonMessage::Ping).await? {
            DaemonResponse::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon to shutdown gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("DaemonClient: requesting daemon shutdown");
        match self.send_message(DaemonMessage::Shutdown).await? {
            DaemonResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Open a progress stream for a run
    ///
    /// Fails if the run is unknown. The stream has no read timeout; the
    /// daemon sends heartbeats while a run is quiet.
    pub async fn subscribe(&self, run_id: &str) -> Result<EventStream> {
        debug!(%run_id, "DaemonClient: subscribing");
        let msg = DaemonMessage::Subscribe {
            run_id: run_id.to_string(),
        };
        let mut stream = self.connect().await?;
        self.write_message(&mut stream, &msg).await?;

        let mut events = EventStream {
            reader: BufReader::new(stream),
            pending: None,
            done: false,
        };
        // The first line tells us whether the subscription was accepted
        match events.read_response().await? {
            Some(DaemonResponse::Event { event }) => {
                events.pending = Some(event);
                Ok(events)
            }
            Some(other) => Err(unexpected(other)),
            None => Err(eyre::eyre!("Daemon closed the subscription immediately")),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")
    }

    async fn write_message(&self, stream: &mut UnixStream, msg: &DaemonMessage) -> Result<()> {
        let msg_json = serde_json::to_string(msg).context("Failed to serialize message")?;

        if msg_json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Message too large: {} bytes", msg_json.len()));
        }

        tokio::time::timeout(self.timeout, async {
            stream
                .write_all(msg_json.as_bytes())
                .await
                .context("Failed to write message")?;
            stream.write_all(b"\n").await.context("Failed to write newline")?;
            stream.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")?
    }

    /// Send a message to the daemon and wait for response
    async fn send_message(&self, msg: DaemonMessage) -> Result<DaemonResponse> {
        debug!(?self.socket_path, "DaemonClient: sending message");
        let mut stream = self.connect().await?;
        self.write_message(&mut stream, &msg).await?;

        let mut reader = BufReader::new(&mut stream);
        let mut response_line = String::new();

        tokio::time::timeout(self.timeout, reader.read_line(&mut response_line))
            .await
            .context("Read timeout")?
            .context("Failed to read response")?;

        let response: DaemonResponse =
            serde_json::from_str(response_line.trim()).context("Failed to parse daemon response")?;

        debug!("DaemonClient: received response");
        Ok(response)
    }
}

/// Progress events of one subscription, in arrival order
pub struct EventStream {
    reader: BufReader<UnixStream>,
    pending: Option<ProgressEvent>,
    done: bool,
}

impl EventStream {
    async fn read_response(&mut self) -> Result<Option<DaemonResponse>> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .context("Failed to read event")?;
        if bytes_read == 0 {
            return Ok(None);
        }
        let response = serde_json::from_str(line.trim()).context("Failed to parse event")?;
        Ok(Some(response))
    }

    /// Next event, or `None` after the terminal event or when the daemon
    /// closes the stream
    pub async fn next_event(&mut self) -> Result<Option<ProgressEvent>> {
        if self.done {
            return Ok(None);
        }
        let event = match self.pending.take() {
            Some(event) => event,
            None => match self.read_response().await? {
                Some(DaemonResponse::Event { event }) => event,
                Some(other) => return Err(unexpected(other)),
                None => {
                    self.done = true;
                    return Ok(None);
                }
            },
        };
        if event.is_terminal() {
            self.done = true;
        }
        Ok(Some(event))
    }
}
