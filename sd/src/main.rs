//! StratD - strategy run scheduler
//!
//! CLI entry point: runs the daemon or talks to it over IPC.

use std::fs;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use stratd::cli::{Cli, Command, OutputFormat, get_log_path, parse_param};
use stratd::config::Config;
use stratd::daemon::Daemon;
use stratd::domain::{Parameters, Priority, ResultFilter, Run, RunStatus};
use stratd::events::{ProgressEvent, ProgressEventType};
use stratd::ipc::DaemonClient;
use stratd::scheduler::{QueueEntryStatus, RunRequest};
use stratd::strategy::StrategyRegistry;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let client = DaemonClient::with_socket_path(config.ipc.socket_path.clone());

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Daemon => cmd_daemon(config).await,
        Command::Submit {
            strategy,
            items,
            priority,
            params,
            watch,
        } => cmd_submit(&client, strategy, items, priority, &params, watch).await,
        Command::Status { run_id, format } => cmd_status(&client, &run_id, format).await,
        Command::Cancel { run_id } => cmd_cancel(&client, &run_id).await,
        Command::Queue { format } => cmd_queue(&client, format).await,
        Command::Watch { run_id, heartbeats } => cmd_watch(&client, &run_id, heartbeats).await,
        Command::Results {
            run_id,
            passed,
            failed,
            classification,
            min_score,
            errors,
            limit,
            format,
        } => {
            let filter = ResultFilter {
                passed: match (passed, failed) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                classification,
                min_score,
                errors_only: errors,
                limit,
            };
            cmd_results(&client, &run_id, filter, format).await
        }
        Command::Runs {
            limit,
            strategy,
            format,
        } => cmd_runs(&client, limit, strategy, format).await,
        Command::Strategies => cmd_strategies(&client).await,
        Command::Stats => cmd_stats(&client).await,
        Command::Ping => cmd_ping(&client).await,
        Command::Shutdown => cmd_shutdown(&client).await,
    }
}

/// Run the daemon until SIGINT/SIGTERM or an IPC shutdown request
async fn cmd_daemon(config: Config) -> Result<()> {
    debug!("cmd_daemon: called");
    let socket_path = config.ipc.socket_path.clone();
    let daemon = Daemon::new(config, StrategyRegistry::with_builtins()).await?;
    let shutdown = daemon.shutdown_token();

    println!("StratD listening on {}", socket_path.display());
    info!("Daemon running. Press Ctrl+C to stop.");

    let signals = tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Failed to listen for signals");
            return;
        }
        shutdown.cancel();
    });

    let result = daemon.run().await;
    signals.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => tracing::warn!("SIGINT received"),
        _ = sigterm.recv() => tracing::warn!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn colored_status(status: RunStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Queued => text.normal(),
        RunStatus::Running => text.cyan(),
        RunStatus::Completed => text.green(),
        RunStatus::Cancelled => text.yellow(),
        RunStatus::Error => text.red(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_submit(
    client: &DaemonClient,
    strategy: String,
    items: Vec<String>,
    priority: Option<Priority>,
    params: &[String],
    watch: bool,
) -> Result<()> {
    debug!(%strategy, items = items.len(), ?priority, "cmd_submit: called");
    let mut parameters = Parameters::new();
    for raw in params {
        let (key, value) = parse_param(raw).map_err(|e| eyre::eyre!(e))?;
        parameters.insert(key, value);
    }

    let mut request = RunRequest::new(strategy, items).with_parameters(parameters);
    if let Some(priority) = priority {
        request = request.with_priority(priority);
    }
    let run_id = client.submit(request).await?;
    println!("{}", run_id);

    if watch {
        cmd_watch(client, &run_id, false).await?;
    }
    Ok(())
}

fn print_run(run: &Run) {
    println!("Run:        {}", run.run_id.bold());
    println!("Strategy:   {}", run.strategy_code);
    println!("Status:     {}", colored_status(run.status));
    println!("Priority:   {}", run.priority);
    println!("Progress:   {}/{} ({} qualifying)", run.processed_count, run.universe_size, run.qualifying_count);
    println!("Submitted:  {}", run.submitted_at);
    if let Some(started_at) = run.started_at {
        println!("Started:    {}", started_at);
    }
    if let Some(completed_at) = run.completed_at {
        println!("Finished:   {}", completed_at);
    }
    if let Some(duration_ms) = run.duration_ms {
        println!("Duration:   {} ms", duration_ms);
    }
    if let Some(ref message) = run.error_message {
        println!("Error:      {}", message.red());
    }
}

async fn cmd_status(client: &DaemonClient, run_id: &str, format: OutputFormat) -> Result<()> {
    debug!(%run_id, "cmd_status: called");
    let Some(run) = client.status(run_id).await? else {
        return Err(eyre::eyre!("Run not found: {}", run_id));
    };
    match format {
        OutputFormat::Json => print_json(&run),
        OutputFormat::Text => {
            print_run(&run);
            Ok(())
        }
    }
}

async fn cmd_cancel(client: &DaemonClient, run_id: &str) -> Result<()> {
    debug!(%run_id, "cmd_cancel: called");
    if client.cancel(run_id).await? {
        println!("Cancel requested for {}", run_id);
    } else {
        println!("{} is not queued or running", run_id);
    }
    Ok(())
}

async fn cmd_queue(client: &DaemonClient, format: OutputFormat) -> Result<()> {
    debug!("cmd_queue: called");
    let entries = client.queue().await?;
    if let OutputFormat::Json = format {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    println!(
        "{:<4} {:<28} {:<16} {:<8} {:<8} {:>6}  ESTIMATED START",
        "POS", "RUN", "STRATEGY", "PRIORITY", "STATUS", "ITEMS"
    );
    for entry in entries {
        let status = match entry.status {
            QueueEntryStatus::Running => entry.status.to_string().cyan(),
            QueueEntryStatus::Queued => entry.status.to_string().normal(),
        };
        let estimate = entry
            .estimated_start
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<28} {:<16} {:<8} {:<8} {:>6}  {}",
            entry.position, entry.run_id, entry.strategy_code, entry.priority, status, entry.universe_size, estimate
        );
    }
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    let kind = match event.event_type {
        ProgressEventType::Completed => event.event_type.to_string().green(),
        ProgressEventType::Error => event.event_type.to_string().red(),
        ProgressEventType::Cancelled => event.event_type.to_string().yellow(),
        ProgressEventType::Heartbeat => event.event_type.to_string().dimmed(),
        _ => event.event_type.to_string().normal(),
    };
    println!(
        "{} {:>6.1}% {:<16} {}",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.progress_percent,
        kind,
        event.message
    );
}

async fn cmd_watch(client: &DaemonClient, run_id: &str, heartbeats: bool) -> Result<()> {
    debug!(%run_id, heartbeats, "cmd_watch: called");
    let mut events = client.subscribe(run_id).await?;
    while let Some(event) = events.next_event().await? {
        if event.is_heartbeat() && !heartbeats {
            continue;
        }
        print_event(&event);
    }
    Ok(())
}

async fn cmd_results(client: &DaemonClient, run_id: &str, filter: ResultFilter, format: OutputFormat) -> Result<()> {
    debug!(%run_id, ?filter, "cmd_results: called");
    let results = client.results(run_id, filter).await?;
    if let OutputFormat::Json = format {
        return print_json(&results);
    }
    println!("{:>5} {:<16} {:<6} {:>8} {:<12} NOTE", "SEQ", "ITEM", "PASS", "SCORE", "CLASS");
    for result in results {
        let pass = if result.passed { "yes".green() } else { "no".normal() };
        let score = result.score.map(|s| format!("{:.2}", s)).unwrap_or_else(|| "-".to_string());
        let note = match result.error {
            Some(ref error) => error.red().to_string(),
            None => result.reasons.join("; "),
        };
        println!(
            "{:>5} {:<16} {:<6} {:>8} {:<12} {}",
            result.sequence_number,
            result.item_key,
            pass,
            score,
            result.classification.as_deref().unwrap_or("-"),
            note
        );
    }
    Ok(())
}

async fn cmd_runs(client: &DaemonClient, limit: usize, strategy: Option<String>, format: OutputFormat) -> Result<()> {
    debug!(limit, ?strategy, "cmd_runs: called");
    let runs = client.list_runs(limit, strategy).await?;
    if let OutputFormat::Json = format {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs");
        return Ok(());
    }
    println!(
        "{:<28} {:<16} {:<10} {:>10} {:>10}  SUBMITTED",
        "RUN", "STRATEGY", "STATUS", "PROCESSED", "QUALIFYING"
    );
    for run in runs {
        println!(
            "{:<28} {:<16} {:<10} {:>10} {:>10}  {}",
            run.run_id,
            run.strategy_code,
            colored_status(run.status),
            format!("{}/{}", run.processed_count, run.universe_size),
            run.qualifying_count,
            run.submitted_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_strategies(client: &DaemonClient) -> Result<()> {
    debug!("cmd_strategies: called");
    for strategy in client.strategies().await? {
        println!("{:<16} {}", strategy.code.bold(), strategy.description);
    }
    Ok(())
}

async fn cmd_stats(client: &DaemonClient) -> Result<()> {
    debug!("cmd_stats: called");
    let stats = client.stats().await?;
    println!("Submitted:        {}", stats.total_submitted);
    println!("Rejected:         {}", stats.total_rejected);
    println!("Started:          {}", stats.total_started);
    println!("Completed:        {}", stats.total_completed);
    println!("Failed:           {}", stats.total_failed);
    println!("Cancelled:        {}", stats.total_cancelled);
    println!("Peak queue depth: {}", stats.peak_queue_depth);
    println!("Peak concurrency: {}", stats.peak_concurrent);
    if let Some(average) = stats.average_run_duration() {
        println!("Average run:      {} ms", average.as_millis());
    }
    Ok(())
}

async fn cmd_ping(client: &DaemonClient) -> Result<()> {
    debug!("cmd_ping: called");
    if !client.socket_exists() {
        println!("StratD is not running (no IPC socket)");
        return Ok(());
    }
    match client.ping().await {
        Ok(version) => {
            println!("Daemon is alive and responsive");
            println!("Version: {}", version);
        }
        Err(e) => {
            println!("IPC socket exists but the daemon is not responding");
            println!("Error: {}", e);
        }
    }
    Ok(())
}

async fn cmd_shutdown(client: &DaemonClient) -> Result<()> {
    debug!("cmd_shutdown: called");
    client.shutdown().await?;
    println!("Shutdown requested");
    Ok(())
}
