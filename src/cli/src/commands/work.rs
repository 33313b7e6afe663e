//! `conveyor work`: run consumers until the queues drain or a signal arrives.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use conveyor_core::jobs::{Worker, WorkerProcess};
use conveyor_core::telemetry::init_telemetry;

use crate::context::{Runtime, SettingsSources};
use crate::output;

#[derive(Args, Debug)]
pub struct WorkArgs {
    /// Connection name (the configured default when omitted)
    #[arg(long)]
    pub connection: Option<String>,

    /// Comma-separated queues, polled in order
    #[arg(long)]
    pub queues: Option<String>,

    /// Number of consumers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Handler timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Attempts per job
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Milliseconds between polling rounds
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Keep polling after the queues are empty
    #[arg(long)]
    pub keep_alive: bool,

    /// JSON file merged over the loaded settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also run the cron scheduler in this process
    #[arg(long)]
    pub with_scheduler: bool,
}

pub fn parse_queues(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn execute(args: WorkArgs, sources: SettingsSources) -> Result<()> {
    let queues = match args.queues.as_deref().map(parse_queues) {
        Some(queues) if !queues.is_empty() => queues,
        _ => {
            output::print_error("--queues is required (comma-separated queue names)");
            std::process::exit(1);
        }
    };

    let sources = SettingsSources {
        overlay: args.config.clone(),
        ..sources
    };
    let mut settings = sources.load()?;
    if let Some(workers) = args.workers {
        settings.worker.workers = workers;
    }
    if let Some(timeout) = args.timeout {
        settings.worker.timeout_secs = Some(timeout);
    }
    if let Some(max_attempts) = args.max_attempts {
        settings.worker.max_attempts = max_attempts;
    }
    if let Some(poll_interval) = args.poll_interval {
        settings.worker.poll_interval_ms = poll_interval;
    }
    settings.worker.keep_alive |= args.keep_alive;

    let telemetry = init_telemetry(&settings.telemetry()).context("Failed to initialize telemetry")?;
    let runtime = Runtime::open(settings).await?;
    let settings = &runtime.settings;

    let worker = Arc::new(Worker::new(settings.worker_config()));
    let mut builder = WorkerProcess::builder(runtime.manager.clone(), worker.clone())
        .config(settings.consumer_config(queues.clone(), args.connection.clone()))
        .workers(settings.worker.workers);
    if let Some(archive) = &runtime.archive {
        builder = builder.archive(archive.clone());
    }
    let process = builder.build();

    tracing::info!(
        queues = ?queues,
        connection = args.connection.as_deref().unwrap_or(runtime.manager.default_connection()),
        workers = process.consumer_count(),
        keep_alive = settings.worker.keep_alive,
        "Starting workers"
    );

    let scheduler_shutdown = CancellationToken::new();
    let scheduler_task = if args.with_scheduler {
        let scheduler = runtime.scheduler().await?;
        let token = scheduler_shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run(token).await }))
    } else {
        None
    };

    process.start();
    tokio::select! {
        _ = shutdown_signal() => process.shutdown().await,
        _ = process.finished() => {}
    }
    let handled = process.wait().await?;

    scheduler_shutdown.cancel();
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Scheduler task ended abnormally");
        }
    }

    tracing::info!(
        handled,
        succeeded = worker.stats().succeeded(),
        failed = worker.stats().failed(),
        retried = worker.stats().retried(),
        "Workers stopped"
    );
    telemetry.shutdown();
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queues() {
        assert_eq!(parse_queues("high, default,,low "), vec!["high", "default", "low"]);
        assert!(parse_queues(" , ").is_empty());
    }
}
