//! Polling consumer.
//!
//! One round pops at most one payload from each configured queue, in order,
//! and runs it to completion before moving on. Between rounds the consumer
//! sleeps for the poll interval; `stop` interrupts that sleep but never a
//! running job.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};
use super::job::JobContext;
use super::payload::Payload;
use super::worker::Worker;
use crate::archive::{Archive, ArchiveStatus};
use crate::drivers::Driver;
use crate::error::{QueueError, Result};
use crate::manager::QueueManager;
use crate::telemetry::{JobTimer, QueueMetrics};

/// Configuration for a consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queues polled in order each round
    pub queues: Vec<String>,
    /// Connection to poll (the manager default when unset)
    pub connection: Option<String>,
    pub poll_interval: Duration,
    /// Keep polling after a round finds no work
    pub keep_alive: bool,
    /// Identifier used in logs
    pub name: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queues: vec![crate::manager::DEFAULT_QUEUE.to_string()],
            connection: None,
            poll_interval: Duration::from_millis(1000),
            keep_alive: false,
            name: "consumer-0".to_string(),
        }
    }
}

/// Pops payloads and hands them to a [`Worker`].
pub struct Consumer {
    manager: Arc<QueueManager>,
    worker: Arc<Worker>,
    config: ConsumerConfig,
    archive: Option<Arc<dyn Archive>>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    running: watch::Sender<bool>,
}

impl Consumer {
    pub fn new(manager: Arc<QueueManager>, worker: Arc<Worker>, config: ConsumerConfig) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            manager,
            worker,
            config,
            archive: None,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            running,
        }
    }

    pub fn with_archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Run rounds until stopped, or until an empty round when `keep_alive`
    /// is off. Returns the number of payloads handled.
    ///
    /// Push-only drivers are rejected up front; consume those through
    /// their subscription instead.
    pub async fn run(&self) -> Result<u64> {
        let driver = self.manager.connection(self.config.connection.as_deref())?;
        if !driver.supports_pop() {
            return Err(QueueError::unsupported(driver.name(), "pop"));
        }
        self.running.send_replace(true);
        tracing::info!(
            consumer = %self.config.name,
            driver = driver.name(),
            queues = ?self.config.queues,
            keep_alive = self.config.keep_alive,
            "Consumer started"
        );

        let mut handled = 0u64;
        while !self.shutdown.is_cancelled() {
            let mut worked = false;
            for queue in &self.config.queues {
                match self.poll_queue(driver.as_ref(), queue).await {
                    Ok(true) => {
                        worked = true;
                        handled += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            consumer = %self.config.name,
                            queue = %queue,
                            error = %e,
                            "Poll failed"
                        );
                    }
                }
            }

            if !worked && !self.config.keep_alive {
                break;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.running.send_replace(false);
        tracing::info!(consumer = %self.config.name, handled, "Consumer stopped");
        Ok(handled)
    }

    /// Ask the loop to exit and wait for the in-flight round to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let mut running = self.running.subscribe();
        // sender lives in self, so this only ends once the flag clears
        let _ = running.wait_for(|r| !*r).await;
    }

    /// Returns whether a payload was handled.
    async fn poll_queue(&self, driver: &dyn Driver, queue: &str) -> Result<bool> {
        if let Some(limited) = driver.as_rate_limited() {
            if let Some(limit) = limited.rate_limit() {
                let status = limited.hit(queue, limit).await?;
                if !status.allowed {
                    tracing::debug!(queue = %queue, count = status.count, limit = status.limit, "Rate limited");
                    return Ok(false);
                }
            }
        }

        let Some(payload) = driver.pop(queue).await? else {
            return Ok(false);
        };
        QueueMetrics::popped(driver.name(), queue);
        self.handle(driver, queue, payload).await;
        Ok(true)
    }

    async fn handle(&self, driver: &dyn Driver, queue: &str, mut payload: Payload) {
        let mut job = match self.manager.deserialize(&payload) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    job_id = %payload.id,
                    error = %e,
                    "Dropping payload that cannot be deserialized"
                );
                payload.mark_failed(e.user_message(), self.clock.now_ms());
                self.fail(driver, queue, &payload).await;
                return;
            }
        };

        let ctx = JobContext {
            job_id: Some(payload.id),
            job_name: job.name().to_string(),
            queue: Some(queue.to_string()),
            attempt: 1,
            max_attempts: 1,
        };
        let timer = JobTimer::start();

        match self.worker.process(&mut job, ctx).await {
            Ok(()) => {
                payload.attempts = job.options.attempts;
                if let Err(e) = driver.complete(queue, &payload).await {
                    tracing::error!(queue = %queue, job_id = %payload.id, error = %e, "Completion failed");
                }
                QueueMetrics::completed(queue, job.name(), timer.elapsed_seconds());
                self.record(queue, &payload, ArchiveStatus::Completed).await;
            }
            Err(error) => {
                payload.attempts = job.options.attempts;
                payload.mark_failed(error.to_string(), self.clock.now_ms());
                QueueMetrics::failed(queue, job.name(), timer.elapsed_seconds());
                self.fail(driver, queue, &payload).await;
            }
        }
    }

    async fn fail(&self, driver: &dyn Driver, queue: &str, payload: &Payload) {
        match driver.fail(queue, payload).await {
            Ok(()) => QueueMetrics::dead_lettered(driver.name(), queue),
            Err(e) => {
                tracing::error!(queue = %queue, job_id = %payload.id, error = %e, "Failure path failed");
            }
        }
        self.record(queue, payload, ArchiveStatus::Failed).await;
    }

    async fn record(&self, queue: &str, payload: &Payload, status: ArchiveStatus) {
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.archive(queue, payload, status).await {
                tracing::warn!(queue = %queue, job_id = %payload.id, error = %e, "Archive write failed");
            }
        }
    }
}
