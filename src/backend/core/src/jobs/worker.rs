//! Executes a single job with retries, backoff and an optional deadline.
//!
//! Each attempt races the handler against the timeout. A handler that misses
//! its deadline is abandoned, not cancelled: it keeps running on its own task
//! and whatever it returns is discarded. A failed attempt goes
//! through [`RetryPolicy::decide`]: either sleep the backoff delay and run
//! again, or give up, run the job's `failed` hook and the global failure
//! handler, and return the original error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::clock::{Sleeper, TokioSleeper};
use super::job::{Backoff, JobContext, JobError, JobResult, QueuedJob, RetryDecision, RetryPolicy};
use crate::telemetry::QueueMetrics;

/// Configuration for the job worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Attempts per job unless the job sets its own
    pub max_attempts: u32,
    /// Handler deadline unless the job sets its own
    pub timeout: Option<Duration>,
    /// Backoff unless the job sets its own
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: None,
            backoff: Backoff::default(),
        }
    }
}

/// Called once per job after its final attempt fails.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failure(&self, ctx: &JobContext, error: &JobError) -> JobResult;
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs handed to `process`
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    /// Attempts that were followed by a retry
    pub retried: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }
}

/// Runs jobs.
pub struct Worker {
    config: WorkerConfig,
    sleeper: Arc<dyn Sleeper>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            sleeper: Arc::new(TokioSleeper),
            failure_handler: None,
            stats: WorkerStats::new(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    /// Share counters with another worker.
    pub fn with_stats(mut self, stats: WorkerStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Retry policy in effect for `job`.
    pub fn policy_for(&self, job: &QueuedJob) -> RetryPolicy {
        RetryPolicy {
            max_attempts: job
                .options
                .max_attempts
                .unwrap_or(self.config.max_attempts)
                .max(1),
            backoff: job.options.backoff.unwrap_or(self.config.backoff),
        }
    }

    /// Run `job` until it succeeds or its attempts run out.
    ///
    /// `ctx` supplies the job id and queue; attempt fields are filled in here.
    /// `job.options.attempts` holds the number of attempts made on return.
    ///
    /// With a timeout in effect each attempt runs on a spawned task. A timed-out
    /// attempt fails with `JOB_TIMEOUT` while its handler keeps running
    /// detached, so the next attempt may overlap it.
    pub async fn process(&self, job: &mut QueuedJob, mut ctx: JobContext) -> JobResult {
        let policy = self.policy_for(job);
        let timeout = job.options.timeout.or(self.config.timeout);
        ctx.job_name = job.name().to_string();
        ctx.max_attempts = policy.max_attempts;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 1;
        loop {
            ctx.attempt = attempt;
            job.options.attempts = attempt;

            let error = match Self::run_attempt(job, &ctx, timeout).await {
                Ok(()) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(job_type = %ctx.job_name, attempt, "Job succeeded");
                    return Ok(());
                }
                Err(error) => error,
            };

            match policy.decide(attempt, &error) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        job_type = %ctx.job_name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job attempt failed, retrying"
                    );
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    QueueMetrics::retried(&ctx.job_name);
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    self.give_up(job, &ctx, &error).await;
                    return Err(error);
                }
            }
        }
    }

    async fn run_attempt(job: &QueuedJob, ctx: &JobContext, timeout: Option<Duration>) -> JobResult {
        let Some(limit) = timeout else {
            return job.job.handle(ctx).await;
        };

        let handler = job.job.clone();
        let attempt_ctx = ctx.clone();
        let task = tokio::spawn(async move { handler.handle(&attempt_ctx).await });
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(JobError::fatal(format!("Job handler panicked: {}", join_error))),
            Err(_) => {
                // dropping the JoinHandle detaches the task
                tracing::warn!(
                    job_type = %ctx.job_name,
                    attempt = ctx.attempt,
                    timeout_ms = limit.as_millis() as u64,
                    "Job attempt timed out, handler abandoned"
                );
                Err(JobError::timeout(limit))
            }
        }
    }

    async fn give_up(&self, job: &QueuedJob, ctx: &JobContext, error: &JobError) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            job_type = %ctx.job_name,
            attempts = ctx.attempt,
            retryable = error.retryable,
            error = %error,
            "Job failed permanently"
        );

        if let Err(hook_error) = job.job.failed(ctx, error).await {
            tracing::error!(job_type = %ctx.job_name, error = %hook_error, "Job failure hook failed");
        }
        if let Some(handler) = &self.failure_handler {
            if let Err(handler_error) = handler.on_failure(ctx, error).await {
                tracing::error!(job_type = %ctx.job_name, error = %handler_error, "Failure handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::RecordingSleeper;
    use crate::jobs::job::Job;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
        failed_hook: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl Job for Flaky {
        fn name(&self) -> &str {
            "Flaky"
        }

        async fn handle(&self, ctx: &JobContext) -> JobResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(call, ctx.attempt);
            if call >= self.succeed_on {
                Ok(())
            } else {
                Err(JobError::retryable(format!("attempt {} failed", call)))
            }
        }

        async fn failed(&self, _ctx: &JobContext, error: &JobError) -> JobResult {
            *self.failed_hook.lock() = Some(error.message.clone());
            Err(JobError::fatal("hook exploded"))
        }

        fn properties(&self) -> crate::error::Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }

    fn flaky(succeed_on: u32) -> (QueuedJob, Arc<AtomicU32>, Arc<Mutex<Option<String>>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let hook = Arc::new(Mutex::new(None));
        let job = QueuedJob::new(Flaky {
            calls: calls.clone(),
            succeed_on,
            failed_hook: hook.clone(),
        });
        (job, calls, hook)
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert!(config.timeout.is_none());
    }

    #[tokio::test]
    async fn test_succeeds_after_retry() {
        let sleeper = RecordingSleeper::new();
        let worker = Worker::new(WorkerConfig::default()).with_sleeper(Arc::new(sleeper.clone()));
        let (mut job, calls, hook) = flaky(2);

        worker.process(&mut job, JobContext::new("Flaky")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(job.options.attempts, 2);
        assert_eq!(sleeper.recorded(), vec![Duration::from_millis(1000)]);
        assert!(hook.lock().is_none());
        assert_eq!(worker.stats().succeeded(), 1);
    }

    #[tokio::test]
    async fn test_hook_error_does_not_mask_original() {
        let sleeper = RecordingSleeper::new();
        let worker = Worker::new(WorkerConfig::default()).with_sleeper(Arc::new(sleeper.clone()));
        let (mut job, calls, hook) = flaky(u32::MAX);

        let err = worker.process(&mut job, JobContext::new("Flaky")).await.unwrap_err();
        assert_eq!(err.message, "attempt 3 failed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(hook.lock().as_deref(), Some("attempt 3 failed"));
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert_eq!(worker.stats().failed(), 1);
        assert_eq!(worker.stats().retried(), 2);
    }

    #[tokio::test]
    async fn test_job_options_override_worker_defaults() {
        let sleeper = RecordingSleeper::new();
        let worker = Worker::new(WorkerConfig::default()).with_sleeper(Arc::new(sleeper.clone()));
        let (job, calls, _) = flaky(u32::MAX);
        let mut job = job.max_attempts(2).backoff(Backoff::new(10, 3.0));

        assert!(worker.process(&mut job, JobContext::new("Flaky")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sleeper.recorded(), vec![Duration::from_millis(10)]);
    }
}
