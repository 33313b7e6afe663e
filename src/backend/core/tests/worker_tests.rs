//! Worker retry, backoff and timeout behavior.
//!
//! Tests cover:
//! - Attempt counting up to the configured cap
//! - Exponential backoff capped at the maximum delay
//! - Fatal errors skip remaining attempts
//! - Handler deadline under paused time
//! - Timed-out handlers abandoned rather than cancelled
//! - Failed hook and the global failure handler

use async_trait::async_trait;
use conveyor_core::jobs::{
    Backoff, FailureHandler, Job, JobContext, JobError, JobResult, QueuedJob, RecordingSleeper,
    Worker, WorkerConfig,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails with a retryable error every time.
struct AlwaysFails {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Job for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(JobError::retryable(format!("failure {}", call)))
    }

    fn properties(&self) -> conveyor_core::Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

struct Fatal {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Job for Fatal {
    fn name(&self) -> &str {
        "fatal"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(JobError::fatal("bad input"))
    }

    fn properties(&self) -> conveyor_core::Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

struct Sleepy {
    sleep: Duration,
}

#[async_trait]
impl Job for Sleepy {
    fn name(&self) -> &str {
        "sleepy"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        tokio::time::sleep(self.sleep).await;
        Ok(())
    }

    fn properties(&self) -> conveyor_core::Result<serde_json::Value> {
        Ok(serde_json::json!({ "sleepMs": self.sleep.as_millis() as u64 }))
    }
}

/// Sleeps, then records that it ran to the end.
struct SlowWriter {
    sleep: Duration,
    finished: Arc<AtomicU32>,
}

#[async_trait]
impl Job for SlowWriter {
    fn name(&self) -> &str {
        "slow_writer"
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        tokio::time::sleep(self.sleep).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn properties(&self) -> conveyor_core::Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(String, u32, String)>>,
}

#[async_trait]
impl FailureHandler for RecordingHandler {
    async fn on_failure(&self, ctx: &JobContext, error: &JobError) -> JobResult {
        self.seen
            .lock()
            .push((ctx.job_name.clone(), ctx.attempt, error.message.clone()));
        Ok(())
    }
}

fn worker(max_attempts: u32, sleeper: &RecordingSleeper) -> Worker {
    Worker::new(WorkerConfig {
        max_attempts,
        ..WorkerConfig::default()
    })
    .with_sleeper(Arc::new(sleeper.clone()))
}

// ============================================================================
// Retries and backoff
// ============================================================================

#[tokio::test]
async fn test_attempts_stop_at_cap() {
    let sleeper = RecordingSleeper::new();
    let worker = worker(3, &sleeper);
    let calls = Arc::new(AtomicU32::new(0));
    let mut job = QueuedJob::new(AlwaysFails { calls: calls.clone() });

    let err = worker.process(&mut job, JobContext::new("always_fails")).await.unwrap_err();
    assert_eq!(err.message, "failure 3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(job.options.attempts, 3);
    assert_eq!(
        sleeper.recorded(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
}

#[tokio::test]
async fn test_backoff_is_capped() {
    let sleeper = RecordingSleeper::new();
    let worker = worker(8, &sleeper);
    let mut job = QueuedJob::new(AlwaysFails {
        calls: Arc::new(AtomicU32::new(0)),
    });

    assert!(worker.process(&mut job, JobContext::new("always_fails")).await.is_err());
    let delays: Vec<u64> = sleeper.recorded().iter().map(|d| d.as_millis() as u64).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    assert_eq!(worker.stats().retried(), 7);
}

#[test]
fn test_backoff_delays() {
    let backoff = Backoff::default();
    assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
    assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
    assert_eq!(backoff.delay_for_attempt(6), Duration::from_millis(30000));
    assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_millis(30000));
}

#[tokio::test]
async fn test_fatal_error_skips_retries() {
    let sleeper = RecordingSleeper::new();
    let worker = worker(5, &sleeper);
    let calls = Arc::new(AtomicU32::new(0));
    let mut job = QueuedJob::new(Fatal { calls: calls.clone() });

    let err = worker.process(&mut job, JobContext::new("fatal")).await.unwrap_err();
    assert!(!err.retryable);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(sleeper.recorded().is_empty());
}

#[tokio::test]
async fn test_zero_max_attempts_still_runs_once() {
    let sleeper = RecordingSleeper::new();
    let worker = worker(0, &sleeper);
    let calls = Arc::new(AtomicU32::new(0));
    let mut job = QueuedJob::new(AlwaysFails { calls: calls.clone() });

    assert!(worker.process(&mut job, JobContext::new("always_fails")).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_attempt() {
    let sleeper = RecordingSleeper::new();
    let worker = Worker::new(WorkerConfig {
        max_attempts: 2,
        timeout: Some(Duration::from_secs(1)),
        ..WorkerConfig::default()
    })
    .with_sleeper(Arc::new(sleeper.clone()));
    let mut job = QueuedJob::new(Sleepy {
        sleep: Duration::from_secs(10),
    });

    let err = worker.process(&mut job, JobContext::new("sleepy")).await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("JOB_TIMEOUT"));
    assert!(err.retryable);
    // the timeout counted as an ordinary failed attempt
    assert_eq!(job.options.attempts, 2);
    assert_eq!(sleeper.recorded().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_job_timeout_overrides_worker() {
    let worker = Worker::new(WorkerConfig {
        max_attempts: 1,
        timeout: Some(Duration::from_millis(10)),
        ..WorkerConfig::default()
    });
    let mut job = QueuedJob::new(Sleepy {
        sleep: Duration::from_secs(2),
    })
    .timeout(Duration::from_secs(5));

    worker.process(&mut job, JobContext::new("sleepy")).await.unwrap();
    assert_eq!(worker.stats().succeeded(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_handler_is_abandoned() {
    let worker = Worker::new(WorkerConfig {
        max_attempts: 1,
        timeout: Some(Duration::from_secs(1)),
        ..WorkerConfig::default()
    });
    let finished = Arc::new(AtomicU32::new(0));
    let mut job = QueuedJob::new(SlowWriter {
        sleep: Duration::from_secs(5),
        finished: finished.clone(),
    });

    let err = worker.process(&mut job, JobContext::new("slow_writer")).await.unwrap_err();
    assert_eq!(err.code.as_deref(), Some("JOB_TIMEOUT"));
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    // the handler keeps running past the deadline; only its result is lost
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(worker.stats().failed(), 1);
    assert_eq!(worker.stats().succeeded(), 0);
}

// ============================================================================
// Failure handlers
// ============================================================================

#[tokio::test]
async fn test_global_failure_handler_runs_once() {
    let sleeper = RecordingSleeper::new();
    let handler = Arc::new(RecordingHandler::default());
    let worker = worker(2, &sleeper).with_failure_handler(handler.clone());
    let mut job = QueuedJob::new(AlwaysFails {
        calls: Arc::new(AtomicU32::new(0)),
    });

    assert!(worker.process(&mut job, JobContext::new("always_fails")).await.is_err());
    let seen = handler.seen.lock().clone();
    assert_eq!(seen, vec![("always_fails".to_string(), 2, "failure 2".to_string())]);
    assert_eq!(worker.stats().failed(), 1);
}

#[tokio::test]
async fn test_handler_not_called_on_success() {
    let handler = Arc::new(RecordingHandler::default());
    let worker = Worker::new(WorkerConfig::default()).with_failure_handler(handler.clone());
    let mut job = QueuedJob::new(Sleepy {
        sleep: Duration::ZERO,
    });

    worker.process(&mut job, JobContext::new("sleepy")).await.unwrap();
    assert!(handler.seen.lock().is_empty());
    assert_eq!(job.options.attempts, 1);
}
