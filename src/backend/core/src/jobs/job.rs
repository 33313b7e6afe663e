//! Job definitions and traits.
//!
//! This module provides the core abstractions for units of work:
//!
//! - **Job trait**: The handler contract every queued job implements
//! - **JobOptions**: Routing metadata (queue, connection, delay, priority, group, retries)
//! - **QueuedJob**: A handler paired with its routing metadata, ready to push
//! - **RetryPolicy**: Attempt accounting and capped exponential backoff

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier assigned to a payload when it is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| QueueError::deserialization(format!("Invalid job id '{}': {}", s, e)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs. Each level maps to one physical lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Drained after every other lane
    Low = 0,
    /// The unlabeled default lane
    #[default]
    Normal = 1,
    /// Probed after critical
    High = 2,
    /// Probed first
    Critical = 3,
}

impl JobPriority {
    /// Lanes in the order a pop probes them.
    pub const PROBE_ORDER: [JobPriority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Get the numeric score for this priority.
    pub fn score(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 100,
            Self::High => 200,
            Self::Critical => 300,
        }
    }

    /// Map a numeric priority onto the nearest lane at or below it.
    pub fn from_score(score: i64) -> Self {
        match score {
            s if s >= 300 => Self::Critical,
            s if s >= 200 => Self::High,
            s if s >= 100 => Self::Normal,
            _ => Self::Low,
        }
    }

    /// Suffix appended to the queue key for this lane; `None` is the default lane.
    pub fn lane_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Critical => Some("critical"),
            Self::High => Some("high"),
            Self::Normal => None,
            Self::Low => Some("low"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" | "default" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => other
                .parse::<i64>()
                .map(Self::from_score)
                .map_err(|_| QueueError::deserialization(format!("Unknown priority: {}", s))),
        }
    }
}

impl<'de> Deserialize<'de> for JobPriority {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Score(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Score(score) => Ok(Self::from_score(score)),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether another attempt may succeed
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// A timeout is retried exactly like any other handler failure.
    pub fn timeout(timeout: Duration) -> Self {
        Self::retryable(format!("Job timed out after {}ms", timeout.as_millis()))
            .with_code("JOB_TIMEOUT")
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<QueueError> for JobError {
    fn from(error: QueueError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Capped exponential backoff: `min(initial * multiplier^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// Delay after the first failed attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Growth factor per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 { 1000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30_000 }

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Backoff {
    pub fn new(initial_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            initial_delay_ms,
            multiplier,
            ..Self::default()
        }
    }

    /// Delay to wait after `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// What the worker does after an attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then run the next attempt
    Retry(Duration),
    /// No attempts remain (or the error is fatal)
    GiveUp,
}

/// Configuration for job retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff between attempts
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy that runs a job once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with a specific number of attempts.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Decide what follows a failed `attempt` (1-indexed).
    pub fn decide(&self, attempt: u32, error: &JobError) -> RetryDecision {
        if !error.retryable || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.backoff.delay_for_attempt(attempt))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Routing metadata carried alongside a job handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    /// Target queue (the connection's default queue when unset)
    pub queue: Option<String>,
    /// Target connection (the manager's default connection when unset)
    pub connection: Option<String>,
    /// Seconds to wait before the payload becomes visible
    pub delay_seconds: Option<u64>,
    /// Priority lane
    pub priority: Option<JobPriority>,
    /// Ordering domain for one-at-a-time delivery
    pub group_id: Option<String>,
    /// Retry backoff parameters
    pub backoff: Option<Backoff>,
    /// Attempts already made
    pub attempts: u32,
    /// Attempt cap (the worker default when unset)
    pub max_attempts: Option<u32>,
    /// Per-job handler deadline (the worker default when unset)
    pub timeout: Option<Duration>,
}

impl JobOptions {
    /// Fill unset fields from `defaults`.
    pub fn merged_over(mut self, defaults: &JobOptions) -> Self {
        self.queue = self.queue.or_else(|| defaults.queue.clone());
        self.connection = self.connection.or_else(|| defaults.connection.clone());
        self.delay_seconds = self.delay_seconds.or(defaults.delay_seconds);
        self.priority = self.priority.or(defaults.priority);
        self.group_id = self.group_id.or_else(|| defaults.group_id.clone());
        self.backoff = self.backoff.or(defaults.backoff);
        self.max_attempts = self.max_attempts.or(defaults.max_attempts);
        self.timeout = self.timeout.or(defaults.timeout);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to jobs during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Payload id, when the job came off a queue
    pub job_id: Option<JobId>,
    /// Job type name
    pub job_name: String,
    /// Queue the job was popped from
    pub queue: Option<String>,
    /// Current attempt (1-indexed)
    pub attempt: u32,
    /// Attempt cap in effect
    pub max_attempts: u32,
}

impl JobContext {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_id: None,
            job_name: job_name.into(),
            queue: None,
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Whether this is the final permitted attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    fn id_field(&self) -> String {
        self.job_id.map(|id| id.to_string()).unwrap_or_default()
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.id_field(),
            job_type = %self.job_name,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.id_field(),
            job_type = %self.job_name,
            attempt = self.attempt,
            message
        );
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.id_field(),
            job_type = %self.job_name,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The handler contract that all queued jobs implement.
#[async_trait]
pub trait Job: Send + Sync {
    /// Type name recorded in tagged payloads and used for registry lookup.
    fn name(&self) -> &str;

    /// Execute the job.
    ///
    /// Return `JobError::retryable()` for transient failures and
    /// `JobError::fatal()` for failures no further attempt can fix.
    async fn handle(&self, ctx: &JobContext) -> JobResult;

    /// Called once after the final attempt fails.
    ///
    /// An error returned here is logged and never replaces the handler's error.
    async fn failed(&self, _ctx: &JobContext, _error: &JobError) -> JobResult {
        Ok(())
    }

    /// Snapshot of the job's fields.
    fn properties(&self) -> Result<serde_json::Value>;

    /// Class-level routing defaults; per-instance options override these.
    fn default_options(&self) -> JobOptions {
        JobOptions::default()
    }
}

/// A job type the tagged serializer can reconstruct from its field snapshot.
pub trait JobType: Job + Serialize + DeserializeOwned + 'static {
    /// Stable type name; must equal what `Job::name` returns.
    const NAME: &'static str;
}

/// Field snapshot helper for `Job::properties` on serde types.
pub fn snapshot<T: Serialize>(job: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(job)?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queued Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A job handler paired with its routing metadata.
pub struct QueuedJob {
    /// The handler; shared so a timed-out attempt can outlive the worker's wait
    pub job: Arc<dyn Job>,
    /// Routing metadata
    pub options: JobOptions,
}

impl fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedJob")
            .field("job", &self.job.name())
            .field("options", &self.options)
            .finish()
    }
}

impl QueuedJob {
    /// Wrap a job, starting from its class-level defaults.
    pub fn new(job: impl Job + 'static) -> Self {
        let options = job.default_options();
        Self {
            job: Arc::new(job),
            options,
        }
    }

    pub fn from_boxed(job: Box<dyn Job>, options: JobOptions) -> Self {
        Self {
            job: Arc::from(job),
            options,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.options.queue = Some(queue.into());
        self
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.options.connection = Some(connection.into());
        self
    }

    pub fn delay(mut self, seconds: u64) -> Self {
        self.options.delay_seconds = Some(seconds);
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.options.priority = Some(priority);
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.options.group_id = Some(group_id.into());
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.options.backoff = Some(backoff);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.options.max_attempts = Some(max_attempts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        self.job.name()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
