//! Built-in maintenance jobs.
//!
//! These need live handles (the archive, the queue manager) that cannot
//! travel in a payload, so they are registered with constructors capturing
//! a shared [`BuiltinServices`]. The manager is bound after it is built,
//! since its serializer owns the registry these constructors live in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};

use super::job::{snapshot, Job, JobContext, JobError, JobResult};
use super::registry::JobRegistry;
use crate::archive::Archive;
use crate::error::Result;
use crate::manager::QueueManager;

/// Handles shared by the built-in jobs.
#[derive(Clone, Default)]
pub struct BuiltinServices {
    archive: Option<Arc<dyn Archive>>,
    manager: Arc<OnceLock<Weak<QueueManager>>>,
}

impl BuiltinServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Bind the manager. Only the first call takes effect.
    pub fn bind_manager(&self, manager: &Arc<QueueManager>) {
        let _ = self.manager.set(Arc::downgrade(manager));
    }

    fn manager(&self) -> std::result::Result<Arc<QueueManager>, JobError> {
        self.manager
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| JobError::fatal("queue manager is not available"))
    }

    fn archive(&self) -> std::result::Result<Arc<dyn Archive>, JobError> {
        self.archive
            .clone()
            .ok_or_else(|| JobError::fatal("no archive configured").with_code("ARCHIVE_DISABLED"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Archive cleanup
// ═══════════════════════════════════════════════════════════════════════════════

/// Prunes archive entries older than `olderThanDays`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveCleanupJob {
    #[serde(default = "default_older_than_days")]
    pub older_than_days: u32,
    #[serde(skip)]
    services: BuiltinServices,
}

fn default_older_than_days() -> u32 {
    30
}

impl ArchiveCleanupJob {
    pub const NAME: &'static str = "archive_cleanup";

    pub fn new(older_than_days: u32) -> Self {
        Self {
            older_than_days,
            services: BuiltinServices::default(),
        }
    }
}

#[async_trait]
impl Job for ArchiveCleanupJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        let archive = self.services.archive()?;
        let removed = archive.cleanup(self.older_than_days).await?;
        ctx.log_info(&format!(
            "Removed {} archive entries older than {} days",
            removed, self.older_than_days
        ));
        Ok(())
    }

    fn properties(&self) -> Result<serde_json::Value> {
        snapshot(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dead-letter replay
// ═══════════════════════════════════════════════════════════════════════════════

/// Moves up to `limit` dead letters of `queue` back onto it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterReplayJob {
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default = "default_replay_limit")]
    pub limit: usize,
    #[serde(skip)]
    services: BuiltinServices,
}

fn default_replay_limit() -> usize {
    100
}

impl DeadLetterReplayJob {
    pub const NAME: &'static str = "dead_letter_replay";

    pub fn new(queue: impl Into<String>, limit: usize) -> Self {
        Self {
            queue: queue.into(),
            connection: None,
            limit,
            services: BuiltinServices::default(),
        }
    }
}

#[async_trait]
impl Job for DeadLetterReplayJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        let manager = self.services.manager()?;
        let driver = manager.connection(self.connection.as_deref())?;
        let Some(dead) = driver.as_dead_letter() else {
            return Err(JobError::fatal(format!(
                "driver '{}' has no dead-letter store",
                driver.name()
            )));
        };

        let mut replayed = 0;
        while replayed < self.limit {
            if dead.retry_dead_letter(&self.queue).await?.is_none() {
                break;
            }
            replayed += 1;
        }
        ctx.log_info(&format!("Replayed {} dead letters onto '{}'", replayed, self.queue));
        Ok(())
    }

    fn properties(&self) -> Result<serde_json::Value> {
        snapshot(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Log message
// ═══════════════════════════════════════════════════════════════════════════════

/// Writes its message to the log. Useful for checking a deployment end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessageJob {
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogMessageJob {
    pub const NAME: &'static str = "log_message";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: LogLevel::Info,
        }
    }
}

#[async_trait]
impl Job for LogMessageJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        match self.level {
            LogLevel::Debug => tracing::debug!(job_type = %ctx.job_name, "{}", self.message),
            LogLevel::Info => ctx.log_info(&self.message),
            LogLevel::Warn => ctx.log_warn(&self.message),
            LogLevel::Error => ctx.log_error(&self.message),
        }
        Ok(())
    }

    fn properties(&self) -> Result<serde_json::Value> {
        snapshot(self)
    }
}

/// Register every built-in job type on `registry`.
pub fn register_builtin(registry: &mut JobRegistry, services: &BuiltinServices) -> Result<()> {
    let shared = services.clone();
    registry.register_with(ArchiveCleanupJob::NAME, move |properties| {
        let mut job: ArchiveCleanupJob = serde_json::from_value(properties)?;
        job.services = shared.clone();
        Ok(Box::new(job) as Box<dyn Job>)
    })?;

    let shared = services.clone();
    registry.register_with(DeadLetterReplayJob::NAME, move |properties| {
        let mut job: DeadLetterReplayJob = serde_json::from_value(properties)?;
        job.services = shared.clone();
        Ok(Box::new(job) as Box<dyn Job>)
    })?;

    registry.register_with(LogMessageJob::NAME, |properties| {
        let job: LogMessageJob = serde_json::from_value(properties)?;
        Ok(Box::new(job) as Box<dyn Job>)
    })
}
