#![allow(clippy::result_large_err)]
//! # Conveyor Core
//!
//! A broker-agnostic job queue.
//!
//! ## Architecture
//!
//! - **Jobs**: handler trait, routing options, retry policy and the serialized payload
//! - **Serializers**: tagged payloads rebuilt through a job registry, or plain state-only payloads
//! - **Drivers**: in-memory, relational, Redis, log-broker and managed-queue backends behind one trait
//! - **Manager**: named connections, serializer selection and bulk dispatch
//! - **Worker / Consumer**: retries with exponential backoff, timeouts, and a cooperative poll loop
//! - **Scheduler**: cron definitions fired at most once per tick across processes
//! - **Archive**: optional record of terminal outcomes
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod archive;
pub mod config;
pub mod db;
pub mod drivers;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::archive::{Archive, ArchiveQuery, ArchiveStatus, ArchivedJob, InMemoryArchive};
    pub use crate::config::Settings;
    pub use crate::drivers::{Capabilities, Driver, MemoryDriver, RedisDriver, RelationalDriver};
    pub use crate::error::{ErrorCode, ErrorContext, QueueError, Result};
    pub use crate::jobs::{
        snapshot, Backoff, Consumer, ConsumerConfig, Job, JobContext, JobError, JobId,
        JobPriority, JobRegistry, JobResult, JobType, Payload, PayloadKind, QueuedJob,
        ScheduledDefinition, Scheduler, Worker, WorkerConfig, WorkerProcess,
    };
    pub use crate::manager::QueueManager;
}
