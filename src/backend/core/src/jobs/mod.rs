//! Jobs, their wire form, and everything that runs them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Job Pipeline                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │  QueuedJob  │    │ Serializer  │    │   Driver    │    │  Consumer   │  │
//! │  │  (handler + │───▶│ (tagged /   │───▶│  (memory /  │───▶│  (poll      │  │
//! │  │   options)  │    │  plain)     │    │  redis /..) │    │   loop)     │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └──────┬──────┘  │
//! │         ▲                                     ▲                  │         │
//! │         │                                     │                  ▼         │
//! │  ┌──────┴──────┐                       ┌──────┴──────┐    ┌─────────────┐  │
//! │  │ JobRegistry │                       │  Scheduler  │    │   Worker    │  │
//! │  │ (type name  │                       │  (cron +    │    │  (retries,  │  │
//! │  │  lookup)    │                       │   tick lock)│    │   timeout)  │  │
//! │  └─────────────┘                       └─────────────┘    └─────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::jobs::{Job, JobContext, JobResult, JobType, QueuedJob, snapshot};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! #[async_trait]
//! impl Job for SendEmail {
//!     fn name(&self) -> &str { Self::NAME }
//!
//!     async fn handle(&self, ctx: &JobContext) -> JobResult {
//!         ctx.log_info(&format!("sending to {}", self.to));
//!         Ok(())
//!     }
//!
//!     fn properties(&self) -> Result<serde_json::Value> { snapshot(self) }
//! }
//!
//! impl JobType for SendEmail {
//!     const NAME: &'static str = "send_email";
//! }
//!
//! registry.register::<SendEmail>()?;
//! manager.push(QueuedJob::new(SendEmail { to: "a@x.com".into() }).on_queue("mail")).await?;
//! ```

pub mod builtin;
pub mod clock;
pub mod consumer;
pub mod job;
pub mod payload;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod serializer;
pub mod worker;

pub use builtin::{
    register_builtin, ArchiveCleanupJob, BuiltinServices, DeadLetterReplayJob, LogMessageJob,
};
pub use clock::{Clock, ManualClock, RecordingSleeper, Sleeper, SystemClock, TokioSleeper};
pub use consumer::{Consumer, ConsumerConfig};
pub use job::{
    snapshot, Backoff, Job, JobContext, JobError, JobId, JobOptions, JobPriority, JobResult,
    JobType, QueuedJob, RetryDecision, RetryPolicy,
};
pub use payload::{Payload, PayloadKind, PlainData, TaggedData};
pub use process::{WorkerProcess, WorkerProcessBuilder};
pub use registry::JobRegistry;
pub use scheduler::{
    next_occurrence, validate_cron, InMemoryScheduleStore, RedisScheduleStore, ScheduleStore,
    ScheduledDefinition, Scheduler,
};
pub use serializer::{PlainSerializer, Serializer, TaggedSerializer};
pub use worker::{FailureHandler, Worker, WorkerConfig, WorkerStats};
