//! Payload serializers.
//!
//! `TaggedSerializer` records the job's type name so a worker can rebuild the
//! handler from its registry. `PlainSerializer` keeps field data only; the jobs
//! it produces can be inspected and logged but not executed.

use async_trait::async_trait;

use super::clock::{Clock, SystemClock};
use super::job::{Job, JobContext, JobError, JobResult, QueuedJob};
use super::payload::{Payload, PayloadKind, PlainData, TaggedData};
use super::registry::JobRegistry;
use crate::error::Result;
use std::sync::Arc;

/// Converts jobs to payloads and back.
pub trait Serializer: Send + Sync {
    fn kind(&self) -> PayloadKind;

    fn serialize(&self, job: &QueuedJob) -> Result<Payload>;

    fn deserialize(&self, payload: &Payload) -> Result<QueuedJob>;
}

fn stamp(kind: PayloadKind, data: String, job: &QueuedJob, clock: &dyn Clock) -> Payload {
    let mut payload = Payload::new(kind, data, clock.now_ms());
    payload.apply_options(&job.options);
    payload
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tagged
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializer that can reconstruct behavior through a job registry.
pub struct TaggedSerializer {
    registry: JobRegistry,
    clock: Arc<dyn Clock>,
}

impl TaggedSerializer {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut JobRegistry {
        &mut self.registry
    }
}

impl Serializer for TaggedSerializer {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Tagged
    }

    fn serialize(&self, job: &QueuedJob) -> Result<Payload> {
        let class = job.name().to_string();
        let data = serde_json::to_string(&TaggedData {
            class: class.clone(),
            properties: job.job.properties()?,
        })?;
        let mut payload = stamp(PayloadKind::Tagged, data, job, self.clock.as_ref());
        payload.class_name = Some(class);
        Ok(payload)
    }

    fn deserialize(&self, payload: &Payload) -> Result<QueuedJob> {
        let data: TaggedData = serde_json::from_str(&payload.data)?;
        let handler = self.registry.construct(&data.class, data.properties)?;
        Ok(QueuedJob::from_boxed(handler, payload.options()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Plain
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializer that keeps state only.
pub struct PlainSerializer {
    clock: Arc<dyn Clock>,
}

impl Default for PlainSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainSerializer {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Serializer for PlainSerializer {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Plain
    }

    fn serialize(&self, job: &QueuedJob) -> Result<Payload> {
        let data = serde_json::to_string(&PlainData {
            job: job.name().to_string(),
            properties: job.job.properties()?,
        })?;
        Ok(stamp(PayloadKind::Plain, data, job, self.clock.as_ref()))
    }

    fn deserialize(&self, payload: &Payload) -> Result<QueuedJob> {
        let data: PlainData = serde_json::from_str(&payload.data)?;
        let job = InspectedJob {
            name: data.job,
            properties: data.properties,
        };
        Ok(QueuedJob::from_boxed(Box::new(job), payload.options()))
    }
}

/// State recovered from a plain payload. Executing it always fails.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectedJob {
    pub name: String,
    pub properties: serde_json::Value,
}

#[async_trait]
impl Job for InspectedJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        Err(JobError::fatal(format!(
            "Job '{}' was serialized without its type and cannot be executed",
            self.name
        ))
        .with_code("PLAIN_PAYLOAD"))
    }

    fn properties(&self) -> Result<serde_json::Value> {
        Ok(self.properties.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::job::{JobPriority, JobType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
    }

    #[async_trait]
    impl Job for SendEmail {
        fn name(&self) -> &str {
            Self::NAME
        }

        async fn handle(&self, _ctx: &JobContext) -> JobResult {
            Ok(())
        }

        fn properties(&self) -> Result<serde_json::Value> {
            crate::jobs::job::snapshot(self)
        }
    }

    impl JobType for SendEmail {
        const NAME: &'static str = "SendEmail";
    }

    fn tagged() -> TaggedSerializer {
        let mut registry = JobRegistry::new();
        registry.register::<SendEmail>().unwrap();
        TaggedSerializer::new(registry).with_clock(Arc::new(ManualClock::new(7_000)))
    }

    #[test]
    fn test_tagged_data_shape() {
        let job = QueuedJob::new(SendEmail { to: "a@x.com".into() });
        let payload = tagged().serialize(&job).unwrap();

        assert_eq!(payload.kind, PayloadKind::Tagged);
        assert_eq!(payload.class_name.as_deref(), Some("SendEmail"));
        assert_eq!(payload.created_at, 7_000);
        let data: serde_json::Value = serde_json::from_str(&payload.data).unwrap();
        assert_eq!(data["class"], "SendEmail");
        assert_eq!(data["properties"]["to"], "a@x.com");
    }

    #[test]
    fn test_tagged_copies_routing_metadata() {
        let job = QueuedJob::new(SendEmail { to: "a@x.com".into() })
            .on_queue("mail")
            .delay(10)
            .priority(JobPriority::High)
            .group("user-9")
            .max_attempts(4);
        let serializer = tagged();
        let payload = serializer.serialize(&job).unwrap();

        assert_eq!(payload.delay_seconds, Some(10));
        assert_eq!(payload.priority, Some(JobPriority::High));
        assert_eq!(payload.group_id.as_deref(), Some("user-9"));
        assert_eq!(payload.max_attempts, Some(4));

        let back = serializer.deserialize(&payload).unwrap();
        assert_eq!(back.name(), "SendEmail");
        assert_eq!(back.options.queue.as_deref(), Some("mail"));
        assert_eq!(back.options.group_id.as_deref(), Some("user-9"));
        assert_eq!(back.job.properties().unwrap()["to"], "a@x.com");
    }

    #[test]
    fn test_ids_unique_per_serialization() {
        let job = QueuedJob::new(SendEmail { to: "a@x.com".into() });
        let serializer = tagged();
        let first = serializer.serialize(&job).unwrap();
        let second = serializer.serialize(&job).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_tagged_unknown_type() {
        let job = QueuedJob::new(SendEmail { to: "a@x.com".into() });
        let payload = tagged().serialize(&job).unwrap();

        let empty = TaggedSerializer::new(JobRegistry::new());
        let err = empty.deserialize(&payload).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
        assert!(err.user_message().contains("UnknownJobType"));
    }

    #[tokio::test]
    async fn test_plain_round_trip_is_inspect_only() {
        let serializer = PlainSerializer::new();
        let job = QueuedJob::new(SendEmail { to: "b@x.com".into() }).group("g");
        let payload = serializer.serialize(&job).unwrap();

        assert_eq!(payload.kind, PayloadKind::Plain);
        assert!(payload.class_name.is_none());
        let data: serde_json::Value = serde_json::from_str(&payload.data).unwrap();
        assert_eq!(data["job"], "SendEmail");

        let back = serializer.deserialize(&payload).unwrap();
        assert_eq!(back.name(), "SendEmail");
        assert_eq!(back.options.group_id.as_deref(), Some("g"));
        let err = back.job.handle(&JobContext::new("SendEmail")).await.unwrap_err();
        assert!(!err.retryable);
    }
}
