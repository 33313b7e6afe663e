//! Queue manager: routes jobs to named connections and owns serializer
//! selection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::drivers::Driver;
use crate::error::{QueueError, Result};
use crate::jobs::job::{JobId, QueuedJob};
use crate::jobs::payload::{Payload, PayloadKind};
use crate::jobs::serializer::Serializer;
use crate::telemetry::QueueMetrics;

/// Queue used when neither the job nor the caller names one.
pub const DEFAULT_QUEUE: &str = "default";

/// Connection used when no default is configured.
pub const DEFAULT_CONNECTION: &str = "default";

/// Builder for [`QueueManager`].
pub struct QueueManagerBuilder {
    connections: HashMap<String, Arc<dyn Driver>>,
    serializers: HashMap<PayloadKind, Arc<dyn Serializer>>,
    default_connection: String,
    default_serializer: PayloadKind,
    default_queue: String,
}

impl Default for QueueManagerBuilder {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            serializers: HashMap::new(),
            default_connection: DEFAULT_CONNECTION.to_string(),
            default_serializer: PayloadKind::Tagged,
            default_queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl QueueManagerBuilder {
    pub fn connection(mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.connections.insert(name.into(), driver);
        self
    }

    /// Register a serializer under its own kind.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.insert(serializer.kind(), serializer);
        self
    }

    pub fn default_connection(mut self, name: impl Into<String>) -> Self {
        self.default_connection = name.into();
        self
    }

    pub fn default_serializer(mut self, kind: PayloadKind) -> Self {
        self.default_serializer = kind;
        self
    }

    pub fn default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn build(self) -> QueueManager {
        QueueManager {
            connections: self.connections,
            serializers: self.serializers,
            default_connection: self.default_connection,
            default_serializer: self.default_serializer,
            default_queue: self.default_queue,
        }
    }
}

/// Routes jobs to drivers.
///
/// Unknown connection and serializer names fail at call time with
/// `ConnectionNotFound` and `SerializerNotFound`.
pub struct QueueManager {
    connections: HashMap<String, Arc<dyn Driver>>,
    serializers: HashMap<PayloadKind, Arc<dyn Serializer>>,
    default_connection: String,
    default_serializer: PayloadKind,
    default_queue: String,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("connections", &self.connection_names())
            .field("default_connection", &self.default_connection)
            .field("default_serializer", &self.default_serializer)
            .field("default_queue", &self.default_queue)
            .finish()
    }
}

impl QueueManager {
    pub fn builder() -> QueueManagerBuilder {
        QueueManagerBuilder::default()
    }

    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    pub fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a connection; `None` means the default.
    pub fn connection(&self, name: Option<&str>) -> Result<Arc<dyn Driver>> {
        let name = name.unwrap_or(&self.default_connection);
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::connection_not_found(name))
    }

    pub fn serializer(&self, kind: PayloadKind) -> Result<Arc<dyn Serializer>> {
        self.serializers
            .get(&kind)
            .cloned()
            .ok_or_else(|| QueueError::serializer_not_found(kind.as_str()))
    }

    pub fn default_serializer(&self) -> Result<Arc<dyn Serializer>> {
        self.serializer(self.default_serializer)
    }

    /// Serialize a job with the default serializer and push it.
    pub async fn push(&self, job: QueuedJob) -> Result<JobId> {
        self.push_with(job, self.default_serializer).await
    }

    /// Serialize a job with a specific serializer and push it.
    pub async fn push_with(&self, job: QueuedJob, kind: PayloadKind) -> Result<JobId> {
        let connection = job.options.connection.clone();
        let queue = self.queue_for(job.options.queue.as_deref());
        let mut payload = self.serializer(kind)?.serialize(&job)?;
        payload.queue = Some(queue.clone());
        self.push_payload(connection.as_deref(), &queue, payload).await
    }

    /// Push an already-serialized payload.
    pub async fn push_payload(
        &self,
        connection: Option<&str>,
        queue: &str,
        payload: Payload,
    ) -> Result<JobId> {
        let driver = self.connection(connection)?;
        let id = payload.id;
        driver.push(queue, payload).await?;
        QueueMetrics::pushed(driver.name(), queue);
        tracing::debug!(
            connection = connection.unwrap_or(&self.default_connection),
            queue = %queue,
            job_id = %id,
            "Job pushed"
        );
        Ok(id)
    }

    /// Push many jobs, batching per (connection, queue) where the driver can.
    pub async fn bulk(&self, jobs: Vec<QueuedJob>) -> Result<Vec<JobId>> {
        let serializer = self.default_serializer()?;
        let mut ids = Vec::with_capacity(jobs.len());
        let mut batches: BTreeMap<(Option<String>, String), Vec<Payload>> = BTreeMap::new();

        for job in &jobs {
            let queue = self.queue_for(job.options.queue.as_deref());
            let mut payload = serializer.serialize(job)?;
            payload.queue = Some(queue.clone());
            ids.push(payload.id);
            batches
                .entry((job.options.connection.clone(), queue))
                .or_default()
                .push(payload);
        }

        for ((connection, queue), payloads) in batches {
            let driver = self.connection(connection.as_deref())?;
            let count = payloads.len();
            match driver.as_batch() {
                Some(batch) => batch.push_many(&queue, payloads).await?,
                None => {
                    for payload in payloads {
                        driver.push(&queue, payload).await?;
                    }
                }
            }
            for _ in 0..count {
                QueueMetrics::pushed(driver.name(), &queue);
            }
        }
        Ok(ids)
    }

    pub async fn pop(&self, queue: &str, connection: Option<&str>) -> Result<Option<Payload>> {
        let driver = self.connection(connection)?;
        let payload = driver.pop(queue).await?;
        if payload.is_some() {
            QueueMetrics::popped(driver.name(), queue);
        }
        Ok(payload)
    }

    pub async fn size(&self, queue: &str, connection: Option<&str>) -> Result<u64> {
        self.connection(connection)?.size(queue).await
    }

    pub async fn clear(&self, queue: &str, connection: Option<&str>) -> Result<()> {
        self.connection(connection)?.clear(queue).await
    }

    /// Rebuild a job with the serializer that produced the payload.
    pub fn deserialize(&self, payload: &Payload) -> Result<QueuedJob> {
        self.serializer(payload.kind)?.deserialize(payload)
    }

    fn queue_for(&self, queue: Option<&str>) -> String {
        queue.unwrap_or(&self.default_queue).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::error::ErrorCode;
    use crate::jobs::job::{Job, JobContext, JobResult, JobType};
    use crate::jobs::registry::JobRegistry;
    use crate::jobs::serializer::{PlainSerializer, TaggedSerializer};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    #[async_trait]
    impl Job for Email {
        fn name(&self) -> &str {
            Self::NAME
        }

        async fn handle(&self, _ctx: &JobContext) -> JobResult {
            Ok(())
        }

        fn properties(&self) -> crate::error::Result<serde_json::Value> {
            crate::jobs::job::snapshot(self)
        }
    }

    impl JobType for Email {
        const NAME: &'static str = "email";
    }

    fn manager() -> QueueManager {
        let mut registry = JobRegistry::new();
        registry.register::<Email>().unwrap();
        QueueManager::builder()
            .connection("default", Arc::new(MemoryDriver::new()))
            .connection("other", Arc::new(MemoryDriver::new()))
            .serializer(Arc::new(TaggedSerializer::new(registry)))
            .serializer(Arc::new(PlainSerializer::new()))
            .build()
    }

    #[tokio::test]
    async fn test_round_trip_through_default_queue() {
        let manager = manager();
        let job = QueuedJob::new(Email { to: "a@x.com".into() });
        let id = manager.push(job).await.unwrap();

        let payload = manager.pop("default", None).await.unwrap().unwrap();
        assert_eq!(payload.id, id);
        assert_eq!(payload.queue.as_deref(), Some("default"));

        let back = manager.deserialize(&payload).unwrap();
        assert_eq!(back.job.properties().unwrap()["to"], "a@x.com");
    }

    #[tokio::test]
    async fn test_routes_to_named_connection() {
        let manager = manager();
        let job = QueuedJob::new(Email { to: "b@x.com".into() })
            .on_connection("other")
            .on_queue("mail");
        manager.push(job).await.unwrap();

        assert_eq!(manager.size("mail", None).await.unwrap(), 0);
        assert_eq!(manager.size("mail", Some("other")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_fails_at_call() {
        let manager = manager();
        let job = QueuedJob::new(Email { to: "c@x.com".into() }).on_connection("nope");
        let err = manager.push(job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionNotFound);
    }

    #[tokio::test]
    async fn test_missing_serializer() {
        let manager = QueueManager::builder()
            .connection("default", Arc::new(MemoryDriver::new()))
            .build();
        let job = QueuedJob::new(Email { to: "d@x.com".into() });
        let err = manager.push(job).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializerNotFound);
    }

    #[tokio::test]
    async fn test_bulk_groups_by_queue() {
        let manager = manager();
        let jobs = vec![
            QueuedJob::new(Email { to: "1".into() }).on_queue("a"),
            QueuedJob::new(Email { to: "2".into() }).on_queue("b"),
            QueuedJob::new(Email { to: "3".into() }).on_queue("a"),
        ];
        let ids = manager.bulk(jobs).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(manager.size("a", None).await.unwrap(), 2);
        assert_eq!(manager.size("b", None).await.unwrap(), 1);
        assert_eq!(manager.pop("a", None).await.unwrap().unwrap().id, ids[0]);
    }
}
