//! Partitioned-log driver.
//!
//! Logs are consumed by subscription, so `pop` is unsupported. Queue size is
//! the broker's lag estimate. A payload's group id becomes its partition key,
//! which keeps a group's payloads ordered within one partition.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

use super::{Driver, PayloadHandler, SubscribeDriver, TopicDriver};
use crate::error::{QueueError, Result};
use crate::jobs::payload::Payload;

/// Raw message callback handed to the broker client.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The minimal log-broker surface the queue needs.
#[async_trait]
pub trait LogBrokerClient: Send + Sync {
    async fn publish(&self, topic: &str, key: Option<&str>, value: String) -> Result<()>;

    async fn subscribe(&self, topic: &str, group_id: &str, handler: MessageHandler) -> Result<()>;

    async fn create_topic(&self, topic: &str, partitions: u32) -> Result<()>;

    async fn delete_topic(&self, topic: &str) -> Result<()>;

    /// Consumer lag, if the broker can estimate it.
    async fn approximate_lag(&self, topic: &str) -> Result<Option<u64>>;
}

/// Builder for [`LogBrokerDriver`].
#[derive(Default)]
pub struct LogBrokerDriverBuilder {
    client: Option<Arc<dyn LogBrokerClient>>,
    topic_prefix: String,
    partitions: Option<u32>,
}

impl LogBrokerDriverBuilder {
    pub fn client(mut self, client: Arc<dyn LogBrokerClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Partition count used when `clear` recreates a topic.
    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn build(self) -> Result<LogBrokerDriver> {
        let client = self
            .client
            .ok_or_else(|| QueueError::broker_client_required("log broker"))?;
        Ok(LogBrokerDriver {
            client,
            topic_prefix: self.topic_prefix,
            partitions: self.partitions.unwrap_or(1).max(1),
        })
    }
}

/// Driver over a [`LogBrokerClient`].
pub struct LogBrokerDriver {
    client: Arc<dyn LogBrokerClient>,
    topic_prefix: String,
    partitions: u32,
}

impl LogBrokerDriver {
    pub fn builder() -> LogBrokerDriverBuilder {
        LogBrokerDriverBuilder::default()
    }

    fn topic(&self, queue: &str) -> String {
        format!("{}{}", self.topic_prefix, queue)
    }
}

#[async_trait]
impl Driver for LogBrokerDriver {
    fn name(&self) -> &str {
        "log_broker"
    }

    async fn push(&self, queue: &str, payload: Payload) -> Result<()> {
        if payload.delay_seconds.unwrap_or(0) > 0 {
            tracing::debug!(queue = %queue, job_id = %payload.id, "Log broker ignores delay");
        }
        let value = payload.to_json()?;
        self.client
            .publish(&self.topic(queue), payload.group_id.as_deref(), value)
            .await
    }

    async fn pop(&self, _queue: &str) -> Result<Option<Payload>> {
        Err(QueueError::unsupported(self.name(), "pop"))
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        match self.client.approximate_lag(&self.topic(queue)).await {
            Ok(lag) => Ok(lag.unwrap_or(0)),
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Lag estimate unavailable");
                Ok(0)
            }
        }
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let topic = self.topic(queue);
        self.client.delete_topic(&topic).await?;
        self.client.create_topic(&topic, self.partitions).await
    }

    fn supports_pop(&self) -> bool {
        false
    }

    fn as_subscribe(&self) -> Option<&dyn SubscribeDriver> {
        Some(self)
    }

    fn as_topics(&self) -> Option<&dyn TopicDriver> {
        Some(self)
    }
}

#[async_trait]
impl SubscribeDriver for LogBrokerDriver {
    async fn subscribe(&self, queue: &str, group_id: &str, handler: PayloadHandler) -> Result<()> {
        let raw: MessageHandler = Arc::new(move |message: String| -> BoxFuture<'static, Result<()>> {
            let handler = handler.clone();
            Box::pin(async move {
                let payload = Payload::from_json(&message)?;
                handler(payload).await
            })
        });
        self.client.subscribe(&self.topic(queue), group_id, raw).await
    }
}

#[async_trait]
impl TopicDriver for LogBrokerDriver {
    async fn create_topic(&self, queue: &str, partitions: u32) -> Result<()> {
        self.client.create_topic(&self.topic(queue), partitions.max(1)).await
    }

    async fn delete_topic(&self, queue: &str) -> Result<()> {
        self.client.delete_topic(&self.topic(queue)).await
    }
}
