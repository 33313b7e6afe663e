//! Managed message-service driver.
//!
//! `pop` long-polls with a visibility timeout. The received message's receipt
//! handle rides on the payload and `complete` uses it to delete the message;
//! an unacknowledged message reappears once its visibility expires.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{AcknowledgeDriver, Driver};
use crate::error::{QueueError, Result};
use crate::jobs::payload::Payload;

/// Longest delay the service accepts.
pub const MAX_DELAY_SECONDS: u64 = 900;

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub queue: String,
    pub body: String,
    pub delay_seconds: u64,
    /// FIFO message group
    pub message_group_id: Option<String>,
    pub deduplication_id: Option<String>,
}

/// One received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// The minimal managed-queue surface the queue needs.
#[async_trait]
pub trait ManagedQueueClient: Send + Sync {
    /// Returns the service-assigned message id.
    async fn send_message(&self, request: SendMessageRequest) -> Result<String>;

    async fn receive_message(
        &self,
        queue: &str,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>>;

    async fn delete_message(&self, queue: &str, receipt_handle: &str) -> Result<()>;

    async fn purge_queue(&self, queue: &str) -> Result<()>;

    async fn approximate_message_count(&self, queue: &str) -> Result<u64>;
}

/// Builder for [`ManagedQueueDriver`].
#[derive(Default)]
pub struct ManagedQueueDriverBuilder {
    client: Option<Arc<dyn ManagedQueueClient>>,
    queue_prefix: String,
    wait: Option<Duration>,
    visibility_timeout: Option<Duration>,
}

impl ManagedQueueDriverBuilder {
    pub fn client(mut self, client: Arc<dyn ManagedQueueClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Prepended to queue names, e.g. a queue URL base.
    pub fn queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ManagedQueueDriver> {
        let client = self
            .client
            .ok_or_else(|| QueueError::broker_client_required("managed queue"))?;
        Ok(ManagedQueueDriver {
            client,
            queue_prefix: self.queue_prefix,
            wait: self.wait.unwrap_or(Duration::from_secs(20)),
            visibility_timeout: self.visibility_timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}

/// Driver over a [`ManagedQueueClient`].
pub struct ManagedQueueDriver {
    client: Arc<dyn ManagedQueueClient>,
    queue_prefix: String,
    wait: Duration,
    visibility_timeout: Duration,
}

impl ManagedQueueDriver {
    pub fn builder() -> ManagedQueueDriverBuilder {
        ManagedQueueDriverBuilder::default()
    }

    fn queue(&self, queue: &str) -> String {
        format!("{}{}", self.queue_prefix, queue)
    }
}

#[async_trait]
impl Driver for ManagedQueueDriver {
    fn name(&self) -> &str {
        "managed"
    }

    async fn push(&self, queue: &str, payload: Payload) -> Result<()> {
        let request = SendMessageRequest {
            queue: self.queue(queue),
            body: payload.to_json()?,
            delay_seconds: payload.delay_seconds.unwrap_or(0).min(MAX_DELAY_SECONDS),
            deduplication_id: payload.group_id.as_ref().map(|_| payload.id.to_string()),
            message_group_id: payload.group_id.clone(),
        };
        let message_id = self.client.send_message(request).await?;
        tracing::debug!(queue = %queue, job_id = %payload.id, message_id = %message_id, "Message sent");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Payload>> {
        let received = self
            .client
            .receive_message(&self.queue(queue), self.wait, self.visibility_timeout)
            .await?;
        let Some(message) = received else {
            return Ok(None);
        };
        let mut payload = Payload::from_json(&message.body)?;
        payload.receipt_handle = Some(message.receipt_handle);
        Ok(Some(payload))
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        self.client.approximate_message_count(&self.queue(queue)).await
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        self.client.purge_queue(&self.queue(queue)).await
    }

    async fn complete(&self, queue: &str, payload: &Payload) -> Result<()> {
        let handle = payload
            .receipt_handle
            .as_deref()
            .ok_or_else(|| QueueError::receipt_handle_required(self.name()))?;
        self.acknowledge_receipt(queue, handle).await
    }

    async fn fail(&self, queue: &str, payload: &Payload) -> Result<()> {
        // redrive policy on the service side owns dead-lettering
        tracing::warn!(
            queue = %queue,
            job_id = %payload.id,
            "Leaving failed message for the service redrive policy"
        );
        Ok(())
    }

    fn as_acknowledge(&self) -> Option<&dyn AcknowledgeDriver> {
        Some(self)
    }
}

#[async_trait]
impl AcknowledgeDriver for ManagedQueueDriver {
    async fn acknowledge(&self, _queue: &str, _message_id: &str) -> Result<()> {
        Err(QueueError::receipt_handle_required(self.name()))
    }

    async fn acknowledge_receipt(&self, queue: &str, receipt_handle: &str) -> Result<()> {
        self.client.delete_message(&self.queue(queue), receipt_handle).await
    }
}
