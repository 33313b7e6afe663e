//! Storage drivers.
//!
//! Every backend implements the core [`Driver`] trait. Optional behavior lives
//! on extension traits that a driver exposes through its `as_*` accessors:
//!
//! ```text
//!                 ┌────────────────────────────┐
//!                 │           Driver           │
//!                 │ push · pop · size · clear  │
//!                 │ complete · fail            │
//!                 └─────────────┬──────────────┘
//!        ┌──────────┬───────────┼────────────┬─────────────┬─────────────┐
//!        ▼          ▼           ▼            ▼             ▼             ▼
//!   BatchDriver  Subscribe   TopicDriver  Acknowledge  DeadLetter   RateLimited
//! ```
//!
//! | Driver       | Batch | Subscribe | Topics | Ack | Dead letter | Rate limit |
//! |--------------|-------|-----------|--------|-----|-------------|------------|
//! | memory       | ✓     |           |        |     | ✓           |            |
//! | database     |       |           |        |     | ✓           |            |
//! | redis        | ✓     |           |        |     | ✓           | ✓          |
//! | log broker   |       | ✓         | ✓      |     |             |            |
//! | managed      |       |           |        | ✓   |             |            |

pub mod log_broker;
pub mod managed;
pub mod memory;
pub mod redis;
pub mod relational;

pub use log_broker::{LogBrokerClient, LogBrokerDriver};
pub use managed::{ManagedQueueClient, ManagedQueueDriver, ReceivedMessage, SendMessageRequest};
pub use memory::MemoryDriver;
pub use redis::{RedisClient, RedisDriver, RedisReply};
pub use relational::{DatabaseExecutor, RelationalDriver, SqlRow, SqlValue};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::jobs::payload::Payload;

/// Capped size of every dead-letter list.
pub const DEAD_LETTER_CAP: usize = 1000;

/// Callback for push-delivery backends.
pub type PayloadHandler = Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<()>> + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════════
// Core Driver
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage-specific queue operations.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short backend name used in logs and metrics labels.
    fn name(&self) -> &str;

    async fn push(&self, queue: &str, payload: Payload) -> Result<()>;

    /// Non-blocking pop; `None` when nothing is available.
    async fn pop(&self, queue: &str) -> Result<Option<Payload>>;

    /// Exact or best-effort count of queued payloads.
    async fn size(&self, queue: &str) -> Result<u64>;

    async fn clear(&self, queue: &str) -> Result<()>;

    /// Called after the payload's job succeeded.
    async fn complete(&self, _queue: &str, _payload: &Payload) -> Result<()> {
        Ok(())
    }

    /// Called after the payload's job failed for the last time.
    async fn fail(&self, _queue: &str, _payload: &Payload) -> Result<()> {
        Ok(())
    }

    /// Whether `pop` can be called at all.
    fn supports_pop(&self) -> bool {
        true
    }

    fn as_batch(&self) -> Option<&dyn BatchDriver> {
        None
    }

    fn as_subscribe(&self) -> Option<&dyn SubscribeDriver> {
        None
    }

    fn as_topics(&self) -> Option<&dyn TopicDriver> {
        None
    }

    fn as_acknowledge(&self) -> Option<&dyn AcknowledgeDriver> {
        None
    }

    fn as_dead_letter(&self) -> Option<&dyn DeadLetterDriver> {
        None
    }

    fn as_rate_limited(&self) -> Option<&dyn RateLimitedDriver> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            pop: self.supports_pop(),
            batch: self.as_batch().is_some(),
            subscribe: self.as_subscribe().is_some(),
            topics: self.as_topics().is_some(),
            acknowledge: self.as_acknowledge().is_some(),
            dead_letter: self.as_dead_letter().is_some(),
            rate_limit: self.as_rate_limited().is_some(),
        }
    }
}

/// What a driver can do beyond the core operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub pop: bool,
    pub batch: bool,
    pub subscribe: bool,
    pub topics: bool,
    pub acknowledge: bool,
    pub dead_letter: bool,
    pub rate_limit: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Extension Traits
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait BatchDriver: Send + Sync {
    async fn push_many(&self, queue: &str, payloads: Vec<Payload>) -> Result<()>;

    async fn pop_many(&self, queue: &str, max: usize) -> Result<Vec<Payload>>;
}

/// Push-delivery consumption for backends that cannot be polled.
#[async_trait]
pub trait SubscribeDriver: Send + Sync {
    async fn subscribe(&self, queue: &str, group_id: &str, handler: PayloadHandler) -> Result<()>;
}

#[async_trait]
pub trait TopicDriver: Send + Sync {
    async fn create_topic(&self, queue: &str, partitions: u32) -> Result<()>;

    async fn delete_topic(&self, queue: &str) -> Result<()>;
}

/// Explicit commit for backends that require one.
#[async_trait]
pub trait AcknowledgeDriver: Send + Sync {
    async fn acknowledge(&self, queue: &str, message_id: &str) -> Result<()>;

    async fn acknowledge_receipt(&self, queue: &str, receipt_handle: &str) -> Result<()>;
}

/// Capped, queue-scoped store of payloads that exhausted their attempts.
#[async_trait]
pub trait DeadLetterDriver: Send + Sync {
    /// Newest first.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Payload>>;

    /// Re-push the oldest entry with its attempts reset.
    async fn retry_dead_letter(&self, queue: &str) -> Result<Option<Payload>>;

    /// Returns the number of entries removed.
    async fn purge_dead_letters(&self, queue: &str) -> Result<u64>;

    async fn dead_letter_size(&self, queue: &str) -> Result<u64>;
}

/// Fixed-window limit on dequeues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u64,
    pub window_ms: u64,
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub count: u64,
    pub limit: u64,
}

/// Advisory dequeue throttling. Never blocks pushes.
#[async_trait]
pub trait RateLimitedDriver: Send + Sync {
    /// The limit configured for this connection, if any.
    fn rate_limit(&self) -> Option<RateLimit>;

    /// Count one dequeue attempt against the current window.
    async fn hit(&self, queue: &str, limit: RateLimit) -> Result<RateLimitStatus>;
}
