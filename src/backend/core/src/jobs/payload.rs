//! The serialized, transportable form of a job.
//!
//! Wire format is UTF-8 JSON with camelCase keys. `data` is itself a JSON
//! string: `{class, properties}` for tagged payloads, `{job, properties}` for
//! plain ones.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::job::{Backoff, JobId, JobOptions, JobPriority};
use crate::error::{QueueError, Result};

/// Serialization strategy that produced a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    #[serde(rename = "tagged-json")]
    Tagged,
    #[serde(rename = "plain-json")]
    Plain,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tagged => "tagged-json",
            Self::Plain => "plain-json",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tagged-json" | "tagged" => Ok(Self::Tagged),
            "plain-json" | "plain" => Ok(Self::Plain),
            other => Err(QueueError::serializer_not_found(other)),
        }
    }
}

/// Body of `data` for tagged payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedData {
    pub class: String,
    pub properties: serde_json::Value,
}

/// Body of `data` for plain payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainData {
    pub job: String,
    pub properties: serde_json::Value,
}

/// A serialized unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Unique per enqueue
    pub id: JobId,
    pub kind: PayloadKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Opaque serializer output
    pub data: String,
    /// Epoch milliseconds
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    /// Per-job attempt cap; the worker's configured cap applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<JobPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Acknowledgement token handed out by managed-queue receives
    #[serde(skip)]
    pub receipt_handle: Option<String>,
}

impl Payload {
    /// Create a payload with a fresh id and no routing metadata.
    pub fn new(kind: PayloadKind, data: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: JobId::new(),
            kind,
            class_name: None,
            data: data.into(),
            created_at,
            delay_seconds: None,
            attempts: 0,
            max_attempts: None,
            group_id: None,
            priority: None,
            error: None,
            failed_at: None,
            queue: None,
            backoff: None,
            timeout_ms: None,
            receipt_handle: None,
        }
    }

    /// Copy routing metadata from job options onto the payload.
    pub fn apply_options(&mut self, options: &JobOptions) {
        self.queue = options.queue.clone();
        self.delay_seconds = options.delay_seconds.filter(|d| *d > 0);
        self.priority = options.priority;
        self.group_id = options.group_id.clone();
        self.backoff = options.backoff;
        self.attempts = options.attempts;
        self.max_attempts = options.max_attempts;
        self.timeout_ms = options.timeout.map(|t| t.as_millis() as u64);
    }

    /// Routing metadata recovered from the payload.
    pub fn options(&self) -> JobOptions {
        JobOptions {
            queue: self.queue.clone(),
            connection: None,
            delay_seconds: self.delay_seconds,
            priority: self.priority,
            group_id: self.group_id.clone(),
            backoff: self.backoff,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }

    /// Epoch milliseconds at which the payload becomes visible.
    pub fn available_at(&self) -> i64 {
        let delay_ms = self.delay_seconds.unwrap_or(0).saturating_mul(1000);
        self.created_at.saturating_add(delay_ms.min(i64::MAX as u64) as i64)
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.available_at() <= now_ms
    }

    /// Stamp a terminal failure onto the payload.
    pub fn mark_failed(&mut self, error: impl Into<String>, now_ms: i64) {
        self.error = Some(error.into());
        self.failed_at = Some(now_ms);
    }

    /// Clear failure state so the payload can be pushed again.
    pub fn reset_for_retry(&mut self) {
        self.attempts = 0;
        self.error = None;
        self.failed_at = None;
        self.receipt_handle = None;
    }

    /// Copy of this payload under a new id, as produced by a fresh enqueue.
    pub fn reissue(&self, created_at: i64) -> Self {
        let mut copy = self.clone();
        copy.id = JobId::new();
        copy.created_at = created_at;
        copy.reset_for_retry();
        copy
    }

    /// Human-readable job name for logs.
    pub fn display_name(&self) -> String {
        if let Some(class) = &self.class_name {
            return class.clone();
        }
        serde_json::from_str::<PlainData>(&self.data)
            .map(|d| d.job)
            .unwrap_or_else(|_| "unknown".to_string())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            QueueError::with_internal(
                crate::error::ErrorCode::DeserializationError,
                "Malformed payload",
                e.to_string(),
            )
        })
    }
}
