//! Error handling for Conveyor Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and chaining
//! - Separate user-facing and internal messages
//! - Severity-aware logging through `tracing`
//! - An error counter per code through `metrics`
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::error::{QueueError, Result, ErrorContext};
//!
//! fn load_template(raw: &str) -> Result<serde_json::Value> {
//!     serde_json::from_str(raw).context("Failed to parse job template")
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and safe to match on from calling code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobTimeout,
    JobFailed,
    AlreadyRegistered,

    // Scheduler Errors (1100-1199)
    InvalidCronExpression,
    ScheduleNotFound,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    RecordNotFound,

    // Cache Errors (2100-2199)
    CacheError,
    CacheConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Broker Errors (3000-3099)
    BrokerError,
    UnsupportedOperation,
    ReceiptHandleRequired,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,
    ConnectionNotFound,
    SerializerNotFound,
    RedisClientNotConfigured,
    DatabaseServiceRequired,
    BrokerClientRequired,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobTimeout => 1000,
            Self::JobFailed => 1001,
            Self::AlreadyRegistered => 1002,

            Self::InvalidCronExpression => 1100,
            Self::ScheduleNotFound => 1101,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::RecordNotFound => 2002,

            Self::CacheError => 2100,
            Self::CacheConnectionFailed => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::BrokerError => 3000,
            Self::UnsupportedOperation => 3001,
            Self::ReceiptHandleRequired => 3002,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,
            Self::ConnectionNotFound => 5003,
            Self::SerializerNotFound => 5004,
            Self::RedisClientNotConfigured => 5005,
            Self::DatabaseServiceRequired => 5006,
            Self::BrokerClientRequired => 5007,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is transient.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::JobTimeout
                | Self::JobFailed
                | Self::DatabaseError
                | Self::DatabaseConnectionFailed
                | Self::CacheError
                | Self::CacheConnectionFailed
                | Self::BrokerError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "scheduler",
            2000..=2099 => "database",
            2100..=2199 => "cache",
            2200..=2299 => "serialization",
            3000..=3099 => "broker",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected conditions (missing records, lost races)
    Low,
    /// Operational issues (timeouts, unsupported calls)
    Medium,
    /// System errors (driver failures, bad payloads)
    High,
    /// Misconfiguration or unreachable backends
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::RecordNotFound | ErrorCode::ScheduleNotFound => Self::Low,

            ErrorCode::JobTimeout
            | ErrorCode::JobFailed
            | ErrorCode::UnsupportedOperation
            | ErrorCode::ReceiptHandleRequired
            | ErrorCode::AlreadyRegistered
            | ErrorCode::InvalidCronExpression => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::CacheError
            | ErrorCode::BrokerError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::ConnectionNotFound
            | ErrorCode::SerializerNotFound => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::CacheConnectionFailed
            | ErrorCode::RedisClientNotConfigured
            | ErrorCode::DatabaseServiceRequired
            | ErrorCode::BrokerClientRequired
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (payload, schedule, connection)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Conveyor.
#[derive(Error, Debug)]
pub struct QueueError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl QueueError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the human-readable message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is transient.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "conveyor_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| QueueError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| QueueError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| QueueError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| QueueError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested row was not found"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheConnectionFailed, "Unable to connect to Redis")
        } else if error.is_timeout() {
            (ErrorCode::CacheError, "Redis operation timed out")
        } else {
            (ErrorCode::CacheError, "A Redis error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for QueueError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::JobTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for QueueError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::MissingConfiguration, "File not found"),
            ErrorKind::TimedOut => (ErrorCode::BrokerError, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::BrokerError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<QueueError>() {
            Ok(queue_error) => queue_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl QueueError {
    // ─────────────────────────────────────────────────────────────────────────
    // Routing Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// No connection is registered under this name.
    pub fn connection_not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            ErrorCode::ConnectionNotFound,
            format!("Queue connection not found: {}", name),
        )
        .with_details(ErrorDetails::new().with_entity("connection", &name))
    }

    /// No serializer is registered for this payload kind.
    pub fn serializer_not_found(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self::new(
            ErrorCode::SerializerNotFound,
            format!("Serializer not found: {}", kind),
        )
        .with_details(ErrorDetails::new().with_entity("serializer", &kind))
    }

    /// The driver does not implement the requested capability.
    pub fn unsupported(driver: &str, operation: &str) -> Self {
        Self::new(
            ErrorCode::UnsupportedOperation,
            format!("Driver '{}' does not support {}", driver, operation),
        )
        .with_context("driver", driver)
        .with_context("operation", operation)
    }

    /// The backend acknowledges by receipt handle, not by message id.
    pub fn receipt_handle_required(driver: &str) -> Self {
        Self::new(
            ErrorCode::ReceiptHandleRequired,
            format!("The {} driver acknowledges messages by receipt handle only", driver),
        )
        .with_context("driver", driver)
        .with_details(
            ErrorDetails::new().with_suggestion("Pass the receipt handle returned by pop"),
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The tagged payload names a job type that is not registered.
    pub fn unknown_job_type(class_name: impl Into<String>) -> Self {
        let class_name = class_name.into();
        Self::new(
            ErrorCode::DeserializationError,
            format!("UnknownJobType: {}", class_name),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job_type", &class_name)
                .with_suggestion("Register the job type on the tagged serializer"),
        )
    }

    /// A job type was registered twice on the same registry.
    pub fn already_registered(class_name: impl Into<String>) -> Self {
        let class_name = class_name.into();
        Self::new(
            ErrorCode::AlreadyRegistered,
            format!("Job type already registered: {}", class_name),
        )
        .with_details(ErrorDetails::new().with_entity("job_type", &class_name))
    }

    /// The payload could not be turned back into a job.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeserializationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduler Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// The cron expression failed to parse.
    pub fn invalid_cron(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        let expression = expression.into();
        Self::with_internal(
            ErrorCode::InvalidCronExpression,
            format!("Invalid cron expression: {}", expression),
            reason,
        )
        .with_context("expression", &expression)
    }

    /// No schedule exists with this id.
    pub fn schedule_not_found(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(ErrorCode::ScheduleNotFound, format!("Schedule not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("schedule", &id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// A Redis-backed component was built without a client.
    pub fn redis_client_not_configured() -> Self {
        Self::new(
            ErrorCode::RedisClientNotConfigured,
            "Redis client is not configured",
        )
        .with_details(ErrorDetails::new().with_suggestion("Set connections.<name>.url"))
    }

    /// A relational component was built without a database executor.
    pub fn database_service_required() -> Self {
        Self::new(
            ErrorCode::DatabaseServiceRequired,
            "A database executor is required for the relational driver",
        )
    }

    /// A broker driver was built without its client.
    pub fn broker_client_required(driver: &str) -> Self {
        Self::new(
            ErrorCode::BrokerClientRequired,
            format!("The {} driver requires a broker client", driver),
        )
        .with_context("driver", driver)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
