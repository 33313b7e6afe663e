//! Relational driver.
//!
//! Each payload is one row. A pop reserves a row instead of deleting it, so a
//! reservation held by a crashed worker expires and the row becomes eligible
//! again. Completion deletes the row; terminal failure moves it to the
//! `failed:<queue>` partition of the same table.
//!
//! SQL uses Postgres placeholders (`$1`).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{DeadLetterDriver, Driver};
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::clock::{Clock, SystemClock};
use crate::jobs::payload::Payload;

/// Default table for queued rows.
pub const DEFAULT_TABLE: &str = "queue_jobs";

/// Default reservation lifetime.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(300);

// ═══════════════════════════════════════════════════════════════════════════════
// Executor Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// A bound SQL parameter or a decoded column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Int(Option<i64>),
    Text(Option<String>),
}

impl SqlValue {
    pub fn int(value: i64) -> Self {
        Self::Int(Some(value))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(Some(value.into()))
    }

    pub fn null_int() -> Self {
        Self::Int(None)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => *v,
            Self::Text(v) => v.as_deref().and_then(|s| s.parse().ok()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => v.as_deref(),
            Self::Int(_) => None,
        }
    }
}

/// One result row keyed by column name.
pub type SqlRow = HashMap<String, SqlValue>;

/// Read a text column, failing when it is absent or null.
pub fn text_column(row: &SqlRow, column: &str) -> Result<String> {
    row.get(column)
        .and_then(SqlValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing_column(column))
}

/// Read an integer column, failing when it is absent or null.
pub fn int_column(row: &SqlRow, column: &str) -> Result<i64> {
    row.get(column)
        .and_then(SqlValue::as_i64)
        .ok_or_else(|| missing_column(column))
}

fn missing_column(column: &str) -> QueueError {
    QueueError::new(ErrorCode::DatabaseError, format!("Missing column in result: {}", column))
}

/// The database service the relational components run on.
#[async_trait]
pub trait DatabaseExecutor: Send + Sync {
    /// Run a statement; returns affected rows.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Run a query; returns every row.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Whether `FOR UPDATE SKIP LOCKED` is available.
    fn supports_skip_locked(&self) -> bool {
        false
    }
}

/// Reject anything that is not a plain identifier, since table names are
/// interpolated into SQL.
pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(QueueError::new(
            ErrorCode::InvalidConfiguration,
            format!("Invalid table name: {}", table),
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`RelationalDriver`].
#[derive(Default)]
pub struct RelationalDriverBuilder {
    executor: Option<Arc<dyn DatabaseExecutor>>,
    table: Option<String>,
    reservation_timeout: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl RelationalDriverBuilder {
    pub fn executor(mut self, executor: Arc<dyn DatabaseExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = Some(timeout);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<RelationalDriver> {
        let executor = self.executor.ok_or_else(QueueError::database_service_required)?;
        let table = self.table.unwrap_or_else(|| DEFAULT_TABLE.to_string());
        validate_table_name(&table)?;
        Ok(RelationalDriver {
            executor,
            table,
            reservation_timeout: self.reservation_timeout.unwrap_or(DEFAULT_RESERVATION_TIMEOUT),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}

/// Driver storing payloads as rows behind a [`DatabaseExecutor`].
pub struct RelationalDriver {
    executor: Arc<dyn DatabaseExecutor>,
    table: String,
    reservation_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RelationalDriver {
    pub fn builder() -> RelationalDriverBuilder {
        RelationalDriverBuilder::default()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn reservation_timeout(&self) -> Duration {
        self.reservation_timeout
    }

    fn failed_queue(queue: &str) -> String {
        format!("failed:{}", queue)
    }

    fn lock_clause(&self) -> &'static str {
        if self.executor.supports_skip_locked() {
            "FOR UPDATE SKIP LOCKED"
        } else {
            "FOR UPDATE"
        }
    }

    fn reserve_sql(&self) -> String {
        format!(
            "UPDATE {t} SET reserved_at = $1, attempts = attempts + 1 \
             WHERE id = (\
                SELECT id FROM {t} \
                WHERE queue = $2 AND available_at <= $1 \
                AND (reserved_at IS NULL OR reserved_at <= $3) \
                ORDER BY created_at ASC LIMIT 1 {lock}\
             ) \
             AND (reserved_at IS NULL OR reserved_at <= $3) \
             RETURNING id, payload, attempts",
            t = self.table,
            lock = self.lock_clause(),
        )
    }

    /// Moves the oldest failed row back onto its queue and clears the
    /// failure fields inside the stored payload, in one statement.
    fn requeue_sql(&self) -> String {
        format!(
            "UPDATE {t} SET queue = $1, attempts = 0, reserved_at = NULL, \
             payload = ((payload::jsonb - 'error' - 'failedAt') || jsonb_build_object('attempts', 0))::text \
             WHERE id = (\
                SELECT id FROM {t} WHERE queue = $2 \
                ORDER BY created_at ASC LIMIT 1 {lock}\
             ) \
             AND queue = $2 \
             RETURNING id, payload",
            t = self.table,
            lock = self.lock_clause(),
        )
    }

    async fn insert(&self, queue: &str, payload: &Payload) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, queue, payload, attempts, available_at, created_at, reserved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NULL)",
            self.table
        );
        self.executor
            .execute(
                &sql,
                &[
                    SqlValue::text(payload.id.to_string()),
                    SqlValue::text(queue),
                    SqlValue::text(payload.to_json()?),
                    SqlValue::int(payload.attempts as i64),
                    SqlValue::int(payload.available_at()),
                    SqlValue::int(payload.created_at),
                ],
            )
            .await?;
        Ok(())
    }

    async fn count(&self, queue: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) AS count FROM {} WHERE queue = $1", self.table);
        let rows = self.executor.query(&sql, &[SqlValue::text(queue)]).await?;
        Ok(rows
            .first()
            .map(|row| int_column(row, "count"))
            .transpose()?
            .unwrap_or(0)
            .max(0) as u64)
    }

    fn decode(row: &SqlRow) -> Result<Payload> {
        Payload::from_json(&text_column(row, "payload")?)
    }
}

#[async_trait]
impl Driver for RelationalDriver {
    fn name(&self) -> &str {
        "database"
    }

    async fn push(&self, queue: &str, payload: Payload) -> Result<()> {
        self.insert(queue, &payload).await
    }

    async fn pop(&self, queue: &str) -> Result<Option<Payload>> {
        let now = self.clock.now_ms();
        let expired_before = now - self.reservation_timeout.as_millis() as i64;
        let rows = self
            .executor
            .query(
                &self.reserve_sql(),
                &[
                    SqlValue::int(now),
                    SqlValue::text(queue),
                    SqlValue::int(expired_before),
                ],
            )
            .await?;

        rows.first().map(Self::decode).transpose()
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        self.count(queue).await
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE queue = $1", self.table);
        self.executor.execute(&sql, &[SqlValue::text(queue)]).await?;
        Ok(())
    }

    async fn complete(&self, _queue: &str, payload: &Payload) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        self.executor
            .execute(&sql, &[SqlValue::text(payload.id.to_string())])
            .await?;
        Ok(())
    }

    async fn fail(&self, queue: &str, payload: &Payload) -> Result<()> {
        let failed = Self::failed_queue(queue);
        let sql = format!(
            "UPDATE {} SET queue = $1, payload = $2, attempts = $3, reserved_at = NULL WHERE id = $4",
            self.table
        );
        let moved = self
            .executor
            .execute(
                &sql,
                &[
                    SqlValue::text(&failed),
                    SqlValue::text(payload.to_json()?),
                    SqlValue::int(payload.attempts as i64),
                    SqlValue::text(payload.id.to_string()),
                ],
            )
            .await?;
        if moved == 0 {
            self.insert(&failed, payload).await?;
        }
        Ok(())
    }

    fn as_dead_letter(&self) -> Option<&dyn DeadLetterDriver> {
        Some(self)
    }
}

#[async_trait]
impl DeadLetterDriver for RelationalDriver {
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Payload>> {
        let sql = format!(
            "SELECT id, payload FROM {} WHERE queue = $1 ORDER BY created_at DESC LIMIT $2",
            self.table
        );
        let rows = self
            .executor
            .query(
                &sql,
                &[SqlValue::text(Self::failed_queue(queue)), SqlValue::int(limit as i64)],
            )
            .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn retry_dead_letter(&self, queue: &str) -> Result<Option<Payload>> {
        let rows = self
            .executor
            .query(
                &self.requeue_sql(),
                &[SqlValue::text(queue), SqlValue::text(Self::failed_queue(queue))],
            )
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let mut payload = Self::decode(row)?;
        payload.reset_for_retry();
        tracing::info!(queue = %queue, job_id = %payload.id, "Dead letter re-queued");
        Ok(Some(payload))
    }

    async fn purge_dead_letters(&self, queue: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE queue = $1", self.table);
        self.executor
            .execute(&sql, &[SqlValue::text(Self::failed_queue(queue))])
            .await
    }

    async fn dead_letter_size(&self, queue: &str) -> Result<u64> {
        self.count(&Self::failed_queue(queue)).await
    }
}
