//! Durable audit trail of finished jobs, independent of the live queue.
//!
//! The consumer archives each payload once its job completes or fails for
//! the last time. Archive errors are logged by the caller and never affect
//! queue processing.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::drivers::relational::{int_column, text_column, validate_table_name};
use crate::drivers::{DatabaseExecutor, SqlRow, SqlValue};
use crate::error::{QueueError, Result};
use crate::jobs::clock::{Clock, SystemClock};
use crate::jobs::job::JobId;
use crate::jobs::payload::Payload;

/// Default table for archived jobs.
pub const DEFAULT_ARCHIVE_TABLE: &str = "queue_archive";

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Completed,
    Failed,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::deserialization(format!(
                "Unknown archive status: {}",
                other
            ))),
        }
    }
}

/// One archived payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedJob {
    pub id: JobId,
    pub queue: String,
    pub job_name: String,
    pub payload: Payload,
    pub status: ArchiveStatus,
    pub error: Option<String>,
    /// Epoch milliseconds
    pub archived_at: i64,
}

/// Filters for [`Archive::search`]. Unset fields match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveQuery {
    pub queue: Option<String>,
    pub status: Option<ArchiveStatus>,
    pub job_name: Option<String>,
    /// Substring of the serialized payload or error
    pub text: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ArchiveQuery {
    fn default() -> Self {
        Self {
            queue: None,
            status: None,
            job_name: None,
            text: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl ArchiveQuery {
    fn matches(&self, job: &ArchivedJob) -> bool {
        self.queue.as_ref().map_or(true, |q| &job.queue == q)
            && self.status.map_or(true, |s| job.status == s)
            && self.job_name.as_ref().map_or(true, |n| &job.job_name == n)
            && self.text.as_ref().map_or(true, |t| {
                job.payload.data.contains(t.as_str())
                    || job.error.as_deref().is_some_and(|e| e.contains(t.as_str()))
            })
    }
}

/// Archive adapter contract.
#[async_trait]
pub trait Archive: Send + Sync {
    async fn archive(&self, queue: &str, payload: &Payload, status: ArchiveStatus) -> Result<ArchivedJob>;

    async fn find(&self, id: JobId) -> Result<Option<ArchivedJob>>;

    /// Newest first.
    async fn list(&self, queue: &str, limit: usize, offset: usize) -> Result<Vec<ArchivedJob>>;

    /// Newest first.
    async fn search(&self, query: &ArchiveQuery) -> Result<Vec<ArchivedJob>>;

    async fn count(&self, queue: Option<&str>, status: Option<ArchiveStatus>) -> Result<u64>;

    /// Delete entries archived more than `older_than_days` ago; returns how many.
    async fn cleanup(&self, older_than_days: u32) -> Result<u64>;
}

fn entry(queue: &str, payload: &Payload, status: ArchiveStatus, now_ms: i64) -> ArchivedJob {
    ArchivedJob {
        id: payload.id,
        queue: queue.to_string(),
        job_name: payload.display_name(),
        payload: payload.clone(),
        status,
        error: payload.error.clone(),
        archived_at: now_ms,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Archive held in process memory.
pub struct InMemoryArchive {
    entries: DashMap<JobId, ArchivedJob>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn collect(&self, query: &ArchiveQuery) -> Vec<ArchivedJob> {
        let mut found: Vec<ArchivedJob> = self
            .entries
            .iter()
            .filter(|e| query.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| b.archived_at.cmp(&a.archived_at).then(b.id.cmp(&a.id)));
        found
    }
}

#[async_trait]
impl Archive for InMemoryArchive {
    async fn archive(&self, queue: &str, payload: &Payload, status: ArchiveStatus) -> Result<ArchivedJob> {
        let archived = entry(queue, payload, status, self.clock.now_ms());
        self.entries.insert(archived.id, archived.clone());
        Ok(archived)
    }

    async fn find(&self, id: JobId) -> Result<Option<ArchivedJob>> {
        Ok(self.entries.get(&id).map(|e| e.value().clone()))
    }

    async fn list(&self, queue: &str, limit: usize, offset: usize) -> Result<Vec<ArchivedJob>> {
        self.search(&ArchiveQuery {
            queue: Some(queue.to_string()),
            limit,
            offset,
            ..Default::default()
        })
        .await
    }

    async fn search(&self, query: &ArchiveQuery) -> Result<Vec<ArchivedJob>> {
        Ok(self
            .collect(query)
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn count(&self, queue: Option<&str>, status: Option<ArchiveStatus>) -> Result<u64> {
        let query = ArchiveQuery {
            queue: queue.map(str::to_string),
            status,
            ..Default::default()
        };
        Ok(self.entries.iter().filter(|e| query.matches(e.value())).count() as u64)
    }

    async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = self.clock.now_ms() - older_than_days as i64 * DAY_MS;
        let before = self.entries.len();
        self.entries.retain(|_, job| job.archived_at >= cutoff);
        Ok((before - self.entries.len()) as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Relational
// ═══════════════════════════════════════════════════════════════════════════════

/// Archive stored in a table behind a [`DatabaseExecutor`].
pub struct RelationalArchive {
    executor: Arc<dyn DatabaseExecutor>,
    table: String,
    clock: Arc<dyn Clock>,
}

impl RelationalArchive {
    pub fn new(executor: Arc<dyn DatabaseExecutor>) -> Self {
        Self {
            executor,
            table: DEFAULT_ARCHIVE_TABLE.to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        self.table = table;
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn decode(row: &SqlRow) -> Result<ArchivedJob> {
        let payload = Payload::from_json(&text_column(row, "payload")?)?;
        Ok(ArchivedJob {
            id: text_column(row, "id")?.parse()?,
            queue: text_column(row, "queue")?,
            job_name: text_column(row, "job_name")?,
            status: text_column(row, "status")?.parse()?,
            error: row.get("error").and_then(SqlValue::as_str).map(str::to_string),
            archived_at: int_column(row, "archived_at")?,
            payload,
        })
    }

    /// WHERE clause and its parameters, numbered from `$1`.
    fn filter(query: &ArchiveQuery) -> (String, Vec<SqlValue>) {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        let mut bind = |condition: &str, value: SqlValue| {
            params.push(value);
            conditions.push(condition.replace('?', &format!("${}", params.len())));
        };

        if let Some(queue) = &query.queue {
            bind("queue = ?", SqlValue::text(queue));
        }
        if let Some(status) = query.status {
            bind("status = ?", SqlValue::text(status.as_str()));
        }
        if let Some(name) = &query.job_name {
            bind("job_name = ?", SqlValue::text(name));
        }
        if let Some(text) = &query.text {
            bind(
                "(strpos(payload, ?) > 0 OR strpos(COALESCE(error, ''), ?) > 0)",
                SqlValue::text(text),
            );
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        (clause, params)
    }
}

#[async_trait]
impl Archive for RelationalArchive {
    async fn archive(&self, queue: &str, payload: &Payload, status: ArchiveStatus) -> Result<ArchivedJob> {
        let archived = entry(queue, payload, status, self.clock.now_ms());
        let sql = format!(
            "INSERT INTO {} (id, queue, job_name, payload, status, error, archived_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO UPDATE SET \
             status = EXCLUDED.status, error = EXCLUDED.error, \
             payload = EXCLUDED.payload, archived_at = EXCLUDED.archived_at",
            self.table
        );
        self.executor
            .execute(
                &sql,
                &[
                    SqlValue::text(archived.id.to_string()),
                    SqlValue::text(&archived.queue),
                    SqlValue::text(&archived.job_name),
                    SqlValue::text(payload.to_json()?),
                    SqlValue::text(status.as_str()),
                    SqlValue::Text(archived.error.clone()),
                    SqlValue::int(archived.archived_at),
                ],
            )
            .await?;
        Ok(archived)
    }

    async fn find(&self, id: JobId) -> Result<Option<ArchivedJob>> {
        let sql = format!("SELECT * FROM {} WHERE id = $1", self.table);
        let rows = self
            .executor
            .query(&sql, &[SqlValue::text(id.to_string())])
            .await?;
        rows.first().map(Self::decode).transpose()
    }

    async fn list(&self, queue: &str, limit: usize, offset: usize) -> Result<Vec<ArchivedJob>> {
        self.search(&ArchiveQuery {
            queue: Some(queue.to_string()),
            limit,
            offset,
            ..Default::default()
        })
        .await
    }

    async fn search(&self, query: &ArchiveQuery) -> Result<Vec<ArchivedJob>> {
        let (clause, mut params) = Self::filter(query);
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY archived_at DESC, id DESC LIMIT ${} OFFSET ${}",
            self.table,
            clause,
            params.len() + 1,
            params.len() + 2
        );
        params.push(SqlValue::int(query.limit as i64));
        params.push(SqlValue::int(query.offset as i64));
        let rows = self.executor.query(&sql, &params).await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn count(&self, queue: Option<&str>, status: Option<ArchiveStatus>) -> Result<u64> {
        let (clause, params) = Self::filter(&ArchiveQuery {
            queue: queue.map(str::to_string),
            status,
            ..Default::default()
        });
        let sql = format!("SELECT COUNT(*) AS count FROM {}{}", self.table, clause);
        let rows = self.executor.query(&sql, &params).await?;
        Ok(rows
            .first()
            .map(|row| int_column(row, "count"))
            .transpose()?
            .unwrap_or(0)
            .max(0) as u64)
    }

    async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        let cutoff = self.clock.now_ms() - older_than_days as i64 * DAY_MS;
        let sql = format!("DELETE FROM {} WHERE archived_at < $1", self.table);
        self.executor.execute(&sql, &[SqlValue::int(cutoff)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::payload::PayloadKind;
    use std::time::Duration;

    fn tagged(class: &str) -> Payload {
        let mut payload = Payload::new(PayloadKind::Tagged, format!("{{\"class\":\"{}\"}}", class), 0);
        payload.class_name = Some(class.to_string());
        payload
    }

    #[tokio::test]
    async fn test_archive_find_count() {
        let archive = InMemoryArchive::new();
        let ok = tagged("SendEmail");
        let mut bad = tagged("Resize");
        bad.mark_failed("disk full", 5);

        archive.archive("mail", &ok, ArchiveStatus::Completed).await.unwrap();
        archive.archive("media", &bad, ArchiveStatus::Failed).await.unwrap();

        let found = archive.find(bad.id).await.unwrap().unwrap();
        assert_eq!(found.job_name, "Resize");
        assert_eq!(found.error.as_deref(), Some("disk full"));
        assert_eq!(archive.count(None, None).await.unwrap(), 2);
        assert_eq!(archive.count(Some("mail"), None).await.unwrap(), 1);
        assert_eq!(archive.count(None, Some(ArchiveStatus::Failed)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_by_text_and_status() {
        let archive = InMemoryArchive::new();
        let mut failed = tagged("Resize");
        failed.mark_failed("disk full", 1);
        archive.archive("media", &failed, ArchiveStatus::Failed).await.unwrap();
        archive.archive("media", &tagged("Thumb"), ArchiveStatus::Completed).await.unwrap();

        let hits = archive
            .search(&ArchiveQuery {
                text: Some("disk".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, failed.id);

        let completed = archive
            .search(&ArchiveQuery {
                status: Some(ArchiveStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed[0].job_name, "Thumb");
    }

    #[tokio::test]
    async fn test_cleanup_by_age() {
        let clock = ManualClock::new(0);
        let archive = InMemoryArchive::new().with_clock(Arc::new(clock.clone()));
        archive.archive("q", &tagged("Old"), ArchiveStatus::Completed).await.unwrap();
        clock.advance(Duration::from_millis(10 * DAY_MS as u64));
        archive.archive("q", &tagged("New"), ArchiveStatus::Completed).await.unwrap();

        assert_eq!(archive.cleanup(7).await.unwrap(), 1);
        let left = archive.list("q", 10, 0).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].job_name, "New");
    }

    #[test]
    fn test_relational_filter_numbering() {
        let (clause, params) = RelationalArchive::filter(&ArchiveQuery {
            queue: Some("mail".into()),
            text: Some("boom".into()),
            ..Default::default()
        });
        assert_eq!(
            clause,
            " WHERE queue = $1 AND (strpos(payload, $2) > 0 OR strpos(COALESCE(error, ''), $2) > 0)"
        );
        assert_eq!(params.len(), 2);
    }
}
