//! PostgreSQL access through sqlx.
//!
//! [`Database`] is the production [`DatabaseExecutor`]: the relational driver
//! and the relational archive only ever see that trait.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo};
use std::time::Duration;

use crate::drivers::relational::{DatabaseExecutor, SqlRow, SqlValue};
use crate::error::{QueueError, Result};
use crate::telemetry::logging::redact_url;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("size", &self.pool.size())
            .finish()
    }
}

impl Database {
    /// Create a new connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!(url = %redact_url(database_url), max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the queue and archive tables.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn bind_all<'q>(sql: &'q str, params: &[SqlValue]) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        SqlValue::Int(value) => query.bind(*value),
        SqlValue::Text(value) => query.bind(value.clone()),
    })
}

fn decode_row(row: &PgRow) -> Result<SqlRow> {
    let mut decoded = SqlRow::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT8" => SqlValue::Int(row.try_get::<Option<i64>, _>(index)?),
            "INT4" => SqlValue::Int(row.try_get::<Option<i32>, _>(index)?.map(i64::from)),
            "INT2" => SqlValue::Int(row.try_get::<Option<i16>, _>(index)?.map(i64::from)),
            _ => SqlValue::Text(row.try_get::<Option<String>, _>(index)?),
        };
        decoded.insert(column.name().to_string(), value);
    }
    Ok(decoded)
}

#[async_trait]
impl DatabaseExecutor for Database {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let result = bind_all(sql, params).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let rows = bind_all(sql, params).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    fn supports_skip_locked(&self) -> bool {
        true
    }
}
