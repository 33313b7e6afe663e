//! Configuration management.
//!
//! Sources, lowest precedence first: an optional settings file, environment
//! variables (`CONVEYOR__WORKER__MAX_ATTEMPTS=5`), then an optional JSON
//! overlay such as the CLI's `--config` file.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::archive::{Archive, InMemoryArchive, RelationalArchive, DEFAULT_ARCHIVE_TABLE};
use crate::db::Database;
use crate::drivers::{self, Driver, MemoryDriver, RateLimit, RedisDriver, RelationalDriver};
use crate::error::{QueueError, Result};
use crate::jobs::consumer::ConsumerConfig;
use crate::jobs::registry::JobRegistry;
use crate::jobs::scheduler::{InMemoryScheduleStore, RedisScheduleStore, ScheduleStore};
use crate::jobs::serializer::{PlainSerializer, TaggedSerializer};
use crate::jobs::worker::WorkerConfig;
use crate::manager::QueueManager;
use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Connection used when a job names none
    #[serde(default = "default_connection")]
    pub default_connection: String,

    /// Queue used when a job names none
    #[serde(default = "default_queue")]
    pub default_queue: String,

    #[serde(default = "default_connections")]
    pub connections: HashMap<String, ConnectionConfig>,

    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub archive: ArchiveSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// One named connection, tagged by `driver`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Memory,
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default = "default_redis_prefix")]
        prefix: String,
        #[serde(default)]
        rate_limit: Option<RateLimit>,
    },
    Database {
        url: String,
        #[serde(default = "default_table")]
        table: String,
        #[serde(default = "default_reservation_timeout_secs")]
        reservation_timeout_secs: u64,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl ConnectionConfig {
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis { .. } => "redis",
            Self::Database { .. } => "database",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Consumers per process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Handler deadline in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub keep_alive: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_secs: None,
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            keep_alive: false,
        }
    }
}

/// Where schedule definitions live.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "store", rename_all = "lowercase")]
pub enum SchedulerSettings {
    Memory,
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default = "default_schedule_prefix")]
        prefix: String,
    },
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveDriver {
    #[default]
    Memory,
    Database,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub driver: ArchiveDriver,

    /// Required for the database driver
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_archive_table")]
    pub table: String,
}

// Default value functions
fn default_environment() -> String { "development".to_string() }
fn default_connection() -> String { crate::manager::DEFAULT_CONNECTION.to_string() }
fn default_queue() -> String { crate::manager::DEFAULT_QUEUE.to_string() }
fn default_connections() -> HashMap<String, ConnectionConfig> {
    HashMap::from([(default_connection(), ConnectionConfig::Memory)])
}
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_redis_prefix() -> String { "queues:".to_string() }
fn default_schedule_prefix() -> String { "schedules:".to_string() }
fn default_table() -> String { drivers::relational::DEFAULT_TABLE.to_string() }
fn default_archive_table() -> String { DEFAULT_ARCHIVE_TABLE.to_string() }
fn default_reservation_timeout_secs() -> u64 { 300 }
fn default_max_connections() -> u32 { 10 }
fn default_workers() -> usize { 1 }
fn default_max_attempts() -> u32 { 3 }
fn default_poll_interval_ms() -> u64 { 1000 }

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            default_connection: default_connection(),
            default_queue: default_queue(),
            connections: default_connections(),
            worker: WorkerSettings::default(),
            scheduler: SchedulerSettings::default(),
            archive: ArchiveSettings::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        Self::load_layered(None, None)
    }

    /// Load from a specific file path, then the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_layered(Some(path.as_ref()), None)
    }

    /// Load a file, then the environment, then a JSON overlay on top.
    pub fn load_layered(file: Option<&Path>, overlay: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("CONVEYOR").separator("__"));
        if let Some(path) = overlay {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Json));
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that can never produce a working manager.
    pub fn validate(&self) -> Result<()> {
        if !self.connections.contains_key(&self.default_connection) {
            return Err(QueueError::connection_not_found(&self.default_connection));
        }
        if self.archive.enabled
            && self.archive.driver == ArchiveDriver::Database
            && self.archive.url.is_none()
        {
            return Err(QueueError::configuration(
                "archive.url is required for the database archive",
            ));
        }
        Ok(())
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            environment: self.environment.clone(),
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
            ..TelemetryConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_attempts: self.worker.max_attempts.max(1),
            timeout: self.worker.timeout_secs.map(Duration::from_secs),
            ..WorkerConfig::default()
        }
    }

    pub fn consumer_config(&self, queues: Vec<String>, connection: Option<String>) -> ConsumerConfig {
        ConsumerConfig {
            queues,
            connection,
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            keep_alive: self.worker.keep_alive,
            name: "worker".to_string(),
        }
    }

    /// Open every configured connection and assemble a manager.
    pub async fn build_manager(&self, registry: JobRegistry) -> Result<QueueManager> {
        let mut builder = QueueManager::builder()
            .default_connection(&self.default_connection)
            .default_queue(&self.default_queue)
            .serializer(Arc::new(TaggedSerializer::new(registry)))
            .serializer(Arc::new(PlainSerializer::new()));

        for (name, connection) in &self.connections {
            let driver = build_driver(connection).await?;
            tracing::info!(connection = %name, driver = connection.driver_name(), "Connection configured");
            builder = builder.connection(name.clone(), driver);
        }
        Ok(builder.build())
    }

    /// The archive, when enabled.
    pub async fn build_archive(&self) -> Result<Option<Arc<dyn Archive>>> {
        if !self.archive.enabled {
            return Ok(None);
        }
        let archive: Arc<dyn Archive> = match self.archive.driver {
            ArchiveDriver::Memory => Arc::new(InMemoryArchive::new()),
            ArchiveDriver::Database => {
                let url = self.archive.url.as_deref().ok_or_else(|| {
                    QueueError::configuration("archive.url is required for the database archive")
                })?;
                let database = Database::connect(url, default_max_connections()).await?;
                Arc::new(RelationalArchive::new(Arc::new(database)).with_table(&self.archive.table)?)
            }
        };
        Ok(Some(archive))
    }

    pub async fn build_schedule_store(&self) -> Result<Arc<dyn ScheduleStore>> {
        Ok(match &self.scheduler {
            SchedulerSettings::Memory => Arc::new(InMemoryScheduleStore::new()),
            SchedulerSettings::Redis { url, prefix } => {
                let client = drivers::redis::connect(url).await?;
                Arc::new(RedisScheduleStore::new(Arc::new(client)).with_prefix(prefix))
            }
        })
    }
}

async fn build_driver(connection: &ConnectionConfig) -> Result<Arc<dyn Driver>> {
    Ok(match connection {
        ConnectionConfig::Memory => Arc::new(MemoryDriver::new()),
        ConnectionConfig::Redis {
            url,
            prefix,
            rate_limit,
        } => {
            let client = drivers::redis::connect(url).await?;
            let mut builder = RedisDriver::builder().client(Arc::new(client)).prefix(prefix);
            if let Some(limit) = rate_limit {
                builder = builder.rate_limit(*limit);
            }
            Arc::new(builder.build()?)
        }
        ConnectionConfig::Database {
            url,
            table,
            reservation_timeout_secs,
            max_connections,
        } => {
            let database = Database::connect(url, *max_connections).await?;
            Arc::new(
                RelationalDriver::builder()
                    .executor(Arc::new(database))
                    .table(table)
                    .reservation_timeout(Duration::from_secs(*reservation_timeout_secs))
                    .build()?,
            )
        }
    })
}
