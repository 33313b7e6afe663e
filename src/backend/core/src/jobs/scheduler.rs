//! Cron scheduler.
//!
//! Definitions live in a [`ScheduleStore`] indexed by their next run time.
//! Each tick takes every due definition, claims a short lock keyed by
//! `(id, current second)`, and only the lock winner enqueues the templated
//! payload and advances `next_run`. Any number of scheduler processes can
//! share one store; each definition fires at most once per due interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};
use super::job::QueuedJob;
use super::payload::Payload;
use crate::drivers::redis::{RedisClient, RedisReply};
use crate::error::{QueueError, Result};
use crate::manager::QueueManager;
use crate::telemetry::QueueMetrics;

/// Longest accepted cron expression.
pub const MAX_CRON_LENGTH: usize = 256;

/// Lifetime of a per-tick lock.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

// ═══════════════════════════════════════════════════════════════════════════════
// Cron
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_cron(expression: &str) -> Result<Cron> {
    if expression.len() > MAX_CRON_LENGTH {
        return Err(QueueError::invalid_cron(
            expression.chars().take(32).collect::<String>(),
            format!("expression longer than {} characters", MAX_CRON_LENGTH),
        ));
    }
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| QueueError::invalid_cron(expression, e.to_string()))
}

/// Check a 5- or 6-field cron expression.
pub fn validate_cron(expression: &str) -> Result<()> {
    parse_cron(expression).map(|_| ())
}

/// First occurrence strictly after `after_ms`, in epoch milliseconds.
pub fn next_occurrence(expression: &str, after_ms: i64) -> Result<i64> {
    let cron = parse_cron(expression)?;
    let start = DateTime::<Utc>::from_timestamp(after_ms.div_euclid(1000), 0)
        .ok_or_else(|| QueueError::invalid_cron(expression, "timestamp out of range"))?;
    cron.find_next_occurrence(&start, false)
        .map(|next| next.timestamp_millis())
        .map_err(|e| QueueError::invalid_cron(expression, e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Definitions
// ═══════════════════════════════════════════════════════════════════════════════

/// A recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledDefinition {
    pub id: String,
    pub cron: String,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    /// Copied under a fresh id on every firing
    pub template: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<i64>,
    pub next_run: i64,
    pub enabled: bool,
    pub created_at: i64,
}

impl ScheduledDefinition {
    /// Build an enabled definition whose first run follows `now_ms`.
    pub fn new(
        id: impl Into<String>,
        cron: impl Into<String>,
        queue: impl Into<String>,
        template: Payload,
        now_ms: i64,
    ) -> Result<Self> {
        let cron = cron.into();
        let next_run = next_occurrence(&cron, now_ms)?;
        Ok(Self {
            id: id.into(),
            cron,
            queue: queue.into(),
            connection: None,
            template,
            last_run: None,
            next_run,
            enabled: true,
            created_at: now_ms,
        })
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.enabled && self.next_run <= now_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence for definitions plus the tick lock.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace; disabled definitions leave the due index.
    async fn save(&self, definition: &ScheduledDefinition) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ScheduledDefinition>>;

    /// Returns whether a definition was removed.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<ScheduledDefinition>>;

    /// Ids with `next_run <= now_ms`, earliest first.
    async fn due(&self, now_ms: i64) -> Result<Vec<String>>;

    /// Claim `key` for `ttl`; false when someone else holds it.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool>;
}

#[derive(Default)]
struct MemoryScheduleState {
    definitions: HashMap<String, ScheduledDefinition>,
    index: BTreeSet<(i64, String)>,
    /// Lock key to expiry in epoch ms
    locks: HashMap<String, i64>,
}

/// Store held in process memory. Share one instance to share schedules.
pub struct InMemoryScheduleStore {
    state: Mutex<MemoryScheduleState>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryScheduleState::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn save(&self, definition: &ScheduledDefinition) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(old) = state.definitions.remove(&definition.id) {
            state.index.remove(&(old.next_run, old.id));
        }
        if definition.enabled {
            state
                .index
                .insert((definition.next_run, definition.id.clone()));
        }
        state
            .definitions
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledDefinition>> {
        Ok(self.state.lock().definitions.get(id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.definitions.remove(id) {
            Some(old) => {
                state.index.remove(&(old.next_run, old.id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<ScheduledDefinition>> {
        let mut all: Vec<_> = self.state.lock().definitions.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn due(&self, now_ms: i64) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .index
            .iter()
            .take_while(|(next_run, _)| *next_run <= now_ms)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.locks.retain(|_, expires| *expires > now);
        if state.locks.contains_key(key) {
            return Ok(false);
        }
        state
            .locks
            .insert(key.to_string(), now + ttl.as_millis() as i64);
        Ok(true)
    }
}

/// Store in Redis: a sorted set index, a hash of definitions and `SET NX PX`
/// locks.
pub struct RedisScheduleStore {
    client: Arc<dyn RedisClient>,
    prefix: String,
}

impl RedisScheduleStore {
    pub fn new(client: Arc<dyn RedisClient>) -> Self {
        Self {
            client,
            prefix: "schedules:".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn index_key(&self) -> String {
        format!("{}index", self.prefix)
    }

    fn definitions_key(&self) -> String {
        format!("{}definitions", self.prefix)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}lock:{}", self.prefix, key)
    }
}

#[async_trait]
impl ScheduleStore for RedisScheduleStore {
    async fn save(&self, definition: &ScheduledDefinition) -> Result<()> {
        let json = serde_json::to_string(definition)?;
        self.client
            .command("HSET", &[self.definitions_key(), definition.id.clone(), json])
            .await?;
        if definition.enabled {
            self.client
                .command(
                    "ZADD",
                    &[
                        self.index_key(),
                        definition.next_run.to_string(),
                        definition.id.clone(),
                    ],
                )
                .await?;
        } else {
            self.client
                .command("ZREM", &[self.index_key(), definition.id.clone()])
                .await?;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledDefinition>> {
        let reply = self
            .client
            .command("HGET", &[self.definitions_key(), id.to_string()])
            .await?;
        match reply.into_text() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.client
            .command("ZREM", &[self.index_key(), id.to_string()])
            .await?;
        let removed = self
            .client
            .command("HDEL", &[self.definitions_key(), id.to_string()])
            .await?;
        Ok(removed.as_int().unwrap_or(0) > 0)
    }

    async fn list(&self) -> Result<Vec<ScheduledDefinition>> {
        let reply = self
            .client
            .command("HVALS", &[self.definitions_key()])
            .await?;
        let mut all = reply
            .into_array()
            .into_iter()
            .filter_map(RedisReply::into_text)
            .map(|raw| serde_json::from_str(&raw).map_err(QueueError::from))
            .collect::<Result<Vec<ScheduledDefinition>>>()?;
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn due(&self, now_ms: i64) -> Result<Vec<String>> {
        let reply = self
            .client
            .command(
                "ZRANGEBYSCORE",
                &[self.index_key(), "-inf".to_string(), now_ms.to_string()],
            )
            .await?;
        Ok(reply
            .into_array()
            .into_iter()
            .filter_map(RedisReply::into_text)
            .collect())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let reply = self
            .client
            .command(
                "SET",
                &[
                    self.lock_key(key),
                    "1".to_string(),
                    "NX".to_string(),
                    "PX".to_string(),
                    ttl.as_millis().to_string(),
                ],
            )
            .await?;
        Ok(!reply.is_nil())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Fires due definitions onto their queues.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    manager: Arc<QueueManager>,
    clock: Arc<dyn Clock>,
    lock_ttl: Duration,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, manager: Arc<QueueManager>) -> Self {
        Self {
            store,
            manager,
            clock: Arc::new(SystemClock),
            lock_ttl: DEFAULT_LOCK_TTL,
            tick_interval: Duration::from_secs(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Register `job` to run on `cron`, serialized with the default serializer.
    pub async fn register(
        &self,
        id: impl Into<String>,
        cron: &str,
        job: &QueuedJob,
    ) -> Result<ScheduledDefinition> {
        let template = self.manager.default_serializer()?.serialize(job)?;
        let queue = job
            .options
            .queue
            .clone()
            .unwrap_or_else(|| self.manager.default_queue().to_string());
        let mut definition =
            ScheduledDefinition::new(id, cron, queue, template, self.clock.now_ms())?;
        definition.connection = job.options.connection.clone();
        self.register_definition(definition).await
    }

    /// Store a prepared definition after validating its expression.
    pub async fn register_definition(
        &self,
        definition: ScheduledDefinition,
    ) -> Result<ScheduledDefinition> {
        validate_cron(&definition.cron)?;
        self.store.save(&definition).await?;
        tracing::info!(
            schedule = %definition.id,
            cron = %definition.cron,
            queue = %definition.queue,
            next_run = definition.next_run,
            "Schedule registered"
        );
        Ok(definition)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        if self.store.remove(id).await? {
            tracing::info!(schedule = %id, "Schedule removed");
            Ok(())
        } else {
            Err(QueueError::schedule_not_found(id))
        }
    }

    /// Re-enable; the next run is computed from now.
    pub async fn enable(&self, id: &str) -> Result<ScheduledDefinition> {
        let mut definition = self.require(id).await?;
        definition.enabled = true;
        definition.next_run = next_occurrence(&definition.cron, self.clock.now_ms())?;
        self.store.save(&definition).await?;
        Ok(definition)
    }

    pub async fn disable(&self, id: &str) -> Result<ScheduledDefinition> {
        let mut definition = self.require(id).await?;
        definition.enabled = false;
        self.store.save(&definition).await?;
        Ok(definition)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledDefinition>> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<ScheduledDefinition>> {
        self.store.list().await
    }

    async fn require(&self, id: &str) -> Result<ScheduledDefinition> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::schedule_not_found(id))
    }

    /// Fire every due definition this process wins the lock for.
    ///
    /// Returns the ids that fired here.
    pub async fn tick(&self) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let second = now.div_euclid(1000);
        let mut fired = Vec::new();

        for id in self.store.due(now).await? {
            let lock_key = format!("{}:{}", id, second);
            if !self.store.try_lock(&lock_key, self.lock_ttl).await? {
                tracing::debug!(schedule = %id, "Tick claimed elsewhere");
                continue;
            }

            // a peer may have advanced it between `due` and the lock
            let Some(mut definition) = self.store.get(&id).await? else {
                continue;
            };
            if !definition.is_due(now) {
                continue;
            }

            let mut payload = definition.template.reissue(now);
            payload.queue = Some(definition.queue.clone());
            if let Err(e) = self
                .manager
                .push_payload(definition.connection.as_deref(), &definition.queue, payload)
                .await
            {
                tracing::error!(schedule = %id, error = %e, "Scheduled push failed");
                continue;
            }

            definition.last_run = Some(now);
            definition.next_run = next_occurrence(&definition.cron, now)?;
            self.store.save(&definition).await?;
            QueueMetrics::schedule_fired(&id);
            tracing::info!(schedule = %id, queue = %definition.queue, next_run = definition.next_run, "Schedule fired");
            fired.push(id);
        }
        Ok(fired)
    }

    /// Tick on an interval until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
