//! Redis driver with priority lanes, delayed delivery, per-group FIFO,
//! advisory rate limiting and a dead-letter list.
//!
//! Key layout for queue `q` under prefix `p`:
//!
//! ```text
//! p{q}                      default lane (list)
//! p{q}:critical|high|low    other lanes (lists)
//! p{q}:delayed              delayed payloads (zset scored by availableAt)
//! p{q}:paused               paused lane names (set)
//! p{q}:groups:active        groups with a payload in flight (set)
//! p{q}:group:{g}:pending    payloads waiting on group g (list)
//! p{q}:dead                 dead letters, newest first (list)
//! p{q}:rate:{bucket}        fixed-window counter
//! ```
//!
//! Group activation, pop, group advance and dead-letter retry each run as a
//! single Lua script so concurrent pollers never see a half-applied
//! transition. A group advance re-checks the next payload's delay, so a
//! payload that waited behind its group is still never visible before
//! `createdAt + delaySeconds`.

use async_trait::async_trait;
use std::sync::Arc;

use super::{
    BatchDriver, DeadLetterDriver, Driver, RateLimit, RateLimitStatus, RateLimitedDriver,
    DEAD_LETTER_CAP,
};
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::clock::{Clock, SystemClock};
use crate::jobs::job::JobPriority;
use crate::jobs::payload::Payload;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "queues:";

// ═══════════════════════════════════════════════════════════════════════════════
// Client Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// A decoded Redis reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisReply {
    Nil,
    Ok,
    Int(i64),
    Text(String),
    Array(Vec<RedisReply>),
}

impl RedisReply {
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(i) => Some(i.to_string()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn into_array(self) -> Vec<RedisReply> {
        match self {
            Self::Array(items) => items,
            Self::Nil => Vec::new(),
            other => vec![other],
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl From<redis::Value> for RedisReply {
    fn from(value: redis::Value) -> Self {
        match value {
            redis::Value::Nil => Self::Nil,
            redis::Value::Okay => Self::Ok,
            redis::Value::Int(i) => Self::Int(i),
            redis::Value::Data(bytes) => Self::Text(String::from_utf8_lossy(&bytes).into_owned()),
            redis::Value::Status(s) => Self::Text(s),
            redis::Value::Bulk(items) => Self::Array(items.into_iter().map(Self::from).collect()),
        }
    }
}

/// The minimal Redis surface the queue needs.
#[async_trait]
pub trait RedisClient: Send + Sync {
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<RedisReply>;

    async fn command(&self, name: &str, args: &[String]) -> Result<RedisReply>;
}

fn eval_cmd(script: &str, keys: &[String], args: &[String]) -> redis::Cmd {
    let mut cmd = redis::cmd("EVAL");
    cmd.arg(script).arg(keys.len()).arg(keys).arg(args);
    cmd
}

fn named_cmd(name: &str, args: &[String]) -> redis::Cmd {
    let mut cmd = redis::cmd(name);
    cmd.arg(args);
    cmd
}

#[async_trait]
impl RedisClient for redis::aio::ConnectionManager {
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<RedisReply> {
        let mut conn = self.clone();
        let value: redis::Value = eval_cmd(script, keys, args).query_async(&mut conn).await?;
        Ok(value.into())
    }

    async fn command(&self, name: &str, args: &[String]) -> Result<RedisReply> {
        let mut conn = self.clone();
        let value: redis::Value = named_cmd(name, args).query_async(&mut conn).await?;
        Ok(value.into())
    }
}

#[async_trait]
impl RedisClient for redis::Client {
    async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<RedisReply> {
        let mut conn = self.get_multiplexed_async_connection().await.map_err(connection_failed)?;
        let value: redis::Value = eval_cmd(script, keys, args).query_async(&mut conn).await?;
        Ok(value.into())
    }

    async fn command(&self, name: &str, args: &[String]) -> Result<RedisReply> {
        let mut conn = self.get_multiplexed_async_connection().await.map_err(connection_failed)?;
        let value: redis::Value = named_cmd(name, args).query_async(&mut conn).await?;
        Ok(value.into())
    }
}

fn connection_failed(e: redis::RedisError) -> QueueError {
    QueueError::with_internal(
        ErrorCode::CacheConnectionFailed,
        "Failed to get Redis connection",
        e.to_string(),
    )
}

/// Open a managed connection that reconnects on failure.
pub async fn connect(url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).map_err(connection_failed)?;
    client.get_connection_manager().await.map_err(connection_failed)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scripts
// ═══════════════════════════════════════════════════════════════════════════════

// KEYS: lane, delayed, active, pending
// ARGV: payload, group ('' when none), availableAt (0 when not delayed)
const PUSH_SCRIPT: &str = r#"
local group = ARGV[2]
if group ~= '' then
  if redis.call('SISMEMBER', KEYS[3], group) == 1 then
    redis.call('RPUSH', KEYS[4], ARGV[1])
    return 'pending'
  end
  redis.call('SADD', KEYS[3], group)
end
local at = tonumber(ARGV[3])
if at > 0 then
  redis.call('ZADD', KEYS[2], at, ARGV[1])
  return 'delayed'
end
redis.call('RPUSH', KEYS[1], ARGV[1])
return 'queued'
"#;

// KEYS: delayed, paused, critical, high, default, low
// ARGV: now, then the four lane names in probe order
const POP_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due > 0 then
  redis.call('ZREM', KEYS[1], due[1])
  return due[1]
end
for i = 3, 6 do
  if redis.call('SISMEMBER', KEYS[2], ARGV[i - 1]) == 0 then
    local item = redis.call('LPOP', KEYS[i])
    if item then
      return item
    end
  end
end
return false
"#;

// KEYS: active, pending, critical, high, default, low, delayed
// ARGV: group, now
// Returns 0 when the group went idle, 1 when the next payload was queued,
// 2 when it was parked until its delay runs out.
const ADVANCE_SCRIPT: &str = r#"
local nextItem = redis.call('LPOP', KEYS[2])
if not nextItem then
  redis.call('SREM', KEYS[1], ARGV[1])
  return 0
end
local lane = KEYS[5]
local ok, decoded = pcall(cjson.decode, nextItem)
if ok and type(decoded) == 'table' then
  local delay = tonumber(decoded.delaySeconds) or 0
  if delay > 0 then
    local at = (tonumber(decoded.createdAt) or 0) + delay * 1000
    if at > tonumber(ARGV[2]) then
      redis.call('ZADD', KEYS[7], at, nextItem)
      return 2
    end
  end
  local p = decoded.priority
  if type(p) == 'number' then
    if p >= 300 then p = 'critical' elseif p >= 200 then p = 'high' elseif p >= 100 then p = 'normal' else p = 'low' end
  end
  if p == 'critical' then lane = KEYS[3] elseif p == 'high' then lane = KEYS[4] elseif p == 'low' then lane = KEYS[6] end
end
redis.call('RPUSH', lane, nextItem)
return 1
"#;

// KEYS: delayed, critical, high, default, low, active
// ARGV: group key prefix
const SIZE_SCRIPT: &str = r#"
local total = redis.call('ZCARD', KEYS[1])
for i = 2, 5 do
  total = total + redis.call('LLEN', KEYS[i])
end
for _, g in ipairs(redis.call('SMEMBERS', KEYS[6])) do
  total = total + redis.call('LLEN', ARGV[1] .. g .. ':pending')
end
return total
"#;

// KEYS: delayed, critical, high, default, low, active
// ARGV: group key prefix
const CLEAR_SCRIPT: &str = r#"
for _, g in ipairs(redis.call('SMEMBERS', KEYS[6])) do
  redis.call('DEL', ARGV[1] .. g .. ':pending')
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6])
return 1
"#;

// KEYS: dead
// ARGV: payload, cap
const DEAD_LETTER_SCRIPT: &str = r#"
redis.call('LPUSH', KEYS[1], ARGV[1])
redis.call('LTRIM', KEYS[1], 0, tonumber(ARGV[2]) - 1)
return 1
"#;

// KEYS: dead, lane, delayed, active, pending
// ARGV: original, payload, group ('' when none), availableAt (0 when not delayed)
// Moves the oldest dead letter back onto the queue in one step. Returns
// 'moved' without touching anything when the oldest entry is no longer
// `original`.
const RETRY_SCRIPT: &str = r#"
if redis.call('LINDEX', KEYS[1], -1) ~= ARGV[1] then
  return 'moved'
end
redis.call('RPOP', KEYS[1])
local group = ARGV[3]
if group ~= '' then
  if redis.call('SISMEMBER', KEYS[4], group) == 1 then
    redis.call('RPUSH', KEYS[5], ARGV[2])
    return 'pending'
  end
  redis.call('SADD', KEYS[4], group)
end
local at = tonumber(ARGV[4])
if at > 0 then
  redis.call('ZADD', KEYS[3], at, ARGV[2])
  return 'delayed'
end
redis.call('RPUSH', KEYS[2], ARGV[2])
return 'queued'
"#;

// KEYS: bucket key
// ARGV: ttl ms
const RATE_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

// ═══════════════════════════════════════════════════════════════════════════════
// Driver
// ═══════════════════════════════════════════════════════════════════════════════

/// Name of a lane inside the paused set.
pub fn lane_name(priority: JobPriority) -> &'static str {
    priority.lane_suffix().unwrap_or("default")
}

/// Builder for [`RedisDriver`].
#[derive(Default)]
pub struct RedisDriverBuilder {
    client: Option<Arc<dyn RedisClient>>,
    prefix: Option<String>,
    rate_limit: Option<RateLimit>,
    clock: Option<Arc<dyn Clock>>,
}

impl RedisDriverBuilder {
    pub fn client(mut self, client: Arc<dyn RedisClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<RedisDriver> {
        let client = self.client.ok_or_else(QueueError::redis_client_not_configured)?;
        Ok(RedisDriver {
            client,
            prefix: self.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            rate_limit: self.rate_limit,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}

/// Driver over a [`RedisClient`].
pub struct RedisDriver {
    client: Arc<dyn RedisClient>,
    prefix: String,
    rate_limit: Option<RateLimit>,
    clock: Arc<dyn Clock>,
}

impl RedisDriver {
    pub fn builder() -> RedisDriverBuilder {
        RedisDriverBuilder::default()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn base(&self, queue: &str) -> String {
        format!("{}{}", self.prefix, queue)
    }

    fn lane_key(&self, queue: &str, priority: JobPriority) -> String {
        match priority.lane_suffix() {
            Some(suffix) => format!("{}:{}", self.base(queue), suffix),
            None => self.base(queue),
        }
    }

    /// Lane keys in probe order.
    fn lane_keys(&self, queue: &str) -> Vec<String> {
        JobPriority::PROBE_ORDER
            .iter()
            .map(|p| self.lane_key(queue, *p))
            .collect()
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:delayed", self.base(queue))
    }

    fn paused_key(&self, queue: &str) -> String {
        format!("{}:paused", self.base(queue))
    }

    fn active_key(&self, queue: &str) -> String {
        format!("{}:groups:active", self.base(queue))
    }

    fn group_prefix(&self, queue: &str) -> String {
        format!("{}:group:", self.base(queue))
    }

    fn pending_key(&self, queue: &str, group: &str) -> String {
        format!("{}{}:pending", self.group_prefix(queue), group)
    }

    fn dead_key(&self, queue: &str) -> String {
        format!("{}:dead", self.base(queue))
    }

    fn rate_key(&self, queue: &str, bucket: i64) -> String {
        format!("{}:rate:{}", self.base(queue), bucket)
    }

    /// Skip `lane` on every pop until resumed.
    pub async fn pause_lane(&self, queue: &str, lane: JobPriority) -> Result<()> {
        self.client
            .command("SADD", &[self.paused_key(queue), lane_name(lane).to_string()])
            .await?;
        tracing::info!(queue = %queue, lane = lane_name(lane), "Lane paused");
        Ok(())
    }

    pub async fn resume_lane(&self, queue: &str, lane: JobPriority) -> Result<()> {
        self.client
            .command("SREM", &[self.paused_key(queue), lane_name(lane).to_string()])
            .await?;
        tracing::info!(queue = %queue, lane = lane_name(lane), "Lane resumed");
        Ok(())
    }

    async fn advance_group(&self, queue: &str, group: &str) -> Result<()> {
        let mut keys = vec![self.active_key(queue), self.pending_key(queue, group)];
        keys.extend(self.lane_keys(queue));
        keys.push(self.delayed_key(queue));
        let args = vec![group.to_string(), self.clock.now_ms().to_string()];
        let moved = self.client.eval(ADVANCE_SCRIPT, &keys, &args).await?;
        tracing::debug!(
            queue = %queue,
            group = %group,
            promoted = moved.as_int() == Some(1),
            parked = moved.as_int() == Some(2),
            "Group advanced"
        );
        Ok(())
    }

    /// Keys and arguments shared by the push and retry scripts.
    fn placement(&self, queue: &str, payload: &Payload) -> Result<(Vec<String>, Vec<String>)> {
        let priority = payload.priority.unwrap_or_default();
        let group = payload.group_id.clone().unwrap_or_default();
        let pending = if group.is_empty() {
            String::new()
        } else {
            self.pending_key(queue, &group)
        };
        let available_at = if payload.delay_seconds.unwrap_or(0) > 0 {
            payload.available_at()
        } else {
            0
        };

        let keys = vec![
            self.lane_key(queue, priority),
            self.delayed_key(queue),
            self.active_key(queue),
            pending,
        ];
        let args = vec![payload.to_json()?, group, available_at.to_string()];
        Ok((keys, args))
    }

    fn parse(reply: RedisReply) -> Result<Option<Payload>> {
        match reply.into_text() {
            Some(raw) => Payload::from_json(&raw).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Driver for RedisDriver {
    fn name(&self) -> &str {
        "redis"
    }

    async fn push(&self, queue: &str, payload: Payload) -> Result<()> {
        let (keys, args) = self.placement(queue, &payload)?;
        let placed = self.client.eval(PUSH_SCRIPT, &keys, &args).await?;
        tracing::debug!(
            queue = %queue,
            job_id = %payload.id,
            placement = placed.into_text().as_deref().unwrap_or("queued"),
            "Payload pushed"
        );
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Payload>> {
        let mut keys = vec![self.delayed_key(queue), self.paused_key(queue)];
        keys.extend(self.lane_keys(queue));
        let mut args = vec![self.clock.now_ms().to_string()];
        args.extend(JobPriority::PROBE_ORDER.iter().map(|p| lane_name(*p).to_string()));

        let reply = self.client.eval(POP_SCRIPT, &keys, &args).await?;
        Self::parse(reply)
    }

    async fn size(&self, queue: &str) -> Result<u64> {
        let mut keys = vec![self.delayed_key(queue)];
        keys.extend(self.lane_keys(queue));
        keys.push(self.active_key(queue));
        let reply = self
            .client
            .eval(SIZE_SCRIPT, &keys, &[self.group_prefix(queue)])
            .await?;
        Ok(reply.as_int().unwrap_or(0).max(0) as u64)
    }

    async fn clear(&self, queue: &str) -> Result<()> {
        let mut keys = vec![self.delayed_key(queue)];
        keys.extend(self.lane_keys(queue));
        keys.push(self.active_key(queue));
        self.client
            .eval(CLEAR_SCRIPT, &keys, &[self.group_prefix(queue)])
            .await?;
        Ok(())
    }

    async fn complete(&self, queue: &str, payload: &Payload) -> Result<()> {
        match &payload.group_id {
            Some(group) => self.advance_group(queue, group).await,
            None => Ok(()),
        }
    }

    async fn fail(&self, queue: &str, payload: &Payload) -> Result<()> {
        self.client
            .eval(
                DEAD_LETTER_SCRIPT,
                &[self.dead_key(queue)],
                &[payload.to_json()?, DEAD_LETTER_CAP.to_string()],
            )
            .await?;
        if let Some(group) = &payload.group_id {
            self.advance_group(queue, group).await?;
        }
        Ok(())
    }

    fn as_batch(&self) -> Option<&dyn BatchDriver> {
        Some(self)
    }

    fn as_dead_letter(&self) -> Option<&dyn DeadLetterDriver> {
        Some(self)
    }

    fn as_rate_limited(&self) -> Option<&dyn RateLimitedDriver> {
        Some(self)
    }
}

#[async_trait]
impl BatchDriver for RedisDriver {
    async fn push_many(&self, queue: &str, payloads: Vec<Payload>) -> Result<()> {
        for payload in payloads {
            self.push(queue, payload).await?;
        }
        Ok(())
    }

    async fn pop_many(&self, queue: &str, max: usize) -> Result<Vec<Payload>> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.pop(queue).await? {
                Some(payload) => out.push(payload),
                None => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DeadLetterDriver for RedisDriver {
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<Payload>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let reply = self
            .client
            .command(
                "LRANGE",
                &[self.dead_key(queue), "0".to_string(), (limit - 1).to_string()],
            )
            .await?;
        reply
            .into_array()
            .into_iter()
            .filter_map(RedisReply::into_text)
            .map(|raw| Payload::from_json(&raw))
            .collect()
    }

    async fn retry_dead_letter(&self, queue: &str) -> Result<Option<Payload>> {
        loop {
            let reply = self
                .client
                .command("LINDEX", &[self.dead_key(queue), "-1".to_string()])
                .await?;
            let Some(original) = reply.into_text() else {
                return Ok(None);
            };
            let mut payload = Payload::from_json(&original)?;
            payload.reset_for_retry();

            let (lane_keys, placement_args) = self.placement(queue, &payload)?;
            let mut keys = vec![self.dead_key(queue)];
            keys.extend(lane_keys);
            let mut args = vec![original];
            args.extend(placement_args);

            let placed = self.client.eval(RETRY_SCRIPT, &keys, &args).await?;
            match placed.into_text().as_deref() {
                // another caller took this entry first
                Some("moved") => continue,
                placement => {
                    tracing::info!(
                        queue = %queue,
                        job_id = %payload.id,
                        placement = placement.unwrap_or("queued"),
                        "Dead letter re-queued"
                    );
                    return Ok(Some(payload));
                }
            }
        }
    }

    async fn purge_dead_letters(&self, queue: &str) -> Result<u64> {
        let purged = self.dead_letter_size(queue).await?;
        self.client.command("DEL", &[self.dead_key(queue)]).await?;
        Ok(purged)
    }

    async fn dead_letter_size(&self, queue: &str) -> Result<u64> {
        let reply = self.client.command("LLEN", &[self.dead_key(queue)]).await?;
        Ok(reply.as_int().unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl RateLimitedDriver for RedisDriver {
    fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit
    }

    async fn hit(&self, queue: &str, limit: RateLimit) -> Result<RateLimitStatus> {
        let window = limit.window_ms.max(1);
        let bucket = self.clock.now_ms().div_euclid(window as i64);
        let ttl = window + 1000;
        let reply = self
            .client
            .eval(RATE_SCRIPT, &[self.rate_key(queue, bucket)], &[ttl.to_string()])
            .await?;
        let count = reply.as_int().unwrap_or(0).max(0) as u64;
        Ok(RateLimitStatus {
            allowed: count <= limit.max,
            count,
            limit: limit.max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::ManualClock;
    use parking_lot::Mutex;

    /// Records calls and replays canned replies.
    #[derive(Default)]
    struct ScriptedClient {
        calls: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
        replies: Mutex<Vec<RedisReply>>,
    }

    impl ScriptedClient {
        fn reply(&self) -> RedisReply {
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                RedisReply::Nil
            } else {
                replies.remove(0)
            }
        }
    }

    #[async_trait]
    impl RedisClient for ScriptedClient {
        async fn eval(&self, script: &str, keys: &[String], args: &[String]) -> Result<RedisReply> {
            self.calls
                .lock()
                .push((script.to_string(), keys.to_vec(), args.to_vec()));
            Ok(self.reply())
        }

        async fn command(&self, name: &str, args: &[String]) -> Result<RedisReply> {
            self.calls
                .lock()
                .push((name.to_string(), Vec::new(), args.to_vec()));
            Ok(self.reply())
        }
    }

    fn driver(client: Arc<ScriptedClient>, now: i64) -> RedisDriver {
        RedisDriver::builder()
            .client(client)
            .prefix("q:")
            .clock(Arc::new(ManualClock::new(now)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_client() {
        let err = RedisDriver::builder().build().err().unwrap();
        assert_eq!(err.code(), ErrorCode::RedisClientNotConfigured);
    }

    #[test]
    fn test_lane_keys_in_probe_order() {
        let d = driver(Arc::new(ScriptedClient::default()), 0);
        assert_eq!(
            d.lane_keys("mail"),
            vec!["q:mail:critical", "q:mail:high", "q:mail", "q:mail:low"]
        );
        assert_eq!(d.pending_key("mail", "u1"), "q:mail:group:u1:pending");
    }

    #[tokio::test]
    async fn test_push_routes_lane_group_and_delay() {
        use crate::jobs::payload::PayloadKind;
        let client = Arc::new(ScriptedClient::default());
        let d = driver(client.clone(), 0);

        let mut payload = Payload::new(PayloadKind::Plain, "{}", 5_000);
        payload.priority = Some(JobPriority::High);
        payload.group_id = Some("u1".into());
        payload.delay_seconds = Some(2);
        d.push("mail", payload).await.unwrap();

        let calls = client.calls.lock();
        let (_, keys, args) = &calls[0];
        assert_eq!(keys[0], "q:mail:high");
        assert_eq!(keys[3], "q:mail:group:u1:pending");
        assert_eq!(args[1], "u1");
        assert_eq!(args[2], "7000");
    }

    #[tokio::test]
    async fn test_pop_decodes_reply() {
        use crate::jobs::payload::PayloadKind;
        let client = Arc::new(ScriptedClient::default());
        let payload = Payload::new(PayloadKind::Plain, "{}", 1);
        client
            .replies
            .lock()
            .push(RedisReply::Text(payload.to_json().unwrap()));
        let d = driver(client.clone(), 42);

        assert_eq!(d.pop("mail").await.unwrap().unwrap().id, payload.id);
        assert!(d.pop("mail").await.unwrap().is_none());
        let calls = client.calls.lock();
        assert_eq!(calls[0].2, vec!["42", "critical", "high", "default", "low"]);
    }

    #[tokio::test]
    async fn test_complete_advances_group_with_clock() {
        use crate::jobs::payload::PayloadKind;
        let client = Arc::new(ScriptedClient::default());
        client.replies.lock().push(RedisReply::Int(2));
        let d = driver(client.clone(), 9_000);

        let mut payload = Payload::new(PayloadKind::Plain, "{}", 1_000);
        payload.group_id = Some("u1".into());
        d.complete("mail", &payload).await.unwrap();

        let calls = client.calls.lock();
        assert_eq!(calls.len(), 1);
        let (script, keys, args) = &calls[0];
        assert_eq!(script, ADVANCE_SCRIPT);
        assert_eq!(keys[1], "q:mail:group:u1:pending");
        assert_eq!(keys[6], "q:mail:delayed");
        assert_eq!(args, &vec!["u1".to_string(), "9000".to_string()]);
    }

    #[tokio::test]
    async fn test_retry_dead_letter_is_one_script() {
        use crate::jobs::payload::PayloadKind;
        let client = Arc::new(ScriptedClient::default());
        let mut dead = Payload::new(PayloadKind::Plain, "{}", 1_000);
        dead.priority = Some(JobPriority::Low);
        dead.mark_failed("boom", 2_000);
        let original = dead.to_json().unwrap();
        client.replies.lock().extend([
            RedisReply::Text(original.clone()),
            RedisReply::Text("queued".into()),
        ]);
        let d = driver(client.clone(), 3_000);

        let retried = d.retry_dead_letter("mail").await.unwrap().unwrap();
        assert_eq!(retried.id, dead.id);
        assert!(retried.error.is_none());
        assert_eq!(retried.attempts, 0);

        let calls = client.calls.lock();
        // one read, then the removal and re-queue together
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "LINDEX");
        assert!(!calls.iter().any(|(name, _, _)| name == "RPOP"));
        let (script, keys, args) = &calls[1];
        assert_eq!(script, RETRY_SCRIPT);
        assert_eq!(keys[0], "q:mail:dead");
        assert_eq!(keys[1], "q:mail:low");
        assert_eq!(args[0], original);
        assert!(Payload::from_json(&args[1]).unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_retry_dead_letter_rereads_after_race() {
        use crate::jobs::payload::PayloadKind;
        let client = Arc::new(ScriptedClient::default());
        let dead = Payload::new(PayloadKind::Plain, "{}", 1_000);
        client.replies.lock().extend([
            RedisReply::Text(dead.to_json().unwrap()),
            RedisReply::Text("moved".into()),
            RedisReply::Nil,
        ]);
        let d = driver(client.clone(), 3_000);

        assert!(d.retry_dead_letter("mail").await.unwrap().is_none());
        assert_eq!(client.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let client = Arc::new(ScriptedClient::default());
        client.replies.lock().extend([RedisReply::Int(3), RedisReply::Int(4)]);
        let d = driver(client.clone(), 125_000);
        let limit = RateLimit { max: 3, window_ms: 60_000 };

        assert!(d.hit("mail", limit).await.unwrap().allowed);
        let status = d.hit("mail", limit).await.unwrap();
        assert!(!status.allowed);
        assert_eq!(status.count, 4);

        let calls = client.calls.lock();
        assert_eq!(calls[0].1, vec!["q:mail:rate:2"]);
        assert_eq!(calls[0].2, vec!["61000"]);
    }

    #[test]
    fn test_reply_from_value() {
        let value = redis::Value::Bulk(vec![
            redis::Value::Data(b"a".to_vec()),
            redis::Value::Int(2),
            redis::Value::Nil,
        ]);
        assert_eq!(
            RedisReply::from(value),
            RedisReply::Array(vec![
                RedisReply::Text("a".into()),
                RedisReply::Int(2),
                RedisReply::Nil
            ])
        );
    }
}
