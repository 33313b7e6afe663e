//! Queue behavior through the manager and the in-memory driver.
//!
//! Tests cover:
//! - FIFO order without delay, group or priority
//! - Delay visibility against an injected clock
//! - Group FIFO across complete and fail
//! - Priority lanes
//! - Idempotent clear
//! - Tagged and plain serializer round trips
//! - Dead-letter retry and purge

use async_trait::async_trait;
use conveyor_core::drivers::{Driver, MemoryDriver};
use conveyor_core::error::ErrorCode;
use conveyor_core::jobs::{
    snapshot, Clock, Job, JobContext, JobPriority, JobRegistry, JobResult, JobType, ManualClock, Payload,
    PayloadKind, PlainData, PlainSerializer, QueuedJob, Serializer, TaggedData, TaggedSerializer,
};
use conveyor_core::manager::QueueManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Email {
    to: String,
}

#[async_trait]
impl Job for Email {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, _ctx: &JobContext) -> JobResult {
        Ok(())
    }

    fn properties(&self) -> conveyor_core::Result<serde_json::Value> {
        snapshot(self)
    }
}

impl JobType for Email {
    const NAME: &'static str = "email";
}

fn email(to: &str) -> QueuedJob {
    QueuedJob::new(Email { to: to.to_string() })
}

fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register::<Email>().unwrap();
    registry
}

fn manager_with(driver: Arc<MemoryDriver>, clock: &ManualClock) -> QueueManager {
    QueueManager::builder()
        .connection("default", driver)
        .serializer(Arc::new(
            TaggedSerializer::new(registry()).with_clock(Arc::new(clock.clone())),
        ))
        .serializer(Arc::new(PlainSerializer::new().with_clock(Arc::new(clock.clone()))))
        .build()
}

fn setup() -> (QueueManager, Arc<MemoryDriver>, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let driver = Arc::new(MemoryDriver::new().with_clock(Arc::new(clock.clone())));
    (manager_with(driver.clone(), &clock), driver, clock)
}

async fn pop_to(manager: &QueueManager, queue: &str) -> Option<String> {
    let payload = manager.pop(queue, None).await.unwrap()?;
    let job = manager.deserialize(&payload).unwrap();
    Some(job.job.properties().unwrap()["to"].as_str().unwrap().to_string())
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_fifo_order() {
    let (manager, _, _) = setup();
    for i in 0..10 {
        manager.push(email(&i.to_string())).await.unwrap();
    }
    for i in 0..10 {
        assert_eq!(pop_to(&manager, "default").await.as_deref(), Some(i.to_string().as_str()));
    }
    assert!(manager.pop("default", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delay_hides_until_due() {
    let (manager, _, clock) = setup();
    manager.push(email("later").delay(5)).await.unwrap();

    assert!(manager.pop("default", None).await.unwrap().is_none());
    clock.advance(Duration::from_millis(4_999));
    assert!(manager.pop("default", None).await.unwrap().is_none());
    clock.advance(Duration::from_millis(1));
    assert_eq!(pop_to(&manager, "default").await.as_deref(), Some("later"));
}

#[tokio::test]
async fn test_group_fifo_one_at_a_time() {
    let (manager, driver, _) = setup();
    manager.push(email("a").group("g")).await.unwrap();
    manager.push(email("b").group("g")).await.unwrap();
    manager.push(email("c").group("g")).await.unwrap();
    manager.push(email("free")).await.unwrap();

    let a = manager.pop("default", None).await.unwrap().unwrap();
    assert_eq!(a.group_id.as_deref(), Some("g"));
    // b and c wait behind a; ungrouped work still flows
    assert_eq!(pop_to(&manager, "default").await.as_deref(), Some("free"));
    assert!(manager.pop("default", None).await.unwrap().is_none());

    driver.complete("default", &a).await.unwrap();
    let b = manager.pop("default", None).await.unwrap().unwrap();
    assert!(manager.pop("default", None).await.unwrap().is_none());

    // a terminal failure releases the group too
    driver.fail("default", &b).await.unwrap();
    assert_eq!(pop_to(&manager, "default").await.as_deref(), Some("c"));
}

#[tokio::test]
async fn test_priority_lanes() {
    for critical_first in [true, false] {
        let (manager, _, _) = setup();
        let low = email("low").priority(JobPriority::Low);
        let critical = email("critical").priority(JobPriority::Critical);
        if critical_first {
            manager.push(critical).await.unwrap();
            manager.push(low).await.unwrap();
        } else {
            manager.push(low).await.unwrap();
            manager.push(critical).await.unwrap();
        }
        assert_eq!(pop_to(&manager, "default").await.as_deref(), Some("critical"));
        assert_eq!(pop_to(&manager, "default").await.as_deref(), Some("low"));
    }
}

#[tokio::test]
async fn test_clear_is_idempotent() {
    let (manager, _, _) = setup();
    manager.push(email("x")).await.unwrap();
    manager.push(email("y").group("g")).await.unwrap();
    manager.clear("default", None).await.unwrap();
    manager.clear("default", None).await.unwrap();

    assert_eq!(manager.size("default", None).await.unwrap(), 0);
    assert!(manager.pop("default", None).await.unwrap().is_none());
    manager.clear("never-used", None).await.unwrap();
}

// ============================================================================
// Serialization
// ============================================================================

#[tokio::test]
async fn test_round_trip_email_scenario() {
    let (manager, _, _) = setup();
    manager.push(email("a@x.com").on_queue("default").delay(0)).await.unwrap();

    let payload = manager.pop("default", None).await.unwrap().unwrap();
    assert_eq!(payload.kind, PayloadKind::Tagged);
    assert_eq!(payload.class_name.as_deref(), Some("email"));
    assert!(payload.delay_seconds.is_none());

    let data: TaggedData = serde_json::from_str(&payload.data).unwrap();
    assert_eq!(data.class, "email");
    assert_eq!(data.properties["to"], "a@x.com");

    let job = manager.deserialize(&payload).unwrap();
    assert_eq!(job.name(), "email");
    assert_eq!(job.job.properties().unwrap()["to"], "a@x.com");
}

#[test]
fn test_wire_json_is_camel_case() {
    let serializer = TaggedSerializer::new(registry());
    let payload = serializer.serialize(&email("w").delay(3).group("g")).unwrap();
    let wire: serde_json::Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();
    assert_eq!(wire["delaySeconds"], 3);
    assert_eq!(wire["groupId"], "g");
    assert!(wire.get("createdAt").is_some());
    assert!(wire.get("maxAttempts").is_none());
    assert!(wire["data"].is_string());

    let capped = serializer.serialize(&email("w").max_attempts(2)).unwrap();
    let wire: serde_json::Value = serde_json::from_str(&capped.to_json().unwrap()).unwrap();
    assert_eq!(wire["maxAttempts"], 2);
}

#[tokio::test]
async fn test_plain_serializer_keeps_state_only() {
    let (manager, _, _) = setup();
    manager
        .push_with(email("plain@x.com"), PayloadKind::Plain)
        .await
        .unwrap();
    let payload = manager.pop("default", None).await.unwrap().unwrap();
    assert_eq!(payload.kind, PayloadKind::Plain);

    let data: PlainData = serde_json::from_str(&payload.data).unwrap();
    assert_eq!(data.job, "email");

    let inspected = manager.deserialize(&payload).unwrap();
    assert_eq!(inspected.job.properties().unwrap()["to"], "plain@x.com");
    let err = inspected.job.handle(&JobContext::new("email")).await.unwrap_err();
    assert!(!err.retryable);
}

#[tokio::test]
async fn test_unknown_tagged_type() {
    let (manager, _, _) = setup();
    let mut payload = Payload::new(
        PayloadKind::Tagged,
        r#"{"class":"nope","properties":{}}"#,
        0,
    );
    payload.class_name = Some("nope".into());
    let err = manager.deserialize(&payload).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeserializationError);
}

// ============================================================================
// Dead letters
// ============================================================================

#[tokio::test]
async fn test_dead_letter_retry_and_purge() {
    let (manager, driver, clock) = setup();
    let dead = driver.as_dead_letter().unwrap();

    for to in ["one", "two", "three"] {
        manager.push(email(to)).await.unwrap();
        let mut payload = manager.pop("default", None).await.unwrap().unwrap();
        payload.mark_failed("boom", clock.now_ms());
        driver.fail("default", &payload).await.unwrap();
    }

    let listed = dead.dead_letters("default", 10).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].error.as_deref(), Some("boom"));

    // oldest comes back first, with failure state cleared
    let retried = dead.retry_dead_letter("default").await.unwrap().unwrap();
    assert!(retried.error.is_none());
    assert_eq!(pop_to(&manager, "default").await.as_deref(), Some("one"));

    assert_eq!(dead.purge_dead_letters("default").await.unwrap(), 2);
    assert_eq!(dead.dead_letter_size("default").await.unwrap(), 0);
}
