//! Redis driver and schedule store against a live server.
//!
//! Every test returns early unless `REDIS_URL` is set, e.g.
//! `REDIS_URL=redis://localhost:6379 cargo test --test redis_tests`.
//!
//! Tests cover:
//! - FIFO push and pop
//! - Priority lanes probed critical first, low last
//! - Paused lanes skipped until resumed
//! - Delayed payloads promoted once due
//! - Group FIFO released on completion
//! - Delayed payloads waiting behind their group stay hidden until due
//! - Dead-letter retry
//! - Dead-letter list capped, oldest entries dropped
//! - Schedule store locks

use conveyor_core::drivers::{redis::connect, Driver, RedisDriver, DEAD_LETTER_CAP};
use conveyor_core::jobs::{
    JobPriority, Payload, PayloadKind, RedisScheduleStore, ScheduleStore, ScheduledDefinition,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn driver() -> Option<RedisDriver> {
    let url = std::env::var("REDIS_URL").ok()?;
    let client = connect(&url).await.unwrap();
    let prefix = format!("conveyor-test-{}:", Uuid::new_v4());
    Some(RedisDriver::builder().client(Arc::new(client)).prefix(prefix).build().unwrap())
}

fn payload(label: &str) -> Payload {
    Payload::new(
        PayloadKind::Plain,
        format!(r#"{{"job":"ping","properties":{{"label":"{}"}}}}"#, label),
        chrono::Utc::now().timestamp_millis(),
    )
}

#[tokio::test]
async fn test_fifo() {
    let Some(driver) = driver().await else { return };
    for label in ["1", "2", "3"] {
        driver.push("q", payload(label)).await.unwrap();
    }
    assert_eq!(driver.size("q").await.unwrap(), 3);
    for label in ["1", "2", "3"] {
        let popped = driver.pop("q").await.unwrap().unwrap();
        assert!(popped.data.contains(label));
        driver.complete("q", &popped).await.unwrap();
    }
    assert!(driver.pop("q").await.unwrap().is_none());
    driver.clear("q").await.unwrap();
}

fn prioritized(label: &str, priority: JobPriority) -> Payload {
    let mut payload = payload(label);
    payload.priority = Some(priority);
    payload
}

#[tokio::test]
async fn test_priority_lane_order() {
    let Some(driver) = driver().await else { return };
    for (label, priority) in [
        ("low", JobPriority::Low),
        ("normal", JobPriority::Normal),
        ("high", JobPriority::High),
        ("critical", JobPriority::Critical),
    ] {
        driver.push("q", prioritized(label, priority)).await.unwrap();
    }

    for expected in ["critical", "high", "normal", "low"] {
        let popped = driver.pop("q").await.unwrap().unwrap();
        assert!(popped.data.contains(&format!("\"{}\"", expected)), "{}", popped.data);
    }
    assert!(driver.pop("q").await.unwrap().is_none());
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_paused_lane_skipped() {
    let Some(driver) = driver().await else { return };
    driver.push("q", prioritized("urgent", JobPriority::Critical)).await.unwrap();
    driver.push("q", prioritized("slow", JobPriority::Low)).await.unwrap();

    driver.pause_lane("q", JobPriority::Critical).await.unwrap();
    let popped = driver.pop("q").await.unwrap().unwrap();
    assert!(popped.data.contains("slow"));
    assert!(driver.pop("q").await.unwrap().is_none());
    // paused work still counts toward the size
    assert_eq!(driver.size("q").await.unwrap(), 1);

    driver.resume_lane("q", JobPriority::Critical).await.unwrap();
    let popped = driver.pop("q").await.unwrap().unwrap();
    assert!(popped.data.contains("urgent"));
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_delayed_payload() {
    let Some(driver) = driver().await else { return };
    let mut delayed = payload("later");
    delayed.delay_seconds = Some(1);
    driver.push("q", delayed).await.unwrap();

    assert!(driver.pop("q").await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(driver.pop("q").await.unwrap().is_some());
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_group_released_on_complete() {
    let Some(driver) = driver().await else { return };
    for label in ["a", "b"] {
        let mut grouped = payload(label);
        grouped.group_id = Some("g".into());
        driver.push("q", grouped).await.unwrap();
    }

    let a = driver.pop("q").await.unwrap().unwrap();
    assert!(driver.pop("q").await.unwrap().is_none());
    driver.complete("q", &a).await.unwrap();
    let b = driver.pop("q").await.unwrap().unwrap();
    assert!(b.data.contains("\"b\""));
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_group_advance_respects_delay() {
    let Some(driver) = driver().await else { return };
    let mut first = payload("a");
    first.group_id = Some("g".into());
    let mut second = payload("b");
    second.group_id = Some("g".into());
    second.delay_seconds = Some(60);
    driver.push("q", first).await.unwrap();
    driver.push("q", second).await.unwrap();

    let a = driver.pop("q").await.unwrap().unwrap();
    assert!(a.data.contains("\"a\""));
    driver.complete("q", &a).await.unwrap();

    // b is parked until createdAt + 60s, not released with the group
    assert!(driver.pop("q").await.unwrap().is_none());
    assert_eq!(driver.size("q").await.unwrap(), 1);
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_group_advance_releases_elapsed_delay() {
    let Some(driver) = driver().await else { return };
    let mut first = payload("a");
    first.group_id = Some("g".into());
    let mut second = payload("b");
    second.group_id = Some("g".into());
    second.delay_seconds = Some(1);
    driver.push("q", first).await.unwrap();
    driver.push("q", second).await.unwrap();

    let a = driver.pop("q").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    driver.complete("q", &a).await.unwrap();

    let b = driver.pop("q").await.unwrap().unwrap();
    assert!(b.data.contains("\"b\""));
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_dead_letter_retry() {
    let Some(driver) = driver().await else { return };
    driver.push("q", payload("doomed")).await.unwrap();
    let mut popped = driver.pop("q").await.unwrap().unwrap();
    popped.mark_failed("boom", chrono::Utc::now().timestamp_millis());
    driver.fail("q", &popped).await.unwrap();

    let dead = driver.as_dead_letter().unwrap();
    assert_eq!(dead.dead_letter_size("q").await.unwrap(), 1);
    let retried = dead.retry_dead_letter("q").await.unwrap().unwrap();
    assert!(retried.error.is_none());
    assert_eq!(driver.size("q").await.unwrap(), 1);
    dead.purge_dead_letters("q").await.unwrap();
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_dead_letter_cap() {
    let Some(driver) = driver().await else { return };
    for i in 0..DEAD_LETTER_CAP + 5 {
        let mut dead = payload(&format!("n{:05}", i));
        dead.mark_failed("boom", 0);
        driver.fail("q", &dead).await.unwrap();
    }

    let dead = driver.as_dead_letter().unwrap();
    assert_eq!(dead.dead_letter_size("q").await.unwrap(), DEAD_LETTER_CAP as u64);
    let newest = dead.dead_letters("q", 1).await.unwrap();
    assert!(newest[0].data.contains(&format!("n{:05}", DEAD_LETTER_CAP + 4)));
    // the five oldest were trimmed, so retry starts at the sixth
    let retried = dead.retry_dead_letter("q").await.unwrap().unwrap();
    assert!(retried.data.contains("n00005"));
    dead.purge_dead_letters("q").await.unwrap();
    driver.clear("q").await.unwrap();
}

#[tokio::test]
async fn test_schedule_store_lock() {
    let Ok(url) = std::env::var("REDIS_URL") else { return };
    let client = Arc::new(connect(&url).await.unwrap());
    let prefix = format!("conveyor-test-{}:", Uuid::new_v4());
    let store = RedisScheduleStore::new(client).with_prefix(prefix);

    let template = payload("tick");
    let definition = ScheduledDefinition::new("nightly", "0 0 * * *", "q", template, 0).unwrap();
    store.save(&definition).await.unwrap();
    assert_eq!(store.due(definition.next_run).await.unwrap(), vec!["nightly".to_string()]);

    assert!(store.try_lock("nightly:1", Duration::from_secs(10)).await.unwrap());
    assert!(!store.try_lock("nightly:1", Duration::from_secs(10)).await.unwrap());

    assert!(store.remove("nightly").await.unwrap());
    assert!(store.get("nightly").await.unwrap().is_none());
}
