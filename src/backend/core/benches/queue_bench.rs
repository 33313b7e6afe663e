//! Benchmarks for the in-memory queue path.
use async_trait::async_trait;
use conveyor_core::drivers::{Driver, MemoryDriver};
use conveyor_core::jobs::{
    next_occurrence, snapshot, Job, JobContext, JobPriority, JobRegistry, JobResult, JobType, Payload, QueuedJob,
    Serializer, TaggedSerializer,
};
use conveyor_core::manager::QueueManager;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    seq: u64,
    body: String,
}

#[async_trait]
impl Job for Ping {
    fn name(&self) -> &str { Self::NAME }
    async fn handle(&self, _ctx: &JobContext) -> JobResult { Ok(()) }
    fn properties(&self) -> conveyor_core::Result<serde_json::Value> { snapshot(self) }
}

impl JobType for Ping {
    const NAME: &'static str = "ping";
}

fn ping(seq: u64) -> QueuedJob {
    QueuedJob::new(Ping { seq, body: "x".repeat(64) })
}

fn serializer() -> TaggedSerializer {
    let mut registry = JobRegistry::new();
    registry.register::<Ping>().unwrap();
    TaggedSerializer::new(registry)
}

fn manager(driver: Arc<MemoryDriver>) -> QueueManager {
    QueueManager::builder().connection("default", driver).serializer(Arc::new(serializer())).build()
}

fn bench_serializer(c: &mut Criterion) {
    let mut group = c.benchmark_group("tagged_serializer");
    let serializer = serializer();
    let job = ping(1);
    let payload = serializer.serialize(&job).unwrap();
    let wire = payload.to_json().unwrap();
    group.bench_function("serialize", |b| { b.iter(|| black_box(serializer.serialize(&job).unwrap())); });
    group.bench_function("deserialize", |b| { b.iter(|| black_box(serializer.deserialize(&payload).unwrap())); });
    group.bench_function("wire_decode", |b| { b.iter(|| black_box(Payload::from_json(&wire).unwrap())); });
    group.finish();
}

fn bench_memory_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_push_pop");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for n in [100u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let driver = Arc::new(MemoryDriver::new());
            let manager = manager(driver.clone());
            b.iter(|| { rt.block_on(async {
                for i in 0..n { manager.push(ping(i)).await.unwrap(); }
                while let Some(payload) = driver.pop("default").await.unwrap() { driver.complete("default", &payload).await.unwrap(); }
            }); });
        });
    }
    group.finish();
}

fn bench_memory_priority_pop(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("memory_priority_pop_1000", |b| {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager(driver.clone());
        let priorities = [JobPriority::Low, JobPriority::Normal, JobPriority::High, JobPriority::Critical];
        b.iter(|| { rt.block_on(async {
            for i in 0..1_000u64 { manager.push(ping(i).priority(priorities[(i % 4) as usize])).await.unwrap(); }
            while let Some(payload) = driver.pop("default").await.unwrap() { black_box(payload); }
        }); });
    });
}

fn bench_memory_bulk(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("memory_bulk_1000", |b| {
        let driver = Arc::new(MemoryDriver::new());
        let manager = manager(driver.clone());
        b.iter(|| { rt.block_on(async {
            manager.bulk((0..1_000).map(ping).collect()).await.unwrap();
            driver.clear("default").await.unwrap();
        }); });
    });
}

fn bench_cron(c: &mut Criterion) {
    let mut group = c.benchmark_group("cron_next_occurrence");
    for expr in ["* * * * *", "*/15 9-17 * * 1-5", "0 0 1 * *"] {
        group.bench_with_input(BenchmarkId::from_parameter(expr), &expr, |b, e| { b.iter(|| black_box(next_occurrence(e, 1_700_000_000_000).unwrap())); });
    }
    group.finish();
}

criterion_group!(benches, bench_serializer, bench_memory_push_pop, bench_memory_priority_pop, bench_memory_bulk, bench_cron);
criterion_main!(benches);
