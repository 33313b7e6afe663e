//! Runs several consumers side by side in one process.
//!
//! `finished` and `shutdown` never touch the join handles, so either can lose
//! a `select!` without dropping consumer results. Collect those with `wait`.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::clock::Clock;
use super::consumer::{Consumer, ConsumerConfig};
use super::worker::Worker;
use crate::archive::Archive;
use crate::error::{QueueError, Result};
use crate::manager::QueueManager;

/// Builder for [`WorkerProcess`].
pub struct WorkerProcessBuilder {
    manager: Arc<QueueManager>,
    worker: Arc<Worker>,
    config: ConsumerConfig,
    workers: usize,
    archive: Option<Arc<dyn Archive>>,
    clock: Option<Arc<dyn Clock>>,
}

impl WorkerProcessBuilder {
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of consumers; at least one runs.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn archive(mut self, archive: Arc<dyn Archive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> WorkerProcess {
        let consumers = (0..self.workers)
            .map(|i| {
                let mut config = self.config.clone();
                config.name = format!("{}-{}", self.config.name, i);
                let mut consumer = Consumer::new(self.manager.clone(), self.worker.clone(), config);
                if let Some(archive) = &self.archive {
                    consumer = consumer.with_archive(archive.clone());
                }
                if let Some(clock) = &self.clock {
                    consumer = consumer.with_clock(clock.clone());
                }
                Arc::new(consumer)
            })
            .collect();

        let (live, _) = watch::channel(0);
        WorkerProcess {
            consumers,
            handles: Mutex::new(Vec::new()),
            live: Arc::new(live),
        }
    }
}

/// Decrements the live consumer count when its task ends, panics included.
struct LiveGuard(Arc<watch::Sender<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|live| *live = live.saturating_sub(1));
    }
}

/// A fixed set of consumers sharing one manager and one worker.
pub struct WorkerProcess {
    consumers: Vec<Arc<Consumer>>,
    handles: Mutex<Vec<JoinHandle<Result<u64>>>>,
    /// Consumer tasks that have not exited yet
    live: Arc<watch::Sender<usize>>,
}

impl WorkerProcess {
    pub fn builder(manager: Arc<QueueManager>, worker: Arc<Worker>) -> WorkerProcessBuilder {
        WorkerProcessBuilder {
            manager,
            worker,
            config: ConsumerConfig::default(),
            workers: 1,
            archive: None,
            clock: None,
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Spawn every consumer loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        self.live.send_replace(self.consumers.len());
        for consumer in &self.consumers {
            let consumer = consumer.clone();
            let guard = LiveGuard(self.live.clone());
            handles.push(tokio::spawn(async move {
                let _guard = guard;
                consumer.run().await
            }));
        }
        tracing::info!(workers = self.consumers.len(), "Worker process started");
    }

    /// Resolve once every started consumer has exited. Results stay in place
    /// for [`wait`](Self::wait).
    pub async fn finished(&self) {
        let mut live = self.live.subscribe();
        // sender lives in self, so this only ends once the count hits zero
        let _ = live.wait_for(|n| *n == 0).await;
    }

    /// Ask every consumer to stop and wait for in-flight jobs to finish.
    pub async fn shutdown(&self) {
        tracing::info!(workers = self.consumers.len(), "Stopping worker process");
        join_all(self.consumers.iter().map(|c| c.stop())).await;
    }

    /// Collect every consumer's result. Returns payloads handled.
    pub async fn wait(&self) -> Result<u64> {
        let handles = std::mem::take(&mut *self.handles.lock());
        let mut handled = 0;
        for outcome in join_all(handles).await {
            match outcome {
                Ok(Ok(count)) => handled += count,
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    return Err(QueueError::internal(format!("consumer task panicked: {}", e)))
                }
            }
        }
        Ok(handled)
    }

    /// Stop all consumers, letting in-flight jobs finish.
    pub async fn stop(&self) -> Result<u64> {
        self.shutdown().await;
        let handled = self.wait().await?;
        tracing::info!(handled, "Worker process stopped");
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryDriver;
    use crate::jobs::payload::{Payload, PayloadKind};
    use crate::jobs::serializer::PlainSerializer;
    use crate::jobs::worker::WorkerConfig;
    use std::time::Duration;

    fn single_attempt() -> Arc<Worker> {
        Arc::new(Worker::new(WorkerConfig {
            max_attempts: 1,
            ..WorkerConfig::default()
        }))
    }

    async fn seed(manager: &QueueManager, count: usize) {
        for i in 0..count {
            let payload = Payload::new(
                PayloadKind::Plain,
                format!(r#"{{"job":"noop","properties":{{"n":{}}}}}"#, i),
                0,
            );
            manager.push_payload(None, "default", payload).await.unwrap();
        }
    }

    fn manager() -> Arc<QueueManager> {
        Arc::new(
            QueueManager::builder()
                .connection("default", Arc::new(MemoryDriver::new()))
                .serializer(Arc::new(PlainSerializer::new()))
                .build(),
        )
    }

    #[tokio::test]
    async fn test_workers_floor_at_one() {
        let process = WorkerProcess::builder(manager(), Arc::new(Worker::new(WorkerConfig::default())))
            .workers(0)
            .build();
        assert_eq!(process.consumer_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_keep_alive_consumers() {
        let config = ConsumerConfig {
            keep_alive: true,
            poll_interval: Duration::from_millis(10),
            ..ConsumerConfig::default()
        };
        let process = WorkerProcess::builder(manager(), Arc::new(Worker::new(WorkerConfig::default())))
            .config(config)
            .workers(3)
            .build();
        process.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(process.stop().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_finished_then_wait_collects_results() {
        let manager = manager();
        seed(&manager, 3).await;
        let process = WorkerProcess::builder(manager, single_attempt())
            .config(ConsumerConfig {
                poll_interval: Duration::from_millis(5),
                ..ConsumerConfig::default()
            })
            .workers(2)
            .build();

        process.start();
        process.finished().await;
        assert_eq!(process.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_after_select_keeps_results() {
        let manager = manager();
        seed(&manager, 2).await;
        let process = WorkerProcess::builder(manager.clone(), single_attempt())
            .config(ConsumerConfig {
                keep_alive: true,
                poll_interval: Duration::from_millis(5),
                ..ConsumerConfig::default()
            })
            .build();

        process.start();
        for _ in 0..200 {
            if manager.size("default", None).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => process.shutdown().await,
            _ = process.finished() => panic!("keep-alive consumers exited on their own"),
        }
        assert_eq!(process.wait().await.unwrap(), 2);
    }
}
