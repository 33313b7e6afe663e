//! Prometheus metrics for queue throughput, job outcomes and errors.
//!
//! Counters are recorded through the `metrics` facade whether or not a
//! recorder is installed; `init_metrics` installs the Prometheus recorder so
//! they can be rendered.
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::telemetry::metrics::QueueMetrics;
//!
//! QueueMetrics::pushed("redis", "mail");
//! QueueMetrics::completed("mail", "SendEmail", 0.125);
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder; `render` returns an empty string.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the bucket list is invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("conveyor_jobs_pushed_total", "Payloads handed to a driver");
    describe_counter!("conveyor_jobs_popped_total", "Payloads taken from a driver");
    describe_counter!(
        "conveyor_jobs_completed_total",
        "Jobs whose handler succeeded"
    );
    describe_counter!(
        "conveyor_jobs_failed_total",
        "Jobs that exhausted their attempts"
    );
    describe_counter!("conveyor_jobs_retried_total", "Attempts followed by a retry");
    describe_counter!(
        "conveyor_jobs_dead_lettered_total",
        "Payloads handed to a driver's failure path"
    );
    describe_histogram!(
        "conveyor_job_duration_seconds",
        "Job execution time across all attempts"
    );
    describe_counter!(
        "conveyor_schedules_fired_total",
        "Scheduled definitions enqueued"
    );
    describe_counter!("conveyor_errors_total", "Queue errors by code");
}

/// Queue-level counters.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn pushed(driver: &str, queue: &str) {
        counter!(
            "conveyor_jobs_pushed_total",
            "driver" => driver.to_string(),
            "queue" => queue.to_string(),
        )
        .increment(1);
    }

    pub fn popped(driver: &str, queue: &str) {
        counter!(
            "conveyor_jobs_popped_total",
            "driver" => driver.to_string(),
            "queue" => queue.to_string(),
        )
        .increment(1);
    }

    /// Record a successful job and its duration.
    pub fn completed(queue: &str, job: &str, duration_seconds: f64) {
        counter!(
            "conveyor_jobs_completed_total",
            "queue" => queue.to_string(),
            "job" => job.to_string(),
        )
        .increment(1);
        histogram!(
            "conveyor_job_duration_seconds",
            "queue" => queue.to_string(),
            "job" => job.to_string(),
            "status" => "completed",
        )
        .record(duration_seconds);
    }

    /// Record a terminally failed job and its duration.
    pub fn failed(queue: &str, job: &str, duration_seconds: f64) {
        counter!(
            "conveyor_jobs_failed_total",
            "queue" => queue.to_string(),
            "job" => job.to_string(),
        )
        .increment(1);
        histogram!(
            "conveyor_job_duration_seconds",
            "queue" => queue.to_string(),
            "job" => job.to_string(),
            "status" => "failed",
        )
        .record(duration_seconds);
    }

    pub fn retried(job: &str) {
        counter!("conveyor_jobs_retried_total", "job" => job.to_string()).increment(1);
    }

    pub fn dead_lettered(driver: &str, queue: &str) {
        counter!(
            "conveyor_jobs_dead_lettered_total",
            "driver" => driver.to_string(),
            "queue" => queue.to_string(),
        )
        .increment(1);
    }

    pub fn schedule_fired(schedule_id: &str) {
        counter!(
            "conveyor_schedules_fired_total",
            "schedule" => schedule_id.to_string(),
        )
        .increment(1);
    }
}

/// Measures one job execution.
pub struct JobTimer {
    start: Instant,
}

impl JobTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let registry = init_metrics(&MetricsConfig::default(), "test").unwrap();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_counters_without_recorder() {
        QueueMetrics::pushed("memory", "default");
        QueueMetrics::completed("default", "SendEmail", 0.01);
        QueueMetrics::schedule_fired("nightly");
    }

    #[test]
    fn test_job_timer() {
        let timer = JobTimer::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
    }
}
