//! Telemetry: structured logging and process metrics.
//!
//! - **Logging**: JSON/pretty/compact output through `tracing-subscriber`
//! - **Metrics**: queue counters through `metrics`, rendered by the Prometheus recorder
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _telemetry = init_telemetry(&TelemetryConfig::default()).expect("telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, redact_url, LogFormat, LoggingConfig};
pub use metrics::{init_metrics, JobTimer, MetricsConfig, MetricsRegistry, QueueMetrics};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "conveyor".to_string()
}

fn default_environment() -> String {
    std::env::var("CONVEYOR_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}

/// Initialize metrics, then logging.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging, &config.environment)?;
    Ok(TelemetryHandle { metrics })
}

/// Keeps the metrics recorder reachable for rendering.
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

impl TelemetryHandle {
    /// Flush a final metrics snapshot to the log.
    pub fn shutdown(self) {
        if self.metrics.is_enabled() {
            ::tracing::info!(metrics = %self.metrics.render(), "Final metrics snapshot");
        }
        ::tracing::info!("Telemetry shutdown complete");
    }
}
