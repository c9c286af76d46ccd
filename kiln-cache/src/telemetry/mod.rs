//! KILN Telemetry - Observability Infrastructure
//!
//! Structured logging setup and Prometheus metrics for the cache layer.

pub mod metrics;
pub mod tracer;

pub use metrics::{KilnMetrics, METRICS};
pub use tracer::{init_tracing, LogFormat, TelemetryConfig, DEFAULT_FILTER};

use thiserror::Error;

/// Telemetry setup errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),

    #[error("Unknown log format {0:?} (expected pretty or json)")]
    InvalidLogFormat(String),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Global metrics unavailable: {0}")]
    MetricsUnavailable(String),
}
