//! Tracing Subscriber Initialization
//!
//! Installs an `EnvFilter` plus a pretty (development) or JSON (production)
//! fmt layer. Library code only emits events; binaries embedding KILN call
//! `init_tracing` once at startup.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::metrics::{KilnMetrics, METRICS};
use super::TelemetryError;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "kiln_cache=debug,kiln_storage=info,info";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(TelemetryError::InvalidLogFormat(other.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// fmt layer output
    pub log_format: LogFormat,
    /// Hand out the global metrics from [`TelemetryConfig::metrics`]
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "kiln".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Read `KILN_SERVICE_NAME`, `KILN_LOG_FORMAT` and `KILN_METRICS_ENABLED`.
    ///
    /// An unrecognized log format falls back to pretty output.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("KILN_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            log_format: std::env::var("KILN_LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.log_format),
            metrics_enabled: std::env::var("KILN_METRICS_ENABLED")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.metrics_enabled),
        }
    }

    /// Metrics to attach to the cache and client, `None` when disabled.
    ///
    /// The returned handle records into the global default registry.
    pub fn metrics(&self) -> Result<Option<Arc<KilnMetrics>>, TelemetryError> {
        if !self.metrics_enabled {
            return Ok(None);
        }
        let metrics = METRICS
            .as_ref()
            .map_err(|e| TelemetryError::MetricsUnavailable(e.to_string()))?;
        Ok(Some(Arc::new(metrics.clone())))
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).try_init(),
    };
    installed.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(
        service_name = config.service_name,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_telemetry_config_from_env() {
        let _format = EnvVarGuard::set("KILN_LOG_FORMAT", Some("json"));
        let _name = EnvVarGuard::set("KILN_SERVICE_NAME", Some("cad-worker"));
        let _metrics = EnvVarGuard::set("KILN_METRICS_ENABLED", Some("false"));

        let config = TelemetryConfig::from_env();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.service_name, "cad-worker");
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn test_disabled_metrics_are_not_handed_out() {
        let config = TelemetryConfig {
            metrics_enabled: false,
            ..TelemetryConfig::default()
        };
        assert!(config.metrics().unwrap().is_none());
    }

    #[test]
    fn test_enabled_metrics_record_into_global_registry() {
        let metrics = TelemetryConfig::default().metrics().unwrap().expect("enabled by default");
        metrics.record_lookup("telemetry-config", true);

        let global = METRICS.as_ref().unwrap();
        assert_eq!(
            global
                .cache_lookups_total
                .with_label_values(&["telemetry-config", "hit"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig::default();
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }
}
