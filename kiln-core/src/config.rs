//! KILN Configuration
//!
//! Configuration is loaded from environment variables with defaults that
//! suit a single worker in development. `validate()` rejects combinations
//! that would break the coordination guarantees.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

// ============================================================================
// KILN CONFIGURATION
// ============================================================================

/// Configuration for the compute cache and shared-state layer.
#[derive(Debug, Clone, PartialEq)]
pub struct KilnConfig {
    // ========================================================================
    // Shared store
    // ========================================================================
    /// Prefix for every key written to the shared store.
    pub namespace: String,

    /// External store URL (e.g. "redis://cache:6379").
    /// `None` runs on the in-process store only, permanently degraded.
    pub store_url: Option<String>,

    /// Upper bound on a single store round-trip.
    pub store_operation_timeout: Duration,

    /// Minimum gap between reconnection probes while degraded.
    pub recovery_probe_interval: Duration,

    // ========================================================================
    // Compute cache
    // ========================================================================
    /// TTL applied to published entries when the caller gives none.
    pub default_ttl: Duration,

    /// Lease on the per-key compute lock. Must exceed the longest expected
    /// computation.
    pub lock_lease: Duration,

    /// How long a requester polls for the lock before giving up on it.
    pub lock_wait_timeout: Duration,

    /// Total time a requester may wait for a result, lock wait included.
    pub overall_deadline: Duration,

    /// Interval between store reads once lock waiting has timed out.
    pub store_poll_interval: Duration,

    /// Backoff between lock attempts.
    pub backoff: BackoffPolicy,

    // ========================================================================
    // Shared state streams
    // ========================================================================
    /// Entries kept per stream; older entries are evicted first.
    pub stream_max_events: usize,

    /// Inactivity TTL for a whole stream.
    pub stream_ttl: Duration,

    // ========================================================================
    // Fingerprinting
    // ========================================================================
    /// Decimal places numbers are normalized to before hashing.
    pub decimal_places: u8,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            namespace: "kiln".to_string(),
            store_url: None,
            store_operation_timeout: Duration::from_secs(2),
            recovery_probe_interval: Duration::from_secs(5),

            default_ttl: Duration::from_secs(3600), // 1 hour
            lock_lease: Duration::from_secs(300),
            lock_wait_timeout: Duration::from_secs(30),
            overall_deadline: Duration::from_secs(60),
            store_poll_interval: Duration::from_millis(250),
            backoff: BackoffPolicy::default(),

            stream_max_events: 100,
            stream_ttl: Duration::from_secs(86400), // 24 hours

            decimal_places: 6,
        }
    }
}

impl KilnConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create KilnConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KILN_NAMESPACE`: Key prefix (default: kiln)
    /// - `KILN_STORE_URL`: External store URL (default: none, in-process only)
    /// - `KILN_STORE_TIMEOUT_MS`: Per-operation store timeout (default: 2000)
    /// - `KILN_RECOVERY_PROBE_MS`: Degraded-mode probe interval (default: 5000)
    /// - `KILN_DEFAULT_TTL_SECS`: Entry TTL (default: 3600)
    /// - `KILN_LOCK_LEASE_SECS`: Compute lock lease (default: 300)
    /// - `KILN_LOCK_WAIT_MS`: Lock wait timeout (default: 30000)
    /// - `KILN_OVERALL_DEADLINE_MS`: Total wait deadline (default: 60000)
    /// - `KILN_STORE_POLL_MS`: Result polling interval (default: 250)
    /// - `KILN_BACKOFF_INITIAL_MS`, `KILN_BACKOFF_MAX_MS`,
    ///   `KILN_BACKOFF_MULTIPLIER`, `KILN_BACKOFF_JITTER`
    /// - `KILN_STREAM_MAX_EVENTS`: Per-stream bound (default: 100)
    /// - `KILN_STREAM_TTL_SECS`: Stream inactivity TTL (default: 86400)
    /// - `KILN_DECIMAL_PLACES`: Numeric canonicalization precision (default: 6)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let namespace = std::env::var("KILN_NAMESPACE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.namespace);

        let store_url = std::env::var("KILN_STORE_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let backoff = BackoffPolicy {
            initial: env_millis("KILN_BACKOFF_INITIAL_MS").unwrap_or(defaults.backoff.initial),
            multiplier: env_parse("KILN_BACKOFF_MULTIPLIER")
                .unwrap_or(defaults.backoff.multiplier),
            max: env_millis("KILN_BACKOFF_MAX_MS").unwrap_or(defaults.backoff.max),
            jitter: env_parse("KILN_BACKOFF_JITTER").unwrap_or(defaults.backoff.jitter),
        };

        Self {
            namespace,
            store_url,
            store_operation_timeout: env_millis("KILN_STORE_TIMEOUT_MS")
                .unwrap_or(defaults.store_operation_timeout),
            recovery_probe_interval: env_millis("KILN_RECOVERY_PROBE_MS")
                .unwrap_or(defaults.recovery_probe_interval),
            default_ttl: env_secs("KILN_DEFAULT_TTL_SECS").unwrap_or(defaults.default_ttl),
            lock_lease: env_secs("KILN_LOCK_LEASE_SECS").unwrap_or(defaults.lock_lease),
            lock_wait_timeout: env_millis("KILN_LOCK_WAIT_MS")
                .unwrap_or(defaults.lock_wait_timeout),
            overall_deadline: env_millis("KILN_OVERALL_DEADLINE_MS")
                .unwrap_or(defaults.overall_deadline),
            store_poll_interval: env_millis("KILN_STORE_POLL_MS")
                .unwrap_or(defaults.store_poll_interval),
            backoff,
            stream_max_events: env_parse("KILN_STREAM_MAX_EVENTS")
                .unwrap_or(defaults.stream_max_events),
            stream_ttl: env_secs("KILN_STREAM_TTL_SECS").unwrap_or(defaults.stream_ttl),
            decimal_places: env_parse("KILN_DECIMAL_PLACES").unwrap_or(defaults.decimal_places),
        }
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the external store URL.
    pub fn with_store_url(mut self, url: impl Into<String>) -> Self {
        self.store_url = Some(url.into());
        self
    }

    /// Set the default entry TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the compute lock lease.
    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    /// Set the lock wait timeout and overall deadline together.
    pub fn with_wait(mut self, lock_wait: Duration, overall_deadline: Duration) -> Self {
        self.lock_wait_timeout = lock_wait;
        self.overall_deadline = overall_deadline;
        self
    }

    /// Set the result polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.store_poll_interval = interval;
        self
    }

    /// Set the lock backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the stream bounds.
    pub fn with_stream_limits(mut self, max_events: usize, ttl: Duration) -> Self {
        self.stream_max_events = max_events;
        self.stream_ttl = ttl;
        self
    }

    /// Set the recovery probe interval.
    pub fn with_recovery_probe_interval(mut self, interval: Duration) -> Self {
        self.recovery_probe_interval = interval;
        self
    }

    /// Check the configuration for values that break coordination guarantees.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(invalid(
                "namespace",
                &self.namespace,
                "must be non-empty and must not contain ':'",
            ));
        }
        if self.lock_lease.is_zero() {
            return Err(invalid("lock_lease", "0", "lease must be positive"));
        }
        if self.default_ttl.is_zero() {
            return Err(invalid("default_ttl", "0", "ttl must be positive"));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(invalid(
                "backoff.multiplier",
                self.backoff.multiplier,
                "must be at least 1.0",
            ));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return Err(invalid(
                "backoff.jitter",
                self.backoff.jitter,
                "must be in [0, 1)",
            ));
        }
        if self.backoff.initial.is_zero() || self.backoff.initial > self.backoff.max {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "backoff.initial".to_string(),
                option_b: "backoff.max".to_string(),
            });
        }
        if self.overall_deadline < self.lock_wait_timeout {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "overall_deadline".to_string(),
                option_b: "lock_wait_timeout".to_string(),
            });
        }
        if self.store_poll_interval.is_zero() {
            return Err(invalid("store_poll_interval", "0", "must be positive"));
        }
        if self.stream_max_events == 0 {
            return Err(invalid("stream_max_events", "0", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}
