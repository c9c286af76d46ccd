//! Prometheus Metrics Definitions
//!
//! Counts and durations only, never payloads. Every cache-level metric is
//! labelled with the key's kind tag.

use kiln_storage::StoreObserver;
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Lock wait buckets (seconds), from an uncontended acquire to a full wait.
const LOCK_WAIT_BUCKETS: &[f64] = &[
    0.001, 0.010, 0.050, 0.200, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Compute duration buckets (seconds); CAD builds run from milliseconds to minutes.
const COMPUTE_BUCKETS: &[f64] = &[
    0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0,
];

/// Global metrics instance over the default registry.
pub static METRICS: Lazy<Result<KilnMetrics, prometheus::Error>> =
    Lazy::new(|| KilnMetrics::new(prometheus::default_registry()));

/// Container for all KILN metrics.
#[derive(Clone)]
pub struct KilnMetrics {
    registry: Registry,

    /// Cache lookups - labels: kind, outcome (hit/miss)
    pub cache_lookups_total: CounterVec,

    /// Coalescing - labels: kind, role (leader/joined)
    pub coalesce_total: CounterVec,

    /// Lock acquisitions - labels: kind, result (acquired/timeout)
    pub lock_acquisitions_total: CounterVec,

    /// Time spent waiting for a lock - labels: kind
    pub lock_wait_seconds: HistogramVec,

    /// Compute invocations - labels: kind, status (success/error)
    pub compute_total: CounterVec,

    /// Compute duration - labels: kind
    pub compute_duration_seconds: HistogramVec,

    /// 1 while the shared store is unreachable
    pub store_degraded: Gauge,

    /// Operations served by the in-process fallback - labels: op
    pub store_fallback_operations_total: CounterVec,

    /// Leases currently held by this process
    pub locks_held: IntGauge,
}

impl std::fmt::Debug for KilnMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KilnMetrics").finish_non_exhaustive()
    }
}

impl KilnMetrics {
    /// Create all metrics and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            registry: registry.clone(),
            cache_lookups_total: CounterVec::new(
                Opts::new("kiln_cache_lookups_total", "Cache lookups by outcome"),
                &["kind", "outcome"],
            )?,
            coalesce_total: CounterVec::new(
                Opts::new(
                    "kiln_coalesce_total",
                    "Cache misses that led or joined an in-process computation",
                ),
                &["kind", "role"],
            )?,
            lock_acquisitions_total: CounterVec::new(
                Opts::new("kiln_lock_acquisitions_total", "Lock acquisition attempts by result"),
                &["kind", "result"],
            )?,
            lock_wait_seconds: HistogramVec::new(
                HistogramOpts::new("kiln_lock_wait_seconds", "Time spent waiting for a lock")
                    .buckets(LOCK_WAIT_BUCKETS.to_vec()),
                &["kind"],
            )?,
            compute_total: CounterVec::new(
                Opts::new("kiln_compute_total", "Compute function invocations by status"),
                &["kind", "status"],
            )?,
            compute_duration_seconds: HistogramVec::new(
                HistogramOpts::new("kiln_compute_duration_seconds", "Compute function duration")
                    .buckets(COMPUTE_BUCKETS.to_vec()),
                &["kind"],
            )?,
            store_degraded: Gauge::new(
                "kiln_store_degraded",
                "1 while the shared store is unreachable and the in-process fallback is used",
            )?,
            store_fallback_operations_total: CounterVec::new(
                Opts::new(
                    "kiln_store_fallback_operations_total",
                    "Store operations served by the in-process fallback",
                ),
                &["op"],
            )?,
            locks_held: IntGauge::new("kiln_locks_held", "Leases currently held by this process")?,
        };

        registry.register(Box::new(metrics.cache_lookups_total.clone()))?;
        registry.register(Box::new(metrics.coalesce_total.clone()))?;
        registry.register(Box::new(metrics.lock_acquisitions_total.clone()))?;
        registry.register(Box::new(metrics.lock_wait_seconds.clone()))?;
        registry.register(Box::new(metrics.compute_total.clone()))?;
        registry.register(Box::new(metrics.compute_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.store_degraded.clone()))?;
        registry.register(Box::new(metrics.store_fallback_operations_total.clone()))?;
        registry.register(Box::new(metrics.locks_held.clone()))?;

        Ok(metrics)
    }

    /// Metrics on a private registry, for tests and embedding.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Self::new(&Registry::new())
    }

    /// Record a cache lookup.
    pub fn record_lookup(&self, kind: &str, hit: bool) {
        let outcome = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[kind, outcome]).inc();
    }

    /// Record whether a miss led a computation or joined one.
    pub fn record_coalesce(&self, kind: &str, joined: bool) {
        let role = if joined { "joined" } else { "leader" };
        self.coalesce_total.with_label_values(&[kind, role]).inc();
    }

    /// Record a finished lock wait.
    pub fn record_lock_wait(&self, kind: &str, acquired: bool, waited_secs: f64) {
        let result = if acquired { "acquired" } else { "timeout" };
        self.lock_acquisitions_total.with_label_values(&[kind, result]).inc();
        self.lock_wait_seconds.with_label_values(&[kind]).observe(waited_secs);
    }

    /// Record a compute invocation.
    pub fn record_compute(&self, kind: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "error" };
        self.compute_total.with_label_values(&[kind, status]).inc();
        self.compute_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    pub fn lock_taken(&self) {
        self.locks_held.inc();
    }

    pub fn lock_returned(&self) {
        self.locks_held.dec();
    }

    /// Render every metric in this registry in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl StoreObserver for KilnMetrics {
    fn degraded_changed(&self, degraded: bool) {
        self.store_degraded.set(if degraded { 1.0 } else { 0.0 });
    }

    fn fallback_operation(&self, op: &'static str) {
        self.store_fallback_operations_total.with_label_values(&[op]).inc();
    }
}
