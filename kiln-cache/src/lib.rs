//! KILN Cache - Fleet-Wide Memoized Compute
//!
//! Coordination layer over the shared store: distributed leases with
//! fencing tokens, same-process in-flight coalescing, and the
//! `ComputeCache` that combines them so each expensive result is computed
//! at most once across a fleet of workers.
//!
//! ```ignore
//! let telemetry = TelemetryConfig::from_env();
//! init_tracing(&telemetry)?;
//!
//! let config = KilnConfig::from_env();
//! let mut client = SharedStateClient::from_config(&config)?;
//! let metrics = telemetry.metrics()?;
//! if let Some(metrics) = &metrics {
//!     client = client.with_observer(metrics.clone());
//! }
//! let mut cache = ComputeCache::new(Arc::new(client), config);
//! if let Some(metrics) = metrics {
//!     cache = cache.with_metrics(metrics);
//! }
//!
//! let key = FingerprintComputer::from_config(cache.config()).compute_key("geometry", &engine, &params)?;
//! let read = cache.get_or_compute(&key, move || build_geometry(params), None).await?;
//! ```

pub mod coalescer;
pub mod compute;
pub mod lock;
pub mod telemetry;

pub use coalescer::{Coalesced, InFlightCoalescer, Role};
pub use compute::{CacheRead, CacheStats, ComputeCache, ReadSource};
pub use lock::{DistributedLock, LockGuard, WaitPolicy};
pub use telemetry::{init_tracing, KilnMetrics, LogFormat, TelemetryConfig, TelemetryError, METRICS};

// Re-export the core types callers need alongside the cache
pub use kiln_core::{
    CacheKey, ComputeError, ComputeOutput, CoordinationError, EngineIdentity, FingerprintComputer,
    KilnConfig, KilnError, KilnResult,
};
pub use kiln_storage::{SharedStateClient, SharedStateStore, StreamKind, StreamName};
