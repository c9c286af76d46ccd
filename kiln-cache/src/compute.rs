//! Fleet-wide memoized compute.
//!
//! `get_or_compute` guarantees that, across every process sharing the store,
//! at most one caller runs the compute function for a key at any instant:
//!
//! 1. read the store; a hit returns immediately
//! 2. on a miss, coalesce with any same-process caller for the key
//! 3. the coalesced leader takes the key's lease, re-checks the store, runs
//!    the compute function, publishes, and releases the lease on every path
//! 4. if the lease stays taken past the wait timeout, poll the store for the
//!    holder's result until the overall deadline, then fail with `LockTimeout`
//!
//! Results with a verified SHA-256 checksum are stored once under
//! `<ns>:blob:<checksum>` and referenced from the entry; results without one
//! are stored inline and never deduplicated. A blob lives at least as long as
//! the longest-lived entry referencing it: publishing only ever extends its
//! expiry.

use kiln_core::{
    content_hash_hex, CacheEntry, CacheKey, ComputeError, ComputeOutput, CoordinationError,
    KilnConfig, KilnResult, PayloadRef, Timestamp,
};
use kiln_storage::SharedStateClient;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::coalescer::{InFlightCoalescer, Role};
use crate::lock::{DistributedLock, WaitPolicy};
use crate::telemetry::KilnMetrics;

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Already in the store when first read.
    Store,
    /// Computed by this caller.
    Computed,
    /// Computed by another caller in this process.
    Joined,
    /// Published by another process while this caller waited.
    PublishedByPeer,
}

/// A cached value with its metadata.
#[derive(Debug, Clone)]
pub struct CacheRead {
    pub key: CacheKey,
    pub payload: Arc<Vec<u8>>,
    pub size: u64,
    pub checksum: Option<String>,
    pub created_at: Timestamp,
    pub source: ReadSource,
}

impl CacheRead {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the value was served from the store without coordination.
    pub fn is_hit(&self) -> bool {
        self.source == ReadSource::Store
    }

    fn with_source(mut self, source: ReadSource) -> Self {
        self.source = source;
        self
    }
}

/// Counters snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced_joins: u64,
    pub lock_timeouts: u64,
    pub computes: u64,
    pub compute_errors: u64,
    pub degraded: bool,
    pub in_flight: usize,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    lock_timeouts: AtomicU64,
    computes: AtomicU64,
    compute_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared with the coalesced fill future.
#[derive(Debug, Clone)]
struct CacheCore {
    client: Arc<SharedStateClient>,
    lock: Arc<DistributedLock>,
    config: Arc<KilnConfig>,
    counters: Arc<Counters>,
    metrics: Option<Arc<KilnMetrics>>,
}

impl CacheCore {
    fn entry_key(&self, key: &CacheKey) -> String {
        self.client.namespaced("entry", key.as_str())
    }

    fn blob_key(&self, checksum: &str) -> String {
        self.client.namespaced("blob", checksum)
    }

    /// Read a published entry. Anything unreadable is a miss, never a value.
    async fn read(&self, key: &CacheKey) -> KilnResult<Option<CacheRead>> {
        let backend = self.client.backend_name();
        let Some(bytes) = self.client.get(&self.entry_key(key)).await? else {
            return Ok(None);
        };
        let entry = match CacheEntry::decode(backend, key.as_str(), &bytes) {
            Ok(entry) if entry.key == *key => entry,
            Ok(entry) => {
                warn!(key = %key, stored = %entry.key, "Entry stored under the wrong key, ignoring");
                return Ok(None);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Undecodable cache entry, treating as miss");
                return Ok(None);
            }
        };

        let payload = match &entry.payload_ref {
            PayloadRef::Inline { .. } => match entry.inline_payload(backend) {
                Ok(Some(payload)) => payload,
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable inline payload, treating as miss");
                    return Ok(None);
                }
            },
            PayloadRef::Blob { checksum } => {
                let Some(blob) = self.client.get(&self.blob_key(checksum)).await? else {
                    debug!(key = %key, checksum = %checksum, "Blob expired before its entry, treating as miss");
                    return Ok(None);
                };
                if content_hash_hex(&blob) != *checksum {
                    warn!(key = %key, checksum = %checksum, "Blob checksum mismatch, treating as miss");
                    return Ok(None);
                }
                blob
            }
        };

        Ok(Some(CacheRead {
            key: entry.key,
            payload: Arc::new(payload),
            size: entry.size,
            checksum: entry.checksum,
            created_at: entry.created_at,
            source: ReadSource::Store,
        }))
    }

    async fn publish(&self, key: &CacheKey, output: ComputeOutput, ttl: Duration) -> KilnResult<CacheRead> {
        let entry = CacheEntry::for_output(key.clone(), &output, ttl);
        let deduplicated = match &entry.payload_ref {
            PayloadRef::Blob { checksum } => {
                self.client
                    .set_extending_ttl(&self.blob_key(checksum), output.payload(), ttl)
                    .await?;
                true
            }
            PayloadRef::Inline { .. } => false,
        };
        self.client
            .set(&self.entry_key(key), &entry.encode(), Some(ttl))
            .await?;
        debug!(key = %key, size = entry.size, deduplicated, "Published cache entry");

        Ok(CacheRead {
            key: entry.key,
            payload: Arc::new(output.into_payload()),
            size: entry.size,
            checksum: entry.checksum,
            created_at: entry.created_at,
            source: ReadSource::Computed,
        })
    }

    /// Coalesced leader path: lease, double-check, compute, publish.
    async fn fill<F, Fut, E>(self, key: CacheKey, compute: F, ttl: Duration) -> KilnResult<CacheRead>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ComputeOutput, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let started = Instant::now();
        let wait = WaitPolicy::backoff(self.config.backoff.clone(), self.config.lock_wait_timeout);
        let guard = match self.lock.acquire(key.as_str(), self.config.lock_lease, &wait).await {
            Ok(guard) => guard,
            Err(e) if e.is_lock_timeout() => {
                debug!(key = %key, "Lease held elsewhere past the wait timeout, polling for its result");
                return self.await_peer(&key, started).await;
            }
            Err(e) => return Err(e),
        };

        let result = self.compute_under_lock(&key, compute, ttl).await;
        if let Err(e) = guard.release().await {
            warn!(key = %key, error = %e, "Lease release failed; it will expire on its own");
        }
        result
    }

    async fn compute_under_lock<F, Fut, E>(
        &self,
        key: &CacheKey,
        compute: F,
        ttl: Duration,
    ) -> KilnResult<CacheRead>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ComputeOutput, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(found) = self.read(key).await? {
            debug!(key = %key, "Published by a peer while acquiring the lease");
            return Ok(found.with_source(ReadSource::PublishedByPeer));
        }

        bump(&self.counters.computes);
        let started = Instant::now();
        let outcome = compute().await;
        let elapsed = started.elapsed().as_secs_f64();
        if let Some(metrics) = &self.metrics {
            metrics.record_compute(key.kind(), outcome.is_ok(), elapsed);
        }

        match outcome {
            Ok(output) => self.publish(key, output, ttl).await,
            Err(e) => {
                bump(&self.counters.compute_errors);
                warn!(key = %key, error = %e, "Compute failed");
                Err(ComputeError::failed(key.as_str(), e).into())
            }
        }
    }

    /// Poll the store for a result published by the lease holder.
    async fn await_peer(&self, key: &CacheKey, started: Instant) -> KilnResult<CacheRead> {
        let deadline = started + self.config.overall_deadline;
        loop {
            if let Some(found) = self.read(key).await? {
                return Ok(found.with_source(ReadSource::PublishedByPeer));
            }
            let now = Instant::now();
            if now >= deadline {
                bump(&self.counters.lock_timeouts);
                let waited = now - started;
                warn!(key = %key, waited_ms = waited.as_millis() as u64, "No result published before the deadline");
                return Err(CoordinationError::LockTimeout {
                    key: key.to_string(),
                    waited,
                }
                .into());
            }
            tokio::time::sleep(self.config.store_poll_interval.min(deadline - now)).await;
        }
    }
}

/// Memoizing compute cache shared by a fleet of workers.
#[derive(Debug)]
pub struct ComputeCache {
    core: CacheCore,
    coalescer: InFlightCoalescer<CacheRead>,
}

impl ComputeCache {
    /// Cache over `client` with `config`'s timeouts and TTLs.
    pub fn new(client: Arc<SharedStateClient>, config: KilnConfig) -> Self {
        let lock = DistributedLock::new(Arc::clone(&client));
        Self {
            core: CacheCore {
                client,
                lock: Arc::new(lock),
                config: Arc::new(config),
                counters: Arc::new(Counters::default()),
                metrics: None,
            },
            coalescer: InFlightCoalescer::new(),
        }
    }

    /// Validate `config` and connect to its store (in-process when unset).
    pub fn from_config(config: KilnConfig) -> KilnResult<Self> {
        config.validate()?;
        let client = SharedStateClient::from_config(&config)?;
        Ok(Self::new(Arc::new(client), config))
    }

    /// Record cache, lock and compute metrics.
    pub fn with_metrics(mut self, metrics: Arc<KilnMetrics>) -> Self {
        let lock = DistributedLock::new(Arc::clone(&self.core.client)).with_metrics(Arc::clone(&metrics));
        self.core.lock = Arc::new(lock);
        self.core.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &KilnConfig {
        &self.core.config
    }

    pub fn client(&self) -> &Arc<SharedStateClient> {
        &self.core.client
    }

    /// The lease manager, for inspecting current lock state.
    pub fn lock(&self) -> &DistributedLock {
        &self.core.lock
    }

    /// Return the cached value for `key`, computing it at most once fleet-wide.
    ///
    /// `ttl` defaults to the configured entry TTL. Fails with a
    /// `ComputeError` wrapping the compute function's error, or with
    /// `LockTimeout` if another holder kept the lease and published nothing
    /// before the overall deadline.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        compute: F,
        ttl: Option<Duration>,
    ) -> KilnResult<CacheRead>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<ComputeOutput, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let kind = key.kind();
        if let Some(hit) = self.core.read(key).await? {
            bump(&self.core.counters.hits);
            self.record_lookup(kind, true);
            return Ok(hit);
        }
        bump(&self.core.counters.misses);
        self.record_lookup(kind, false);

        let ttl = ttl.unwrap_or(self.core.config.default_ttl);
        let core = self.core.clone();
        let owned_key = key.clone();
        let coalesced = self
            .coalescer
            .coalesce(key.as_str(), move || core.fill(owned_key, compute, ttl))
            .await;

        let joined = coalesced.role == Role::Joined;
        if joined {
            bump(&self.core.counters.joins);
        }
        if let Some(metrics) = &self.core.metrics {
            metrics.record_coalesce(kind, joined);
        }
        coalesced.result.map(|read| {
            if joined {
                read.with_source(ReadSource::Joined)
            } else {
                read
            }
        })
    }

    /// Read without computing.
    pub async fn get(&self, key: &CacheKey) -> KilnResult<Option<CacheRead>> {
        self.core.read(key).await
    }

    /// Remove the entry for `key`. Blobs are shared and left to expire.
    pub async fn invalidate(&self, key: &CacheKey) -> KilnResult<bool> {
        let removed = self.core.client.delete(&self.core.entry_key(key)).await?;
        debug!(key = %key, removed, "Invalidated cache entry");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.core.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            coalesced_joins: c.joins.load(Ordering::Relaxed),
            lock_timeouts: c.lock_timeouts.load(Ordering::Relaxed),
            computes: c.computes.load(Ordering::Relaxed),
            compute_errors: c.compute_errors.load(Ordering::Relaxed),
            degraded: self.core.client.is_degraded(),
            in_flight: self.coalescer.in_flight(),
        }
    }

    fn record_lookup(&self, kind: &str, hit: bool) {
        if let Some(metrics) = &self.core.metrics {
            metrics.record_lookup(kind, hit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct MeshError(&'static str);

    impl fmt::Display for MeshError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "mesh failed: {}", self.0)
        }
    }

    impl std::error::Error for MeshError {}

    fn cache() -> ComputeCache {
        let config = KilnConfig::default();
        ComputeCache::new(Arc::new(SharedStateClient::in_process(&config)), config)
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::opaque(s).unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache();
        let k = key("build:v7:part-1");

        let first = cache
            .get_or_compute(&k, || async { Ok::<_, MeshError>(ComputeOutput::new(b"solid".to_vec())) }, None)
            .await
            .unwrap();
        assert_eq!(first.source, ReadSource::Computed);

        let second = cache
            .get_or_compute(&k, || async { Err::<ComputeOutput, _>(MeshError("must not run")) }, None)
            .await
            .unwrap();
        assert!(second.is_hit());
        assert_eq!(second.payload(), b"solid");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.computes), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_empty_result_is_cached_not_absent() {
        let cache = cache();
        let k = key("export:v7:empty");
        cache
            .get_or_compute(&k, || async { Ok::<_, MeshError>(ComputeOutput::empty()) }, None)
            .await
            .unwrap();

        let read = cache.get(&k).await.unwrap().expect("empty artifact must be a value");
        assert!(read.payload().is_empty());
        assert_eq!(read.size, 0);
    }

    #[tokio::test]
    async fn test_compute_error_is_wrapped_and_not_cached() {
        let cache = cache();
        let k = key("build:v7:bad");
        let err = cache
            .get_or_compute(&k, || async { Err::<ComputeOutput, _>(MeshError("self-intersecting")) }, None)
            .await
            .unwrap_err();

        assert!(err.is_compute_error());
        let source = std::error::Error::source(&err)
            .and_then(std::error::Error::source)
            .expect("collaborator error preserved");
        assert_eq!(source.to_string(), "mesh failed: self-intersecting");

        assert!(cache.get(&k).await.unwrap().is_none());
        assert!(cache.lock().inspect(k.as_str()).await.unwrap().is_none());
        assert_eq!(cache.stats().compute_errors, 1);
    }

    #[tokio::test]
    async fn test_identical_results_share_one_blob() {
        let cache = cache();
        for part in ["build:v7:a", "build:v7:b"] {
            cache
                .get_or_compute(&key(part), || async { Ok::<_, MeshError>(ComputeOutput::new(b"same".to_vec())) }, None)
                .await
                .unwrap();
        }
        let a = cache.get(&key("build:v7:a")).await.unwrap().unwrap();
        let b = cache.get(&key("build:v7:b")).await.unwrap().unwrap();
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.payload(), b.payload());
    }

    #[tokio::test]
    async fn test_results_without_checksum_are_not_deduplicated() {
        let cache = cache();
        let k = key("profile:v7:x");
        cache
            .get_or_compute(&k, || async { Ok::<_, MeshError>(ComputeOutput::without_checksum(b"stats".to_vec())) }, None)
            .await
            .unwrap();
        let read = cache.get(&k).await.unwrap().unwrap();
        assert_eq!(read.checksum, None);
        assert_eq!(read.payload(), b"stats");
    }

    #[tokio::test]
    async fn test_tampered_blob_is_a_miss() {
        let cache = cache();
        let k = key("build:v7:tamper");
        let read = cache
            .get_or_compute(&k, || async { Ok::<_, MeshError>(ComputeOutput::new(b"good".to_vec())) }, None)
            .await
            .unwrap();
        let checksum = read.checksum.unwrap();
        cache
            .client()
            .set(&cache.core.blob_key(&checksum), b"evil", None)
            .await
            .unwrap();
        assert!(cache.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache = cache();
        let k = key("build:v7:inv");
        cache
            .get_or_compute(&k, || async { Ok::<_, MeshError>(ComputeOutput::new(b"v1".to_vec())) }, None)
            .await
            .unwrap();
        assert!(cache.invalidate(&k).await.unwrap());
        let read = cache
            .get_or_compute(&k, || async { Ok::<_, MeshError>(ComputeOutput::new(b"v2".to_vec())) }, None)
            .await
            .unwrap();
        assert_eq!(read.source, ReadSource::Computed);
        assert_eq!(read.payload(), b"v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_ttl() {
        let cache = cache();
        let k = key("build:v7:ttl");
        cache
            .get_or_compute(
                &k,
                || async { Ok::<_, MeshError>(ComputeOutput::new(b"v".to_vec())) },
                Some(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&k).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_lived_twin_keeps_shared_blob_alive() {
        let cache = cache();
        let long = key("build:v7:long");
        let short = key("build:v7:short");
        for (k, ttl) in [(&long, 3600), (&short, 10)] {
            cache
                .get_or_compute(
                    k,
                    || async { Ok::<_, MeshError>(ComputeOutput::new(b"same-mesh".to_vec())) },
                    Some(Duration::from_secs(ttl)),
                )
                .await
                .unwrap();
        }

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get(&short).await.unwrap().is_none());
        let read = cache.get(&long).await.unwrap().expect("long-lived entry keeps its payload");
        assert_eq!(read.payload(), b"same-mesh");

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(cache.get(&long).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_config() {
        let config = KilnConfig::default().with_namespace("");
        assert!(ComputeCache::from_config(config).is_err());
    }
}
