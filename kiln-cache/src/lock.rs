//! Fleet-wide per-key mutual exclusion.
//!
//! A lease is a `LockRecord` written with create-if-absent under
//! `<ns>:lock:<key>` with the lease TTL. Release is compare-and-delete on
//! the exact record bytes, so a holder whose lease already expired can never
//! remove the lease of whoever acquired the key next. If a holder crashes,
//! the store expires its record after one lease TTL and the next acquirer
//! proceeds.
//!
//! ```text
//! UNLOCKED ── set_if_absent ok ──→ HELD ── release / lease expiry ──→ UNLOCKED
//!     ↑                                                                  │
//!     └──────── waiters: backoff + jitter, bounded by the wait timeout ──┘
//! ```

use kiln_core::{
    new_token, BackoffPolicy, BackoffStep, CoordinationError, Held, KilnResult, Lock,
    LockRecord,
};
use kiln_storage::{SharedStateClient, StoreResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::telemetry::KilnMetrics;

/// How long, and how, to wait for a lock held elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitPolicy {
    /// Give up after a single attempt.
    NoWait,
    /// Retry with bounded exponential backoff until `timeout` has elapsed.
    Backoff {
        policy: BackoffPolicy,
        timeout: Duration,
    },
}

impl WaitPolicy {
    pub fn backoff(policy: BackoffPolicy, timeout: Duration) -> Self {
        WaitPolicy::Backoff { policy, timeout }
    }

    /// Total time this policy may spend waiting.
    pub fn timeout(&self) -> Duration {
        match self {
            WaitPolicy::NoWait => Duration::ZERO,
            WaitPolicy::Backoff { timeout, .. } => *timeout,
        }
    }
}

/// Per-key lease manager for one process.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    client: Arc<SharedStateClient>,
    holder_id: String,
    metrics: Option<Arc<KilnMetrics>>,
}

impl DistributedLock {
    /// Lock manager with a holder id unique to this process instance.
    pub fn new(client: Arc<SharedStateClient>) -> Self {
        Self {
            client,
            holder_id: format!("pid{}-{}", std::process::id(), new_token()),
            metrics: None,
        }
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<KilnMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn store_key(&self, key: &str) -> String {
        self.client.namespaced("lock", key)
    }

    /// One create-if-absent attempt.
    pub async fn try_acquire(&self, key: &str, lease: Duration) -> StoreResult<Option<LockGuard>> {
        let record = LockRecord::new(key, self.holder_id.clone(), lease);
        let value = record.encode();
        let store_key = self.store_key(key);
        if !self.client.set_if_absent(&store_key, &value, lease).await? {
            return Ok(None);
        }
        if let Some(metrics) = &self.metrics {
            metrics.lock_taken();
        }
        debug!(key, holder = %self.holder_id, lease_ms = lease.as_millis() as u64, "Lock acquired");
        Ok(Some(LockGuard {
            client: Arc::clone(&self.client),
            store_key,
            value,
            lock: Some(Lock::<Held>::new(record)),
            metrics: self.metrics.clone(),
        }))
    }

    /// Acquire `key`, waiting per `wait`.
    ///
    /// Fails with `LockTimeout` once the wait budget is spent. It never falls
    /// through to "proceed anyway".
    pub async fn acquire(&self, key: &str, lease: Duration, wait: &WaitPolicy) -> KilnResult<LockGuard> {
        let kind = kind_of(key);
        let started = Instant::now();
        let mut backoff = match wait {
            WaitPolicy::NoWait => None,
            WaitPolicy::Backoff { policy, timeout } => Some(policy.start(*timeout)),
        };

        loop {
            if let Some(guard) = self.try_acquire(key, lease).await? {
                self.record_wait(kind, true, started);
                return Ok(guard);
            }

            let step = backoff
                .as_mut()
                .map_or(BackoffStep::Exhausted, |b| b.next_step(started.elapsed()));
            match step {
                BackoffStep::Wait(delay) => {
                    debug!(
                        key,
                        delay_ms = delay.as_millis() as u64,
                        attempt = backoff.as_ref().map_or(0, |b| b.attempt()),
                        "Lock held elsewhere, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                BackoffStep::Exhausted => {
                    let waited = started.elapsed();
                    self.record_wait(kind, false, started);
                    debug!(key, waited_ms = waited.as_millis() as u64, "Lock wait timed out");
                    return Err(CoordinationError::LockTimeout {
                        key: key.to_string(),
                        waited,
                    }
                    .into());
                }
            }
        }
    }

    /// Run `f` while holding `key`. The lease is released on every exit path.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        lease: Duration,
        wait: &WaitPolicy,
        f: F,
    ) -> KilnResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = KilnResult<T>>,
    {
        let guard = self.acquire(key, lease, wait).await?;
        let result = f().await;
        if let Err(e) = guard.release().await {
            warn!(key, error = %e, "Lock release failed; lease will expire on its own");
        }
        result
    }

    /// Current lease on `key`, if any.
    pub async fn inspect(&self, key: &str) -> StoreResult<Option<LockRecord>> {
        match self.client.get(&self.store_key(key)).await? {
            Some(bytes) => LockRecord::decode(self.client.backend_name(), &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn record_wait(&self, kind: &str, acquired: bool, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_lock_wait(kind, acquired, started.elapsed().as_secs_f64());
        }
    }
}

/// Kind tag of a cache key, for metric labels.
pub(crate) fn kind_of(key: &str) -> &str {
    let mut parts = key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(kind), Some(_)) if !kind.is_empty() => kind,
        _ => "opaque",
    }
}

/// A held lease.
///
/// Release explicitly with [`LockGuard::release`]. A guard dropped while
/// still held (cancellation, panic) schedules a best-effort release on the
/// current tokio runtime; the lease TTL bounds the worst case either way.
#[derive(Debug)]
pub struct LockGuard {
    client: Arc<SharedStateClient>,
    store_key: String,
    value: Vec<u8>,
    lock: Option<Lock<Held>>,
    metrics: Option<Arc<KilnMetrics>>,
}

impl LockGuard {
    pub fn record(&self) -> Option<&LockRecord> {
        self.lock.as_ref().map(|l| l.record())
    }

    /// Release the lease. Idempotent: returns `false` if the lease had
    /// already expired or been taken over.
    pub async fn release(mut self) -> StoreResult<bool> {
        let Some(lock) = self.lock.take() else {
            return Ok(false);
        };
        let lock = lock.release();
        self.returned();
        let released = self.client.delete_if_equals(&self.store_key, &self.value).await?;
        if !released {
            warn!(key = %lock.key(), "Lease expired before release; another holder may have recomputed");
        }
        Ok(released)
    }

    fn returned(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.lock_returned();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        self.returned();
        let lock = lock.release();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key = %lock.key(), "No runtime to release dropped lock; lease will expire");
            return;
        };
        let client = Arc::clone(&self.client);
        let store_key = std::mem::take(&mut self.store_key);
        let value = std::mem::take(&mut self.value);
        handle.spawn(async move {
            if let Err(e) = client.delete_if_equals(&store_key, &value).await {
                debug!(key = %lock.key(), error = %e, "Release of dropped lock failed");
            }
        });
    }
}
