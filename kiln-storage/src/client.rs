//! Degraded-aware client over the shared store.
//!
//! The client routes every operation to the external store while it is
//! reachable. When the store reports `Unavailable`, the client switches to
//! its in-process fallback and stays there until a recovery probe succeeds.
//! While degraded, locks and coalescing only hold within this process, so
//! the state is exposed through `is_degraded`, `health`, and the observer.
//!
//! Expired fallback keys are reclaimed at most once per recovery probe
//! interval while the fallback serves traffic, and again on recovery.

use chrono::Utc;
use kiln_core::{ConfigError, HealthCheck, KilnConfig, StoreError, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::memory::InMemoryStore;
use crate::store::{SharedStore, StoreResult};

const COMPONENT: &str = "shared_store";

/// Receives degraded-mode transitions and fallback usage.
pub trait StoreObserver: Send + Sync {
    /// Called on every transition into (`true`) or out of (`false`) degraded mode.
    fn degraded_changed(&self, degraded: bool);

    /// Called for each operation served by the fallback.
    fn fallback_operation(&self, op: &'static str);
}

#[derive(Debug, Default)]
struct DegradedState {
    since: Option<Timestamp>,
    reason: Option<String>,
    last_probe: Option<Instant>,
    last_purge: Option<Instant>,
}

/// Snapshot of the client's routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub backend: &'static str,
    pub degraded: bool,
    pub degraded_since: Option<Timestamp>,
    pub fallback_operations: u64,
}

/// Shared state client with in-process fallback.
pub struct SharedStateClient {
    primary: Option<Arc<dyn SharedStore>>,
    fallback: Arc<InMemoryStore>,
    namespace: String,
    recovery_probe_interval: Duration,
    degraded: AtomicBool,
    state: Mutex<DegradedState>,
    fallback_operations: AtomicU64,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl std::fmt::Debug for SharedStateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateClient")
            .field("backend", &self.backend_name())
            .field("namespace", &self.namespace)
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

/// Route one operation: primary while healthy, fallback otherwise.
macro_rules! routed {
    ($self:ident, $op:literal, |$store:ident| $call:expr) => {{
        if let Some($store) = $self.primary_for_op().await {
            match $call.await {
                Err(e) if e.is_unavailable() => $self.enter_degraded($op, &e),
                other => return other,
            }
        }
        $self.note_fallback($op);
        $self.purge_fallback_if_due();
        let $store: &dyn SharedStore = $self.fallback.as_ref();
        $call.await
    }};
}

impl SharedStateClient {
    /// Client over an external store.
    pub fn new(primary: Arc<dyn SharedStore>, config: &KilnConfig) -> Self {
        Self::build(Some(primary), config)
    }

    /// Client with no external store. Starts, and stays, degraded.
    pub fn in_process(config: &KilnConfig) -> Self {
        let client = Self::build(None, config);
        client.degraded.store(true, Ordering::Release);
        if let Ok(mut state) = client.state.lock() {
            state.since = Some(Utc::now());
            state.reason = Some("no shared store configured".to_string());
        }
        client
    }

    /// Client for `config.store_url`, or an in-process client when unset.
    pub fn from_config(config: &KilnConfig) -> Result<Self, ConfigError> {
        let Some(url) = config.store_url.as_deref() else {
            return Ok(Self::in_process(config));
        };
        if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
            return Err(ConfigError::InvalidValue {
                field: "store_url".to_string(),
                value: url.to_string(),
                reason: "expected a redis:// or rediss:// URL".to_string(),
            });
        }
        Self::connect_redis(url, config)
    }

    #[cfg(feature = "redis")]
    fn connect_redis(url: &str, config: &KilnConfig) -> Result<Self, ConfigError> {
        use crate::redis::{RedisStore, RedisStoreConfig};

        let store = RedisStore::new(RedisStoreConfig::new(url, config.store_operation_timeout))
            .map_err(|e| ConfigError::InvalidValue {
                field: "store_url".to_string(),
                value: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(Arc::new(store), config))
    }

    #[cfg(not(feature = "redis"))]
    fn connect_redis(_url: &str, _config: &KilnConfig) -> Result<Self, ConfigError> {
        Err(ConfigError::IncompatibleOptions {
            option_a: "store_url".to_string(),
            option_b: "build without the redis feature".to_string(),
        })
    }

    fn build(primary: Option<Arc<dyn SharedStore>>, config: &KilnConfig) -> Self {
        Self {
            primary,
            fallback: Arc::new(InMemoryStore::new()),
            namespace: config.namespace.clone(),
            recovery_probe_interval: config.recovery_probe_interval,
            degraded: AtomicBool::new(false),
            state: Mutex::new(DegradedState::default()),
            fallback_operations: AtomicU64::new(0),
            observer: None,
        }
    }

    /// Report degraded transitions and fallback usage to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        if self.is_degraded() {
            observer.degraded_changed(true);
        }
        self.observer = Some(observer);
        self
    }

    /// Key namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `<namespace>:<family>:<key>`.
    pub fn namespaced(&self, family: &str, key: &str) -> String {
        format!("{}:{}:{}", self.namespace, family, key)
    }

    /// Name of the external backend, or of the fallback if there is none.
    pub fn backend_name(&self) -> &'static str {
        self.primary
            .as_ref()
            .map_or(self.fallback.backend_name(), |p| p.backend_name())
    }

    /// Whether cross-process guarantees are currently suspended.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// When the current degraded period started.
    pub fn degraded_since(&self) -> Option<Timestamp> {
        if !self.is_degraded() {
            return None;
        }
        self.state.lock().ok().and_then(|s| s.since)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            backend: self.backend_name(),
            degraded: self.is_degraded(),
            degraded_since: self.degraded_since(),
            fallback_operations: self.fallback_operations.load(Ordering::Relaxed),
        }
    }

    /// Health of the shared store connection.
    pub fn health(&self) -> HealthCheck {
        let fallback_ops = serde_json::json!(self.fallback_operations.load(Ordering::Relaxed));
        if !self.is_degraded() {
            return HealthCheck::healthy(COMPONENT)
                .with_metadata("backend", serde_json::json!(self.backend_name()))
                .with_metadata("fallback_operations", fallback_ops);
        }

        let (since, reason) = self
            .state
            .lock()
            .map(|s| (s.since, s.reason.clone()))
            .unwrap_or((None, None));
        let mut check = HealthCheck::degraded(
            COMPONENT,
            format!(
                "using in-process fallback, cross-process coordination suspended: {}",
                reason.as_deref().unwrap_or("store unavailable")
            ),
        )
        .with_metadata("backend", serde_json::json!(self.backend_name()))
        .with_metadata("fallback_operations", fallback_ops);
        if let Some(since) = since {
            check = check.with_since(since);
        }
        check
    }

    /// Probe the external store now, leaving degraded mode on success.
    ///
    /// Returns whether the external store is reachable.
    pub async fn probe(&self) -> bool {
        let Some(primary) = self.primary.as_ref() else {
            return false;
        };
        if let Ok(mut state) = self.state.lock() {
            state.last_probe = Some(Instant::now());
        }
        match primary.ping().await {
            Ok(()) => {
                self.leave_degraded();
                true
            }
            Err(e) => {
                if e.is_unavailable() {
                    self.enter_degraded("ping", &e);
                }
                debug!(backend = primary.backend_name(), error = %e, "Shared store probe failed");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Store operations
    // ------------------------------------------------------------------------

    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        routed!(self, "get", |store| store.get(key))
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        routed!(self, "set", |store| store.set(key, value, ttl))
    }

    pub async fn set_extending_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        routed!(self, "set_extending_ttl", |store| store.set_extending_ttl(key, value, ttl))
    }

    pub async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        routed!(self, "set_if_absent", |store| store.set_if_absent(key, value, ttl))
    }

    /// Delete from the external store and from the fallback.
    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        let in_fallback = self.fallback.delete(key).await?;
        let removed = self.delete_routed(key).await?;
        Ok(removed || in_fallback)
    }

    /// Compare-and-delete on the external store and on the fallback.
    pub async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let in_fallback = self.fallback.delete_if_equals(key, expected).await?;
        let removed = self.delete_if_equals_routed(key, expected).await?;
        Ok(removed || in_fallback)
    }

    pub async fn append_bounded(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        routed!(self, "append_bounded", |store| store.append_bounded(key, item, max_len, ttl))
    }

    pub async fn list_all(&self, key: &str) -> StoreResult<Vec<Vec<u8>>> {
        routed!(self, "list_all", |store| store.list_all(key))
    }

    async fn delete_routed(&self, key: &str) -> StoreResult<bool> {
        routed!(self, "delete", |store| store.delete(key))
    }

    async fn delete_if_equals_routed(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        routed!(self, "delete_if_equals", |store| store.delete_if_equals(key, expected))
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// The external store, if it should serve the next operation.
    async fn primary_for_op(&self) -> Option<Arc<dyn SharedStore>> {
        let primary = self.primary.as_ref()?;
        if !self.is_degraded() {
            return Some(Arc::clone(primary));
        }
        if self.probe_due() && self.probe().await {
            return Some(Arc::clone(primary));
        }
        None
    }

    fn probe_due(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state
            .last_probe
            .map_or(true, |at| at.elapsed() >= self.recovery_probe_interval)
    }

    fn enter_degraded(&self, op: &'static str, error: &StoreError) {
        let newly = !self.degraded.swap(true, Ordering::AcqRel);
        if let Ok(mut state) = self.state.lock() {
            if newly {
                state.since = Some(Utc::now());
                state.last_probe = Some(Instant::now());
            }
            state.reason = Some(error.to_string());
        }
        if newly {
            warn!(
                backend = self.backend_name(),
                op,
                error = %error,
                "Shared store unreachable, entering degraded mode (cross-process coordination suspended)"
            );
            if let Some(observer) = &self.observer {
                observer.degraded_changed(true);
            }
        }
    }

    fn leave_degraded(&self) {
        if !self.degraded.swap(false, Ordering::AcqRel) {
            return;
        }
        let since = self.state.lock().ok().and_then(|mut s| {
            s.reason = None;
            s.since.take()
        });
        self.purge_fallback();
        info!(
            backend = self.backend_name(),
            degraded_for_ms = since.map(|s| (Utc::now() - s).num_milliseconds()).unwrap_or(0),
            "Shared store reachable again, leaving degraded mode"
        );
        if let Some(observer) = &self.observer {
            observer.degraded_changed(false);
        }
    }

    fn purge_fallback_if_due(&self) {
        let due = match self.state.lock() {
            Ok(mut state) => {
                let now = Instant::now();
                let due = state
                    .last_purge
                    .map_or(true, |at| now.duration_since(at) >= self.recovery_probe_interval);
                if due {
                    state.last_purge = Some(now);
                }
                due
            }
            Err(_) => false,
        };
        if due {
            self.purge_fallback();
        }
    }

    fn purge_fallback(&self) {
        match self.fallback.purge_expired() {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Reclaimed expired fallback keys"),
            Err(e) => warn!(error = %e, "Fallback purge failed"),
        }
    }

    fn note_fallback(&self, op: &'static str) {
        self.fallback_operations.fetch_add(1, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer.fallback_operation(op);
        }
    }
}
