//! KILN Test Utilities
//!
//! Shared test infrastructure for the KILN workspace:
//! - Proptest generators for request parameters and engine identities
//! - A shared store that can be switched off to simulate an outage
//! - Counting compute fixtures for asserting "computed exactly once"
//! - Assertions for KILN error kinds

// Re-export core types for convenience
pub use kiln_core::{
    BackoffPolicy, CacheKey, ComputeOutput, EngineIdentity, FingerprintComputer, KilnConfig,
    KilnError, KilnResult, StoreError,
};
pub use kiln_storage::{InMemoryStore, SharedStateClient, SharedStore, StoreResult};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for KILN inputs.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    fn arb_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            (-1_000_000i64..1_000_000).prop_map(Value::from),
            (-1_000.0f64..1_000.0).prop_map(Value::from),
            "[a-zA-Z0-9 _.-]{0,16}".prop_map(Value::String),
        ]
    }

    /// Request parameters: nested objects and arrays, up to three levels.
    pub fn arb_params() -> impl Strategy<Value = Value> {
        let nested = arb_leaf().prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,10}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        });
        prop::collection::btree_map("[a-z_]{1,10}", nested, 0..8)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    /// A valid kind tag.
    pub fn arb_kind() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("geometry".to_string()),
            Just("export".to_string()),
            Just("profile".to_string()),
            "[a-z][a-z0-9_.-]{0,15}",
        ]
    }

    /// An engine identity with a full-length code hash.
    pub fn arb_engine_identity() -> impl Strategy<Value = EngineIdentity> {
        (
            "[a-z0-9.-]{1,12}",
            prop_oneof!["[0-9a-f]{40}", "[0-9a-f]{64}"],
            prop::collection::btree_map("[a-z_]{1,8}", "[a-z0-9.]{1,8}", 0..3),
        )
            .prop_map(|(build, code_hash, env)| {
                EngineIdentity::new(build, code_hash, env)
                    .expect("generator only produces valid identities")
            })
    }

    /// A semantically equivalent copy of `value`: every object's members
    /// reversed, and an extra null member added to each object.
    pub fn shuffled_equivalent(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::new();
                out.insert("unset_option".to_string(), Value::Null);
                for (k, v) in map.iter().rev() {
                    out.insert(k.clone(), shuffled_equivalent(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(shuffled_equivalent).collect()),
            other => other.clone(),
        }
    }
}

// ============================================================================
// STORES
// ============================================================================

/// A shared store that can be made unreachable.
///
/// Clones share the same data and the same reachability switch, so a test
/// can hand one clone to a client and flip the switch from outside.
#[derive(Debug, Clone)]
pub struct FlakyStore {
    inner: Arc<InMemoryStore>,
    reachable: Arc<AtomicBool>,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self::over(Arc::new(InMemoryStore::new()))
    }
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing store, reachable initially.
    pub fn over(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryStore> {
        &self.inner
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(StoreError::unavailable("flaky", "connection refused"))
        }
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_extending_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.inner.set_extending_ttl(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete_if_equals(key, expected).await
    }

    async fn append_bounded(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.check()?;
        self.inner.append_bounded(key, item, max_len, ttl).await
    }

    async fn list_all(&self, key: &str) -> StoreResult<Vec<Vec<u8>>> {
        self.check()?;
        self.inner.list_all(key).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Compute functions and configurations for cache tests.

    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use thiserror::Error;

    /// Error returned by failing compute fixtures.
    #[derive(Debug, Clone, Error, PartialEq, Eq)]
    #[error("fixture compute failed: {0}")]
    pub struct FixtureError(pub String);

    /// The future a fixture compute function returns.
    pub type ComputeFuture = Pin<Box<dyn Future<Output = Result<ComputeOutput, FixtureError>> + Send>>;

    /// A compute function that counts its invocations.
    ///
    /// Every closure produced by `task()` shares one counter, so a test can
    /// hand a task to each caller and then assert how many actually ran.
    #[derive(Debug, Clone)]
    pub struct CountingCompute {
        calls: Arc<AtomicUsize>,
        payload: Vec<u8>,
        delay: Duration,
        failure: Option<String>,
    }

    impl CountingCompute {
        /// Succeeds with `payload` (checksummed).
        pub fn returning(payload: impl Into<Vec<u8>>) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                payload: payload.into(),
                delay: Duration::ZERO,
                failure: None,
            }
        }

        /// Fails with `FixtureError(message)`.
        pub fn failing(message: impl Into<String>) -> Self {
            Self {
                failure: Some(message.into()),
                ..Self::returning(Vec::new())
            }
        }

        /// Sleep (on the tokio clock) before returning.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// How many times a task has started running.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// A compute function for one `get_or_compute` call.
        pub fn task(&self) -> impl FnOnce() -> ComputeFuture + Send + 'static {
            let calls = Arc::clone(&self.calls);
            let payload = self.payload.clone();
            let delay = self.delay;
            let failure = self.failure.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match failure {
                        Some(message) => Err(FixtureError(message)),
                        None => Ok(ComputeOutput::new(payload)),
                    }
                })
            }
        }
    }

    /// Configuration with short timings for coordination tests.
    pub fn fast_config() -> KilnConfig {
        KilnConfig::default()
            .with_namespace("kiln-test")
            .with_lock_lease(Duration::from_secs(5))
            .with_wait(Duration::from_secs(1), Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(50))
            .with_backoff(BackoffPolicy {
                initial: Duration::from_millis(10),
                multiplier: 1.5,
                max: Duration::from_millis(100),
                jitter: 0.0,
            })
            .with_recovery_probe_interval(Duration::from_millis(100))
    }

    /// A client over `store`, as one process of a fleet would hold it.
    pub fn client_over(store: Arc<dyn SharedStore>, config: &KilnConfig) -> Arc<SharedStateClient> {
        Arc::new(SharedStateClient::new(store, config))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on KILN results.

    use super::*;

    /// Assert the result is a lock/publish wait timeout.
    pub fn assert_lock_timeout<T: std::fmt::Debug>(result: &KilnResult<T>) {
        match result {
            Err(e) if e.is_lock_timeout() => {}
            other => panic!("Expected LockTimeout, got {:?}", other),
        }
    }

    /// Assert the result wraps a compute failure whose source reads `message`.
    pub fn assert_compute_failed<T: std::fmt::Debug>(result: &KilnResult<T>, message: &str) {
        let err = match result {
            Err(e) if e.is_compute_error() => e,
            other => panic!("Expected ComputeError, got {:?}", other),
        };
        let source = std::error::Error::source(err)
            .and_then(std::error::Error::source)
            .map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some(message),
            "collaborator error not preserved in {err}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_flaky_store_switch() {
        let store = FlakyStore::new();
        store.set("k", b"v", None).await.unwrap();

        store.set_reachable(false);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.ping().await.is_err());

        store.set_reachable(true);
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_counting_compute_counts_started_tasks() {
        let compute = CountingCompute::returning(b"x".to_vec());
        let task = compute.task();
        let _unused = compute.task();
        let output = task().await.unwrap();
        assert_eq!(output.payload(), b"x");
        assert_eq!(compute.calls(), 1);
    }

    #[tokio::test]
    async fn test_failing_compute() {
        let compute = CountingCompute::failing("boom");
        let err = compute.task()().await.unwrap_err();
        assert_eq!(err, FixtureError("boom".to_string()));
    }

    #[test]
    fn test_fast_config_is_valid() {
        assert!(fast_config().validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_shuffled_equivalent_has_same_key(
            params in arb_params(),
            engine in arb_engine_identity(),
            kind in arb_kind(),
        ) {
            let computer = FingerprintComputer::default();
            let a = computer.compute_key(&kind, &engine, &params).unwrap();
            let b = computer.compute_key(&kind, &engine, &shuffled_equivalent(&params)).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
