//! End-to-end coordination tests for the KILN compute cache
//!
//! "Processes" are separate `ComputeCache` instances, each with its own
//! client, lock manager and coalescer, sharing one external store.

use kiln_cache::{ComputeCache, KilnMetrics, ReadSource};
use kiln_core::{CacheKey, KilnConfig};
use kiln_storage::{InMemoryStore, SharedStateStore, SharedStore, StreamKind, StreamName};
use kiln_test_utils::assertions::{assert_compute_failed, assert_lock_timeout};
use kiln_test_utils::fixtures::{client_over, fast_config, CountingCompute};
use kiln_test_utils::FlakyStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn key(raw: &str) -> CacheKey {
    CacheKey::opaque(raw).unwrap()
}

/// One cache per simulated process, all over `store`.
fn fleet(processes: usize, store: Arc<dyn SharedStore>, config: &KilnConfig) -> Vec<Arc<ComputeCache>> {
    (0..processes)
        .map(|_| {
            let client = client_over(Arc::clone(&store), config);
            Arc::new(ComputeCache::new(client, config.clone()))
        })
        .collect()
}

// ============================================================================
// SAME-PROCESS COALESCING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_computation() {
    let config = fast_config();
    let cache = &fleet(1, Arc::new(InMemoryStore::new()), &config)[0];
    let k = key("build:v7:part-123");
    let compute = CountingCompute::returning(b"X".to_vec()).with_delay(Duration::from_millis(100));

    let started = Instant::now();
    let (a, b) = tokio::join!(
        cache.get_or_compute(&k, compute.task(), None),
        cache.get_or_compute(&k, compute.task(), None),
    );
    let elapsed = started.elapsed();

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.payload(), b"X");
    assert_eq!(b.payload(), b"X");
    assert_eq!(compute.calls(), 1);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(200), "waited {elapsed:?}");

    let sources = [a.source, b.source];
    assert!(sources.contains(&ReadSource::Computed));
    assert!(sources.contains(&ReadSource::Joined));
}

#[tokio::test(start_paused = true)]
async fn test_many_tasks_in_one_process() {
    let config = fast_config();
    let cache = Arc::clone(&fleet(1, Arc::new(InMemoryStore::new()), &config)[0]);
    let compute = CountingCompute::returning(b"mesh".to_vec()).with_delay(Duration::from_millis(50));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let task = compute.task();
            tokio::spawn(async move { cache.get_or_compute(&key("export:v7:stl"), task, None).await })
        })
        .collect();

    for handle in handles {
        let read = handle.await.unwrap().unwrap();
        assert_eq!(read.payload(), b"mesh");
    }
    assert_eq!(compute.calls(), 1);

    let stats = cache.stats();
    assert_eq!(stats.computes, 1);
    assert_eq!(stats.coalesced_joins + stats.hits, 15);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_coalesced_waiters_share_the_error() {
    let config = fast_config();
    let cache = &fleet(1, Arc::new(InMemoryStore::new()), &config)[0];
    let k = key("build:v7:broken");
    let compute = CountingCompute::failing("non-manifold edge").with_delay(Duration::from_millis(20));

    let (a, b) = tokio::join!(
        cache.get_or_compute(&k, compute.task(), None),
        cache.get_or_compute(&k, compute.task(), None),
    );

    assert_compute_failed(&a, "fixture compute failed: non-manifold edge");
    assert_compute_failed(&b, "fixture compute failed: non-manifold edge");
    assert_eq!(compute.calls(), 1);
}

// ============================================================================
// CROSS-PROCESS COORDINATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_two_processes_compute_once() {
    let config = fast_config();
    let caches = fleet(2, Arc::new(InMemoryStore::new()), &config);
    let k = key("build:v7:part-123");
    let compute = CountingCompute::returning(b"X".to_vec()).with_delay(Duration::from_millis(100));

    let (a, b) = tokio::join!(
        caches[0].get_or_compute(&k, compute.task(), None),
        caches[1].get_or_compute(&k, compute.task(), None),
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(compute.calls(), 1);
    assert_eq!(a.payload(), b.payload());
    let sources = [a.source, b.source];
    assert!(sources.contains(&ReadSource::Computed));
    assert!(sources.contains(&ReadSource::PublishedByPeer));
}

#[tokio::test(start_paused = true)]
async fn test_fleet_of_processes_with_many_callers_each() {
    let config = fast_config();
    let caches = fleet(4, Arc::new(InMemoryStore::new()), &config);
    let compute = CountingCompute::returning(b"gear".to_vec()).with_delay(Duration::from_millis(200));

    let mut handles = Vec::new();
    for cache in &caches {
        for _ in 0..3 {
            let cache = Arc::clone(cache);
            let task = compute.task();
            handles.push(tokio::spawn(async move {
                cache.get_or_compute(&key("geometry:v7:gear"), task, None).await
            }));
        }
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().payload(), b"gear");
    }
    assert_eq!(compute.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exactly_one_lock_racer_wins() {
    let config = fast_config();
    let caches = fleet(2, Arc::new(InMemoryStore::new()), &config);
    let lease = Duration::from_secs(5);

    let (a, b) = tokio::join!(
        caches[0].lock().try_acquire("build:v7:race", lease),
        caches[1].lock().try_acquire("build:v7:race", lease),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_some() != b.is_some(), "exactly one racer must win");

    let winner = a.or(b).unwrap();
    let holder = winner.record().unwrap().holder_id.clone();
    let seen = caches[1].lock().inspect("build:v7:race").await.unwrap().unwrap();
    assert_eq!(seen.holder_id, holder);

    assert!(winner.release().await.unwrap());
    assert!(caches[1].lock().try_acquire("build:v7:race", lease).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stale_holder_cannot_release_successor_lease() {
    let config = fast_config();
    let caches = fleet(2, Arc::new(InMemoryStore::new()), &config);

    let stale = caches[0]
        .lock()
        .try_acquire("build:v7:fence", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let successor = caches[1]
        .lock()
        .try_acquire("build:v7:fence", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert!(!stale.release().await.unwrap());

    let current = caches[0].lock().inspect("build:v7:fence").await.unwrap().unwrap();
    assert_eq!(current.token, successor.record().unwrap().token);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_holder_times_out_waiters_until_lease_expires() {
    let config = fast_config();
    let caches = fleet(2, Arc::new(InMemoryStore::new()), &config);
    let k = key("build:v7:crash");

    // Holder takes the lease and never releases it.
    let guard = caches[0]
        .lock()
        .try_acquire(k.as_str(), config.lock_lease)
        .await
        .unwrap()
        .unwrap();
    std::mem::forget(guard);

    let compute = CountingCompute::returning(b"late".to_vec());
    let started = Instant::now();
    let result = caches[1].get_or_compute(&k, compute.task(), None).await;
    assert_lock_timeout(&result);
    assert_eq!(compute.calls(), 0);
    assert!(started.elapsed() >= config.overall_deadline);
    assert_eq!(caches[1].stats().lock_timeouts, 1);

    tokio::time::advance(config.lock_lease).await;
    let read = caches[1].get_or_compute(&k, compute.task(), None).await.unwrap();
    assert_eq!(read.source, ReadSource::Computed);
    assert_eq!(compute.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_receives_result_published_after_lock_timeout() {
    let config = fast_config();
    let caches = fleet(2, Arc::new(InMemoryStore::new()), &config);
    let k = key("build:v7:slow");

    // Compute outlasts the lock wait timeout but finishes before the deadline.
    let slow = CountingCompute::returning(b"slow".to_vec()).with_delay(Duration::from_millis(1500));
    let other = CountingCompute::returning(b"never".to_vec());

    let leader = caches[0].get_or_compute(&k, slow.task(), None);
    let waiter = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        caches[1].get_or_compute(&k, other.task(), None).await
    };
    let (a, b) = tokio::join!(leader, waiter);

    assert_eq!(a.unwrap().payload(), b"slow");
    let b = b.unwrap();
    assert_eq!(b.payload(), b"slow");
    assert_eq!(b.source, ReadSource::PublishedByPeer);
    assert_eq!(other.calls(), 0);
}

// ============================================================================
// RESULTS
// ============================================================================

#[tokio::test]
async fn test_empty_artifact_is_cached() {
    let config = fast_config();
    let cache = &fleet(1, Arc::new(InMemoryStore::new()), &config)[0];
    let k = key("export:v7:empty-assembly");
    let compute = CountingCompute::returning(Vec::new());

    cache.get_or_compute(&k, compute.task(), None).await.unwrap();
    let read = cache.get_or_compute(&k, compute.task(), None).await.unwrap();

    assert!(read.is_hit());
    assert!(read.payload().is_empty());
    assert_eq!(compute.calls(), 1);
}

#[tokio::test]
async fn test_failed_compute_is_not_cached_and_lease_is_released() {
    let config = fast_config();
    let cache = &fleet(1, Arc::new(InMemoryStore::new()), &config)[0];
    let k = key("build:v7:retry");

    let failing = CountingCompute::failing("disk full");
    let result = cache.get_or_compute(&k, failing.task(), None).await;
    assert_compute_failed(&result, "fixture compute failed: disk full");
    assert!(cache.lock().inspect(k.as_str()).await.unwrap().is_none());

    let working = CountingCompute::returning(b"ok".to_vec());
    let read = cache.get_or_compute(&k, working.task(), None).await.unwrap();
    assert_eq!(read.source, ReadSource::Computed);
    assert_eq!(working.calls(), 1);
}

// ============================================================================
// DEGRADED MODE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_degrades_and_recovers() {
    let config = fast_config();
    let metrics = Arc::new(KilnMetrics::unregistered().unwrap());
    let flaky = FlakyStore::new();
    flaky.set_reachable(false);

    let client = kiln_storage::SharedStateClient::new(Arc::new(flaky.clone()), &config)
        .with_observer(metrics.clone());
    let cache = ComputeCache::new(Arc::new(client), config.clone()).with_metrics(metrics.clone());
    let k = key("build:v7:offline");
    let compute = CountingCompute::returning(b"local".to_vec());

    let read = cache.get_or_compute(&k, compute.task(), None).await.unwrap();
    assert_eq!(read.payload(), b"local");
    assert!(cache.stats().degraded);
    assert!(!cache.client().health().is_healthy());
    assert_eq!(metrics.store_degraded.get(), 1.0);

    // Served from the in-process fallback while degraded.
    assert!(cache.get_or_compute(&k, compute.task(), None).await.unwrap().is_hit());
    assert_eq!(compute.calls(), 1);

    flaky.set_reachable(true);
    tokio::time::advance(config.recovery_probe_interval).await;

    // Fallback contents are not migrated, so the recovered store misses once.
    let read = cache.get_or_compute(&k, compute.task(), None).await.unwrap();
    assert_eq!(read.source, ReadSource::Computed);
    assert!(!cache.stats().degraded);
    assert_eq!(metrics.store_degraded.get(), 0.0);
    assert_eq!(compute.calls(), 2);

    let text = metrics.encode_text().unwrap();
    assert!(text.contains("kiln_store_fallback_operations_total"));
    assert!(text.contains("kiln_compute_total"));
}

// ============================================================================
// SHARED STATE STREAMS
// ============================================================================

#[tokio::test]
async fn test_stream_keeps_most_recent_events() {
    let config = fast_config().with_stream_limits(100, Duration::from_secs(3600));
    let client = client_over(Arc::new(InMemoryStore::new()), &config);
    let streams = SharedStateStore::new(client, &config);
    let stream = StreamName::new(StreamKind::OperationHistory, "job-42");

    for seq in 0..1000 {
        streams.append_event(&stream, json!({ "seq": seq })).await.unwrap();
    }

    let events = streams.read_events(&stream).await.unwrap();
    assert_eq!(events.len(), 100);
    let seqs: Vec<i64> = events.iter().map(|e| e.payload["seq"].as_i64().unwrap()).collect();
    assert_eq!(seqs, (900..1000).collect::<Vec<i64>>());
}

#[tokio::test(start_paused = true)]
async fn test_stream_shared_between_processes_and_degrades() {
    let config = fast_config();
    let flaky = FlakyStore::new();
    let writer = SharedStateStore::new(client_over(Arc::new(flaky.clone()), &config), &config);
    let reader = SharedStateStore::new(client_over(Arc::new(flaky.clone()), &config), &config);
    let stream = StreamName::new(StreamKind::ActiveOperations, "job-7");

    writer.append_event(&stream, json!({ "op": "mesh" })).await.unwrap();
    assert_eq!(reader.read_events(&stream).await.unwrap().len(), 1);

    flaky.set_reachable(false);
    writer.append_event(&stream, json!({ "op": "export" })).await.unwrap();
    assert!(writer.is_degraded());
    let local = writer.read_events(&stream).await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].payload["op"], "export");
}
