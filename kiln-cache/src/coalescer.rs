//! Per-process coalescing of identical in-flight computations.
//!
//! The first caller for a key installs a [`Shared`] future in the registry
//! and every concurrent caller for the same key awaits a clone of it, so the
//! compute function runs once and all callers see the same outcome, error
//! or value.
//!
//! Cancellation follows the waiter count. A cancelled caller (including the
//! one that started the computation) just stops polling; any remaining
//! waiter keeps driving the shared future. Only when the last waiter goes
//! away is the entry removed and the computation dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use kiln_core::{ComputeError, KilnError, KilnResult};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type SharedOutcome<V> = Shared<BoxFuture<'static, KilnResult<V>>>;

struct Flight<V: Clone + Send + Sync + 'static> {
    generation: u64,
    waiters: usize,
    outcome: SharedOutcome<V>,
}

/// How a caller took part in a coalesced computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Started the computation.
    Leader,
    /// Attached to a computation already in flight.
    Joined,
}

/// Outcome handed to one caller.
#[derive(Debug, Clone)]
pub struct Coalesced<V> {
    pub role: Role,
    pub result: KilnResult<V>,
}

/// Registry of computations in flight in this process.
pub struct InFlightCoalescer<V: Clone + Send + Sync + 'static> {
    flights: Arc<DashMap<String, Flight<V>>>,
    next_generation: AtomicU64,
    led: AtomicU64,
    joined: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> Default for InFlightCoalescer<V> {
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            led: AtomicU64::new(0),
            joined: AtomicU64::new(0),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> std::fmt::Debug for InFlightCoalescer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightCoalescer")
            .field("in_flight", &self.in_flight())
            .field("led", &self.led())
            .field("joined", &self.joined())
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> InFlightCoalescer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `compute` for `key`, or join the run already in flight.
    ///
    /// `compute` is only called by the leader. It must not call back into
    /// this coalescer before returning its future.
    pub async fn coalesce<F, Fut>(&self, key: &str, compute: F) -> Coalesced<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = KilnResult<V>> + Send + 'static,
    {
        let (generation, outcome, role) = match self.flights.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let flight = occupied.get_mut();
                flight.waiters += 1;
                (flight.generation, flight.outcome.clone(), Role::Joined)
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let outcome = self.launch(key, generation, compute());
                vacant.insert(Flight {
                    generation,
                    waiters: 1,
                    outcome: outcome.clone(),
                });
                (generation, outcome, Role::Leader)
            }
        };

        match role {
            Role::Leader => self.led.fetch_add(1, Ordering::Relaxed),
            Role::Joined => self.joined.fetch_add(1, Ordering::Relaxed),
        };

        let _waiter = Waiter {
            flights: Arc::clone(&self.flights),
            key: key.to_string(),
            generation,
        };
        let result = outcome.await;
        Coalesced { role, result }
    }

    /// Wrap the leader's future: catch panics and retire the entry on settle.
    fn launch<Fut>(&self, key: &str, generation: u64, fut: Fut) -> SharedOutcome<V>
    where
        Fut: Future<Output = KilnResult<V>> + Send + 'static,
    {
        let flights = Arc::clone(&self.flights);
        let key = key.to_string();
        async move {
            let result = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(KilnError::from(ComputeError::Panicked { key: key.clone() })),
            };
            flights.remove_if(&key, |_, flight| flight.generation == generation);
            result
        }
        .boxed()
        .shared()
    }

    /// Computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Whether `key` has a computation in flight.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    /// Callers that started a computation.
    pub fn led(&self) -> u64 {
        self.led.load(Ordering::Relaxed)
    }

    /// Callers that joined a computation instead of starting one.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }
}

/// One caller's interest in a flight; the last one out removes the entry.
struct Waiter<V: Clone + Send + Sync + 'static> {
    flights: Arc<DashMap<String, Flight<V>>>,
    key: String,
    generation: u64,
}

impl<V: Clone + Send + Sync + 'static> Drop for Waiter<V> {
    fn drop(&mut self) {
        self.flights.remove_if_mut(&self.key, |_, flight| {
            if flight.generation != self.generation {
                return false;
            }
            flight.waiters = flight.waiters.saturating_sub(1);
            flight.waiters == 0
        });
    }
}
