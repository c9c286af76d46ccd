//! In-process store.
//!
//! Serves as the degraded-mode fallback and as the test backend. Expiry is
//! lazy: expired keys are dropped when touched, or in bulk by
//! `purge_expired`. Time comes from `tokio::time`, so paused-clock tests
//! can drive lease and stream expiry.

use async_trait::async_trait;
use kiln_core::StoreError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::store::{SharedStore, StoreResult};

const BACKEND: &str = "memory";

#[derive(Debug, Clone)]
enum SlotValue {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: SlotValue,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// A single-process key-value store with TTLs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = Instant::now();
        let mut slots = self.slots()?;
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        Ok(before - slots.len())
    }

    /// Number of live keys.
    pub fn len(&self) -> StoreResult<usize> {
        let now = Instant::now();
        Ok(self.slots()?.values().filter(|s| s.is_live(now)).count())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    fn slots(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn expire(slots: &mut HashMap<String, Slot>, key: &str, now: Instant) {
        if slots.get(key).is_some_and(|s| !s.is_live(now)) {
            slots.remove(key);
        }
    }

    /// Live slot for `key`, removing it first if it has expired.
    fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str, now: Instant) -> Option<&'a mut Slot> {
        Self::expire(slots, key, now);
        slots.get_mut(key)
    }

    fn wrong_type(key: &str, expected: &str) -> StoreError {
        StoreError::Corrupt {
            backend: BACKEND.to_string(),
            key: key.to_string(),
            reason: format!("key does not hold a {expected}"),
        }
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut slots = self.slots()?;
        match Self::live(&mut slots, key, Instant::now()) {
            None => Ok(None),
            Some(Slot {
                value: SlotValue::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(Self::wrong_type(key, "value")),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.slots()?.insert(
            key.to_string(),
            Slot {
                value: SlotValue::Bytes(value.to_vec()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_extending_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut slots = self.slots()?;
        let requested = now + ttl;
        let expires_at = match Self::live(&mut slots, key, now) {
            Some(slot) => slot.expires_at.map(|at| at.max(requested)),
            None => Some(requested),
        };
        slots.insert(
            key.to_string(),
            Slot {
                value: SlotValue::Bytes(value.to_vec()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut slots = self.slots()?;
        if Self::live(&mut slots, key, now).is_some() {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: SlotValue::Bytes(value.to_vec()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut slots = self.slots()?;
        Ok(slots.remove(key).is_some_and(|s| s.is_live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut slots = self.slots()?;
        let matches = matches!(
            Self::live(&mut slots, key, Instant::now()),
            Some(Slot { value: SlotValue::Bytes(bytes), .. }) if bytes.as_slice() == expected
        );
        if matches {
            slots.remove(key);
        }
        Ok(matches)
    }

    async fn append_bounded(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = Instant::now();
        let max_len = max_len.max(1);
        let mut slots = self.slots()?;
        Self::expire(&mut slots, key, now);
        let slot = slots.entry(key.to_string()).or_insert(Slot {
            value: SlotValue::List(VecDeque::new()),
            expires_at: None,
        });
        let SlotValue::List(items) = &mut slot.value else {
            return Err(Self::wrong_type(key, "list"));
        };
        items.push_back(item.to_vec());
        while items.len() > max_len {
            items.pop_front();
        }
        slot.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn list_all(&self, key: &str) -> StoreResult<Vec<Vec<u8>>> {
        let mut slots = self.slots()?;
        match Self::live(&mut slots, key, Instant::now()) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: SlotValue::List(items),
                ..
            }) => Ok(items.iter().cloned().collect()),
            Some(_) => Err(Self::wrong_type(key, "list")),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.slots().map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}
