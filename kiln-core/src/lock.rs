//! Lease records and the held-lease typestate.
//!
//! A lease can only be released while it is held; release consumes it.
//!
//! ```text
//! (unlocked) ─── acquire() ──→ Held ─── release() ──→ Released
//!                                │
//!                          lease expiry ──→ (unlocked)
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::identity::{new_token, Timestamp};

// ============================================================================
// LOCK RECORD
// ============================================================================

/// What is stored under a lock key while a lease is held.
///
/// `token` is unique per acquisition, so a holder whose lease expired cannot
/// release a lease granted to someone else afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub holder_id: String,
    pub token: Uuid,
    pub acquired_at: Timestamp,
    pub lease_ttl_ms: u64,
}

impl LockRecord {
    /// Start a new lease for `holder_id`.
    pub fn new(key: impl Into<String>, holder_id: impl Into<String>, lease_ttl: Duration) -> Self {
        Self {
            key: key.into(),
            holder_id: holder_id.into(),
            token: new_token(),
            acquired_at: Utc::now(),
            lease_ttl_ms: u64::try_from(lease_ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// When the lease lapses if never released.
    pub fn expires_at(&self) -> Timestamp {
        let ttl = chrono::Duration::from_std(self.lease_ttl()).unwrap_or(chrono::Duration::MAX);
        self.acquired_at
            .checked_add_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at()
    }

    /// Remaining lease time, `None` once expired.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at() - now).to_std().ok()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(backend: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            backend: backend.to_string(),
            key: "lock record".to_string(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lease states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Lease is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Held;
impl LockState for Held {}

/// Lease has been given up; only its record remains, for logging and the
/// store's compare-and-delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LockState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Held {}
    impl Sealed for super::Released {}
}

/// A lease with compile-time state tracking.
#[derive(Debug, Clone)]
pub struct Lock<S: LockState> {
    record: LockRecord,
    _state: PhantomData<S>,
}

impl<S: LockState> Lock<S> {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub fn token(&self) -> Uuid {
        self.record.token
    }
}

impl Lock<Held> {
    /// Wrap a record that was just written with create-if-absent.
    pub fn new(record: LockRecord) -> Self {
        Lock {
            record,
            _state: PhantomData,
        }
    }

    /// Give up the lease. The returned lock can no longer be released.
    pub fn release(self) -> Lock<Released> {
        Lock {
            record: self.record,
            _state: PhantomData,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.record.is_expired(now)
    }
}
