//! The shared store protocol.
//!
//! Every cross-process guarantee in KILN comes from the atomicity of these
//! operations in the backing store. Callers never read-modify-write a key
//! without one of the conditional primitives below.

use async_trait::async_trait;
use kiln_core::StoreError;
use std::time::Duration;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A TTL-capable key-value store with single-key atomicity.
///
/// # Implementation Requirements
///
/// - `set_if_absent`, `set_extending_ttl` and `delete_if_equals` must be
///   atomic with respect to every other operation on the same key, across
///   processes
/// - `append_bounded` must push, trim, and refresh the TTL as one step
/// - an unreachable store must surface as `StoreError::Unavailable`; other
///   variants mean the store answered and the answer was bad
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a value unconditionally. `None` means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// Write a value whose expiry never moves earlier.
    ///
    /// The key expires `ttl` from now, or later if it already held a later
    /// expiry. A key with no expiry keeps none.
    async fn set_extending_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Write a value only if the key is absent. Returns whether it was written.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete a key only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Append to a list, evicting the oldest items past `max_len`, and reset
    /// the list's TTL.
    async fn append_bounded(
        &self,
        key: &str,
        item: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Every item of a list, oldest first. Absent lists are empty.
    async fn list_all(&self, key: &str) -> StoreResult<Vec<Vec<u8>>>;

    /// Check that the store is reachable.
    async fn ping(&self) -> StoreResult<()>;

    /// Short backend name for logs and errors.
    fn backend_name(&self) -> &'static str;
}
