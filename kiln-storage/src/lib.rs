//! KILN Storage - Shared Store Protocol and Backends
//!
//! Defines the shared key-value store protocol the coordination layer is
//! built on, an in-process backend used as the degraded-mode fallback, a
//! Redis backend (feature `redis`), the degraded-aware `SharedStateClient`,
//! and bounded event streams on top of it.

pub mod client;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;
pub mod streams;

pub use client::{ClientStats, SharedStateClient, StoreObserver};
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisStoreConfig};
pub use store::{SharedStore, StoreResult};
pub use streams::{SharedStateStore, StreamEvent, StreamKind, StreamLimits, StreamName};
