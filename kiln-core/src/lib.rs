//! KILN Core - Cache Types
//!
//! Pure types shared by every KILN crate: cache keys and fingerprints, entry
//! and lease records, the error taxonomy, configuration, and the backoff
//! state machine. No I/O beyond reading source files for engine identity.

pub mod backoff;
pub mod config;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod identity;
pub mod key;
pub mod lock;

pub use backoff::{Backoff, BackoffPolicy, BackoffStep};
pub use config::KilnConfig;
pub use entry::{CacheEntry, ComputeOutput, PayloadRef};
pub use error::{
    ComputeError, ConfigError, CoordinationError, FingerprintError, KilnError, KilnResult,
    StoreError,
};
pub use fingerprint::{Canonicalizer, EngineIdentity, FingerprintComputer, MAX_DEPTH};
pub use health::{HealthCheck, HealthStatus};
pub use identity::{
    compute_content_hash, content_hash_hex, is_full_hash_hex, new_token, ContentHash, Timestamp,
    FULL_HASH_HEX_LEN,
};
pub use key::{validate_kind, CacheKey, KEY_SEPARATOR};
pub use lock::{Held, Lock, LockRecord, LockState, Released};
