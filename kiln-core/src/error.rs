//! Error types for KILN operations

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Shared store {backend} unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("Shared store {backend} returned corrupt data for {key}: {reason}")]
    Corrupt {
        backend: String,
        key: String,
        reason: String,
    },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Build an `Unavailable` error for a backend.
    pub fn unavailable(backend: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors raised while deriving cache keys.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Invalid kind tag {tag:?}: {reason}")]
    InvalidKind { tag: String, reason: String },

    #[error("Invalid engine identity: {reason}")]
    InvalidEngineIdentity { reason: String },

    #[error("Code hash {hash:?} is {len} characters; a full-length hash of at least 40 hex characters is required")]
    TruncatedCodeHash { hash: String, len: usize },

    #[error("Malformed request parameters: {reason}")]
    Malformed { reason: String },

    #[error("Request parameters nested deeper than {max_depth} levels")]
    TooDeep { max_depth: usize },
}

/// Fleet coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("Timed out after {waited:?} waiting for {key} (lock held elsewhere, no result published)")]
    LockTimeout { key: String, waited: Duration },
}

/// Failure of the wrapped compute function.
///
/// The collaborator's error is kept behind an `Arc` so the same outcome can
/// be handed to every coalesced waiter while the source chain stays intact.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    #[error("Computation for {key} failed: {source}")]
    Failed {
        key: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("Computation for {key} panicked")]
    Panicked { key: String },
}

impl ComputeError {
    /// Wrap a collaborator error without masking it.
    pub fn failed<E>(key: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed {
            key: key.into(),
            source: Arc::new(error),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all KILN errors.
#[derive(Debug, Clone, Error)]
pub enum KilnError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Compute error: {0}")]
    Compute(#[from] ComputeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KilnError {
    /// Whether this is a lock/publish wait timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(
            self,
            KilnError::Coordination(CoordinationError::LockTimeout { .. })
        )
    }

    /// Whether this wraps a compute function failure.
    pub fn is_compute_error(&self) -> bool {
        matches!(self, KilnError::Compute(_))
    }
}

/// Result type alias for KILN operations.
pub type KilnResult<T> = Result<T, KilnError>;

// =============================================================================
// TESTS
// =============================================================================
