//! Cache keys: `<engine-fingerprint>:<kind-tag>:<request-fingerprint>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FingerprintError;
use crate::identity::is_full_hash_hex;

/// Separator between key components.
pub const KEY_SEPARATOR: char = ':';

/// Validate a kind tag (`build`, `export.step`, `profile-snapshot`, ...).
pub fn validate_kind(tag: &str) -> Result<(), FingerprintError> {
    if tag.is_empty() {
        return Err(FingerprintError::InvalidKind {
            tag: tag.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if let Some(bad) = tag
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.')))
    {
        return Err(FingerprintError::InvalidKind {
            tag: tag.to_string(),
            reason: format!("character {:?} not allowed", bad),
        });
    }
    Ok(())
}

/// An opaque cache key.
///
/// Keys built by the fingerprint computer always have three components.
/// Keys supplied by callers (`CacheKey::opaque`) only need to be non-empty;
/// their kind is the middle component when one exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    raw: String,
}

impl CacheKey {
    /// Assemble a key from already-computed fingerprints.
    pub(crate) fn from_parts(engine: &str, kind: &str, request: &str) -> Self {
        Self {
            raw: format!("{engine}{KEY_SEPARATOR}{kind}{KEY_SEPARATOR}{request}"),
        }
    }

    /// Wrap a caller-chosen key string.
    pub fn opaque(raw: impl Into<String>) -> Result<Self, FingerprintError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(FingerprintError::Malformed {
                reason: "cache key must not be empty".to_string(),
            });
        }
        Ok(Self { raw })
    }

    /// Parse a key produced by the fingerprint computer, checking every component.
    pub fn parse(raw: &str) -> Result<Self, FingerprintError> {
        let mut parts = raw.splitn(3, KEY_SEPARATOR);
        let (Some(engine), Some(kind), Some(request)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FingerprintError::Malformed {
                reason: format!("expected <engine>:<kind>:<request>, got {raw:?}"),
            });
        };
        if !is_full_hash_hex(engine) {
            return Err(FingerprintError::Malformed {
                reason: "engine fingerprint is not a full SHA-256 hex digest".to_string(),
            });
        }
        validate_kind(kind)?;
        if !is_full_hash_hex(request) {
            return Err(FingerprintError::Malformed {
                reason: "request fingerprint is not a full SHA-256 hex digest".to_string(),
            });
        }
        Ok(Self::from_parts(engine, kind, request))
    }

    /// The full key string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Engine component (everything before the first separator).
    pub fn engine(&self) -> Option<&str> {
        self.components().map(|(engine, _, _)| engine)
    }

    /// Kind tag, or `"opaque"` for keys without three components.
    pub fn kind(&self) -> &str {
        self.components().map(|(_, kind, _)| kind).unwrap_or("opaque")
    }

    /// Request component (everything after the second separator).
    pub fn request(&self) -> Option<&str> {
        self.components().map(|(_, _, request)| request)
    }

    fn components(&self) -> Option<(&str, &str, &str)> {
        let mut parts = self.raw.splitn(3, KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(e), Some(k), Some(r)) if !e.is_empty() && !k.is_empty() && !r.is_empty() => {
                Some((e, k, r))
            }
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for CacheKey {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::opaque(s)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::opaque(value)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.raw
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
