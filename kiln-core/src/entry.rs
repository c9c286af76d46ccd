//! Cache entries and compute results.
//!
//! An entry is immutable once published. Overwriting a key writes a new entry;
//! nothing in this crate mutates an entry in place.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::StoreError;
use crate::identity::{compute_content_hash, ContentHash, Timestamp};
use crate::key::CacheKey;

// ============================================================================
// COMPUTE OUTPUT
// ============================================================================

/// What a compute function hands back: `(payload, size, content checksum)`.
///
/// The checksum is optional. Without a strong checksum the result is stored
/// inline and never deduplicated against other results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeOutput {
    payload: Vec<u8>,
    size: u64,
    checksum: Option<ContentHash>,
}

impl ComputeOutput {
    /// Wrap a payload and compute its SHA-256 checksum.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let checksum = Some(compute_content_hash(&payload));
        Self {
            size: payload.len() as u64,
            payload,
            checksum,
        }
    }

    /// Wrap a payload with no strong identity.
    pub fn without_checksum(payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            size: payload.len() as u64,
            payload,
            checksum: None,
        }
    }

    /// Wrap a payload with a checksum supplied by the producer.
    pub fn with_checksum(payload: impl Into<Vec<u8>>, checksum: ContentHash) -> Self {
        let payload = payload.into();
        Self {
            size: payload.len() as u64,
            payload,
            checksum: Some(checksum),
        }
    }

    /// An empty artifact. This is a value, not an absence.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn checksum(&self) -> Option<&ContentHash> {
        self.checksum.as_ref()
    }

    /// The checksum, only if it matches the payload.
    ///
    /// A producer-supplied checksum that does not verify is not a strong
    /// identity and must not be used to deduplicate.
    pub fn verified_checksum(&self) -> Option<ContentHash> {
        self.checksum
            .filter(|expected| compute_content_hash(&self.payload) == *expected)
    }
}

// ============================================================================
// CACHE ENTRY
// ============================================================================

/// Where an entry's payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PayloadRef {
    /// Payload stored inside the entry record.
    Inline { data: String },
    /// Payload stored once under its content checksum.
    Blob { checksum: String },
}

impl PayloadRef {
    pub fn inline(payload: &[u8]) -> Self {
        PayloadRef::Inline {
            data: STANDARD.encode(payload),
        }
    }

    pub fn blob(checksum: &ContentHash) -> Self {
        PayloadRef::Blob {
            checksum: hex::encode(checksum),
        }
    }
}

/// A published cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload_ref: PayloadRef,
    pub size: u64,
    pub checksum: Option<String>,
    pub created_at: Timestamp,
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// Build the entry record for a compute output.
    ///
    /// Outputs with a verified checksum reference a blob; everything else is
    /// stored inline.
    pub fn for_output(key: CacheKey, output: &ComputeOutput, ttl: Duration) -> Self {
        let checksum = output.verified_checksum();
        let payload_ref = match &checksum {
            Some(sum) => PayloadRef::blob(sum),
            None => PayloadRef::inline(output.payload()),
        };
        Self {
            key,
            payload_ref,
            size: output.size(),
            checksum: checksum.map(hex::encode),
            created_at: Utc::now(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Decode the inline payload, if this entry has one.
    pub fn inline_payload(&self, backend: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match &self.payload_ref {
            PayloadRef::Inline { data } => STANDARD
                .decode(data)
                .map(Some)
                .map_err(|e| self.corrupt(backend, e)),
            PayloadRef::Blob { .. } => Ok(None),
        }
    }

    /// Serialize for the shared store.
    pub fn encode(&self) -> Vec<u8> {
        // Serializing plain owned fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize a stored record.
    pub fn decode(backend: &str, key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            backend: backend.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn corrupt(&self, backend: &str, reason: impl std::fmt::Display) -> StoreError {
        StoreError::Corrupt {
            backend: backend.to_string(),
            key: self.key.to_string(),
            reason: reason.to_string(),
        }
    }
}
