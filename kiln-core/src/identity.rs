//! Identity and hashing primitives shared by every KILN crate.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash for deduplication and integrity verification.
pub type ContentHash = [u8; 32];

/// Length of a full SHA-256 digest rendered as lowercase hex.
pub const FULL_HASH_HEX_LEN: usize = 64;

/// Generate a new UUIDv7 token (timestamp-sortable).
///
/// Used for lease tokens, process holder ids, and stream event ids.
pub fn new_token() -> Uuid {
    Uuid::now_v7()
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute SHA-256 of content and render it as 64 lowercase hex characters.
pub fn content_hash_hex(content: &[u8]) -> String {
    hex::encode(compute_content_hash(content))
}

/// Check that a string is a full-length lowercase SHA-256 hex digest.
pub fn is_full_hash_hex(s: &str) -> bool {
    s.len() == FULL_HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_hex_is_full_length() {
        let hex = content_hash_hex(b"part-123");
        assert_eq!(hex.len(), FULL_HASH_HEX_LEN);
        assert!(is_full_hash_hex(&hex));
    }

    #[test]
    fn test_is_full_hash_hex_rejects_abbreviations() {
        assert!(!is_full_hash_hex("a1b2c3d"));
        assert!(!is_full_hash_hex(&"A".repeat(64)));
        assert!(!is_full_hash_hex(&"g".repeat(64)));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(new_token(), new_token());
    }
}
