//! Fuzz test for request canonicalization
//!
//! Feeds arbitrary text to the canonicalizer to find:
//! - Panics on odd numbers, escapes, or nesting
//! - Non-deterministic fingerprints
//! - Fingerprints that are not full-length digests
//!
//! Run with: cargo +nightly fuzz run fingerprint_fuzz -- -max_total_time=60

#![no_main]

use kiln_core::{is_full_hash_hex, Canonicalizer, FingerprintError};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let canonicalizer = Canonicalizer::new().ignore_field("request_id");

    match canonicalizer.fingerprint_str(input) {
        Ok(fingerprint) => {
            assert!(is_full_hash_hex(&fingerprint), "fingerprint must be a full digest");

            // Same input, same fingerprint, including after a serde round trip
            let value: serde_json::Value = serde_json::from_str(input).unwrap();
            assert_eq!(canonicalizer.fingerprint(&value).unwrap(), fingerprint);
            let pretty = serde_json::to_string_pretty(&value).unwrap();
            assert_eq!(canonicalizer.fingerprint_str(&pretty).unwrap(), fingerprint);
        }
        Err(FingerprintError::Malformed { .. }) | Err(FingerprintError::TooDeep { .. }) => {}
        Err(other) => panic!("unexpected canonicalization error: {other}"),
    }
});
