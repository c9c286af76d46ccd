//! Fuzz test for cache key parsing
//!
//! Any string `CacheKey::parse` accepts must render back to itself and
//! expose three well-formed components.
//!
//! Run with: cargo +nightly fuzz run key_parse_fuzz -- -max_total_time=60

#![no_main]

use kiln_core::{is_full_hash_hex, validate_kind, CacheKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(key) = CacheKey::parse(input) {
        assert_eq!(key.as_str(), input);

        let engine = key.engine().expect("parsed key has an engine");
        let request = key.request().expect("parsed key has a request");
        assert!(is_full_hash_hex(engine));
        assert!(is_full_hash_hex(request));
        assert!(validate_kind(key.kind()).is_ok());
    }
});
