//! Property-Based Tests for Cache Key Fingerprints
//!
//! Property: For any request parameters, reordering object members, adding
//! null members, or reformatting the JSON text SHALL NOT change the key.
//!
//! Property: For any two distinct engine builds, the engine component of the
//! key SHALL differ.

use kiln_core::{CacheKey, Canonicalizer, EngineIdentity, FingerprintComputer};
use proptest::prelude::*;
use serde_json::{Map, Value};

// ============================================================================
// GENERATORS
// ============================================================================

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(Value::from),
        "[a-z0-9 _-]{0,12}".prop_map(Value::String),
    ]
}

/// Parameters shaped like CAD requests: objects of leaves, small arrays, one
/// level of nesting.
fn arb_params() -> impl Strategy<Value = Value> {
    let leaf_map = prop::collection::btree_map("[a-z_]{1,8}", arb_leaf(), 0..6);
    let inner = prop_oneof![
        arb_leaf(),
        prop::collection::vec(arb_leaf(), 0..4).prop_map(Value::Array),
        leaf_map.prop_map(|m| Value::Object(m.into_iter().collect())),
    ];
    prop::collection::btree_map("[a-z_]{1,8}", inner, 0..8)
        .prop_map(|m| Value::Object(m.into_iter().collect()))
}

/// Rebuild every object with members inserted in reverse order and with
/// extra null members.
fn reorder_with_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            out.insert("zz_unused_null".to_string(), Value::Null);
            for (k, v) in map.iter().rev() {
                out.insert(k.clone(), reorder_with_nulls(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(reorder_with_nulls).collect()),
        other => other.clone(),
    }
}

fn arb_code_hash() -> impl Strategy<Value = String> {
    prop_oneof!["[0-9a-f]{40}", "[0-9a-f]{64}"]
}

fn engine(build: &str, code_hash: &str) -> EngineIdentity {
    EngineIdentity::new(build, code_hash, [("python", "3.11")]).unwrap()
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_equivalent_params_share_key(params in arb_params(), hash in arb_code_hash()) {
        let computer = FingerprintComputer::default();
        let e = engine("v7", &hash);

        let original = computer.compute_key("build", &e, &params).unwrap();
        let reordered = computer
            .compute_key("build", &e, &reorder_with_nulls(&params))
            .unwrap();
        prop_assert_eq!(&original, &reordered);

        let pretty = serde_json::to_string_pretty(&params).unwrap();
        let request = Canonicalizer::new().fingerprint_str(&pretty).unwrap();
        prop_assert_eq!(original.request(), Some(request.as_str()));
    }

    #[test]
    fn prop_distinct_builds_never_share_engine_prefix(
        a in arb_code_hash(),
        b in arb_code_hash(),
        params in arb_params(),
    ) {
        prop_assume!(a != b);
        let computer = FingerprintComputer::default();
        let ka = computer.compute_key("export", &engine("v7", &a), &params).unwrap();
        let kb = computer.compute_key("export", &engine("v7", &b), &params).unwrap();
        prop_assert_ne!(ka.engine(), kb.engine());
        prop_assert_eq!(ka.request(), kb.request());
    }

    #[test]
    fn prop_computed_keys_parse_back(params in arb_params(), hash in arb_code_hash()) {
        let key = FingerprintComputer::default()
            .compute_key("profile-snapshot", &engine("v7", &hash), &params)
            .unwrap();
        let parsed = CacheKey::parse(key.as_str()).unwrap();
        prop_assert_eq!(parsed, key);
    }

    #[test]
    fn prop_integer_and_float_forms_match(n in -1_000_000i64..1_000_000) {
        let c = Canonicalizer::new();
        let as_int = c.fingerprint(&serde_json::json!({"n": n})).unwrap();
        let as_float = c.fingerprint(&serde_json::json!({"n": n as f64})).unwrap();
        prop_assert_eq!(as_int, as_float);
    }

    #[test]
    fn prop_abbreviated_hashes_rejected(hash in "[0-9a-f]{1,39}") {
        prop_assert!(EngineIdentity::new("v7", hash, Vec::<(String, String)>::new()).is_err());
    }
}
