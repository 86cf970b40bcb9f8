// landscape-tests/tests/canonicalization.rs
// ============================================================================
// Module: Canonicalization Suite
// Description: Golden-hash and key-order independence checks for
//              `stable_hash`.
// Purpose: Pin the canonical hash of a known value so a future change to
//          the JCS canonicalizer is caught immediately.
// Dependencies: landscape-core
// ============================================================================

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

use landscape_core::stable_hash;
use serde_json::json;

#[test]
fn golden_canonical_hash_matches_sha256_of_sorted_compact_json() {
    let value = json!({"b": 2, "a": 1, "list": [3, 1, 2]});
    let hash = stable_hash(&value).expect("canonicalize");

    // sha256('{"a":1,"b":2,"list":[3,1,2]}') in hex.
    assert_eq!(
        hash,
        "e6106728ec59bafb0be951071a60ddb7f61c4ed3af3a3890e03b012e6cc8ba5a"
    );
}

#[test]
fn hash_is_independent_of_source_key_order() {
    let forward = json!({"a": 1, "b": 2});
    let reversed = json!({"b": 2, "a": 1});
    assert_eq!(
        stable_hash(&forward).expect("canonicalize"),
        stable_hash(&reversed).expect("canonicalize")
    );
}

#[test]
fn hash_is_deterministic_across_repeated_calls() {
    let value = json!({"b": 2, "a": 1, "list": [3, 1, 2]});
    let first = stable_hash(&value).expect("canonicalize");
    let second = stable_hash(&value).expect("canonicalize");
    assert_eq!(first, second);
}

#[test]
fn nan_and_infinite_floats_are_rejected_at_any_nesting_depth() {
    assert!(stable_hash(&json!(f64::NAN)).is_err());
    assert!(stable_hash(&json!([1, f64::INFINITY])).is_err());
    assert!(stable_hash(&json!({"x": {"y": f64::NEG_INFINITY}})).is_err());
}
