// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical JSON serialisation and template hashing.
//!
//! Canonical form: object keys sorted recursively, UTF-8, no insignificant
//! whitespace. Two semantically-equal documents canonicalise to bytewise-equal
//! strings, which makes the SHA-256 of the canonical form a stable identity
//! for a workflow template.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialise a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// `sha256:<hex>` of the canonical serialisation.
pub fn template_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => {
            // serde_json renders scalars without whitespace already.
            out.push_str(&value.to_string());
        }
        Value::String(s) => {
            out.push_str(&Value::String(s.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": [3, {"y": 4, "x": 5}]});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":[3,{"x":5,"y":4}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let v: Value = serde_json::from_str("{ \"a\" : [ 1 , 2 ] }").unwrap();
        assert_eq!(canonical_json(&v), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn key_order_does_not_change_hash() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":{"p":true,"q":null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":{"q":null,"p":true},"x":1}"#).unwrap();
        assert_eq!(template_hash(&a), template_hash(&b));
    }

    #[test]
    fn different_documents_hash_differently() {
        let a = json!({"3": {"inputs": {"seed": 1}}});
        let b = json!({"3": {"inputs": {"seed": 2}}});
        assert_ne!(template_hash(&a), template_hash(&b));
    }

    #[test]
    fn hash_carries_prefix() {
        assert!(template_hash(&json!({})).starts_with("sha256:"));
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(depth, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_is_total_and_reparses(v in arb_json(3)) {
            let canon = canonical_json(&v);
            let back: Value = serde_json::from_str(&canon).unwrap();
            prop_assert_eq!(&back, &v);
        }

        #[test]
        fn canonical_is_idempotent(v in arb_json(3)) {
            let once = canonical_json(&v);
            let reparsed: Value = serde_json::from_str(&once).unwrap();
            prop_assert_eq!(canonical_json(&reparsed), once);
        }
    }
}
