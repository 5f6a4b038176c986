// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Entities, primary keys, values, and canonical-JSON fingerprinting.
//!
//! An [`Entity`] is a JSON object conforming to a [`crate::schema::Schema`].
//! Its [`PrimaryKey`] is the projection onto primary-key columns; its
//! [`Value`] is the complement (spec §3.1). Both projections use
//! `BTreeMap` so that property order is always canonical, which matters
//! both for the filesystem backend's per-entity filename (a fingerprint of
//! the primary key) and for the output cache's fingerprint of
//! `(task type, inputs, provenance)` (spec §4.6).

use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A full record: a JSON object conforming to a schema's full property set.
pub type Entity = serde_json::Map<String, Json>;

/// The projection of an entity onto its primary-key columns, in declared
/// (sorted) order. Primary-key fields are never null (spec §3.1).
pub type PrimaryKey = BTreeMap<String, Json>;

/// The projection of an entity onto its non-primary-key (value) columns.
pub type Value = BTreeMap<String, Json>;

/// Split a full entity into its primary-key and value projections.
pub fn project(entity: &Entity, primary_key_names: &[String]) -> (PrimaryKey, Value) {
    let pk_set: std::collections::BTreeSet<&str> =
        primary_key_names.iter().map(String::as_str).collect();
    let mut pk = PrimaryKey::new();
    let mut value = Value::new();
    for (name, v) in entity {
        if pk_set.contains(name.as_str()) {
            pk.insert(name.clone(), v.clone());
        } else {
            value.insert(name.clone(), v.clone());
        }
    }
    (pk, value)
}

/// Recursively rewrite a JSON value so that every object's keys are in
/// lexicographic order and every number is rendered through `serde_json`'s
/// canonical formatting (spec §4.6: "canonical-JSON orders object keys
/// lexicographically and normalizes numeric formatting").
pub fn canonicalize(value: &Json) -> Json {
    match value {
        Json::Object(map) => {
            let sorted: BTreeMap<String, Json> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Render a value as canonical JSON text, suitable for hashing.
pub fn canonical_json_string(value: &Json) -> String {
    // serde_json's Value serialization already uses a stable
    // number-formatting scheme; the only remaining non-determinism is
    // object key order, which `canonicalize` fixes before we serialize.
    serde_json::to_string(&canonicalize(value))
        .expect("canonicalized JSON values always serialize")
}

/// SHA-256 of `bytes`, hex-encoded lowercase.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Fingerprint a primary key for use as a filesystem-backend filename
/// stem (spec §6.3: `<folder>/<fingerprint(primaryKey)>.json`).
pub fn fingerprint_primary_key(pk: &PrimaryKey) -> String {
    let json = Json::Object(pk.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    sha256_hex(canonical_json_string(&json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_sorts_nested_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": 1, "y": 2}});
        let canonical = canonical_json_string(&value);
        assert_eq!(canonical, r#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a: PrimaryKey = [("id".to_string(), serde_json::json!("1"))]
            .into_iter()
            .collect();
        let mut entity = Entity::new();
        entity.insert("id".to_string(), serde_json::json!("1"));
        entity.insert("category".to_string(), serde_json::json!("e"));
        let (pk, _value) = project(&entity, &["id".to_string()]);
        assert_eq!(pk, a);
        assert_eq!(
            fingerprint_primary_key(&pk),
            fingerprint_primary_key(&a)
        );
    }

    #[test]
    fn project_splits_primary_key_from_value() {
        let mut entity = Entity::new();
        entity.insert("id".to_string(), serde_json::json!("1"));
        entity.insert("name".to_string(), serde_json::json!("x"));
        let (pk, value) = project(&entity, &["id".to_string()]);
        assert_eq!(pk.len(), 1);
        assert_eq!(value.len(), 1);
        assert!(value.contains_key("name"));
    }

    proptest::proptest! {
        #[test]
        fn canonicalize_is_insensitive_to_insertion_order(
            a in 0i64..1000, b in 0i64..1000, c in 0i64..1000,
        ) {
            let mut forward = serde_json::Map::new();
            forward.insert("a".to_string(), serde_json::json!(a));
            forward.insert("b".to_string(), serde_json::json!(b));
            forward.insert("c".to_string(), serde_json::json!(c));

            let mut backward = serde_json::Map::new();
            backward.insert("c".to_string(), serde_json::json!(c));
            backward.insert("b".to_string(), serde_json::json!(b));
            backward.insert("a".to_string(), serde_json::json!(a));

            prop_assert_eq!(
                canonical_json_string(&Json::Object(forward)),
                canonical_json_string(&Json::Object(backward)),
            );
        }

        #[test]
        fn fingerprint_primary_key_is_deterministic(id in "[a-z0-9]{1,12}") {
            let pk: PrimaryKey = [("id".to_string(), serde_json::json!(id))]
                .into_iter()
                .collect();
            prop_assert_eq!(fingerprint_primary_key(&pk), fingerprint_primary_key(&pk));
        }
    }
}
