// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Output Cache (F): content-addressed memoization of task outputs,
//! specialized from the Tabular Repository contract with primary key
//! `fingerprint` (spec §4.6).

use crate::entity::{canonical_json_string, sha256_hex, Entity, PrimaryKey};
use crate::error::Result;
use crate::provenance::Provenance;
use crate::repository::Repository;
use crate::schema::{PropertySchema, PropertyType, Schema};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The schema every output-cache-backing repository must be constructed
/// with: `{fingerprint, taskType, output, provenance, storedAt}`, primary
/// key `fingerprint`.
pub fn cache_schema() -> Schema {
    let mut properties = BTreeMap::new();
    properties.insert(
        "fingerprint".to_string(),
        PropertySchema::new(PropertyType::String),
    );
    properties.insert("taskType".to_string(), PropertySchema::new(PropertyType::String));
    properties.insert("output".to_string(), PropertySchema::new(PropertyType::Object));
    properties.insert(
        "provenance".to_string(),
        PropertySchema::new(PropertyType::Object),
    );
    properties.insert(
        "storedAt".to_string(),
        PropertySchema::new(PropertyType::String).with_format(crate::schema::Format::DateTime),
    );
    Schema::new(
        properties,
        [
            "fingerprint".to_string(),
            "taskType".to_string(),
            "output".to_string(),
        ]
        .into(),
    )
    .expect("cache schema is internally consistent")
}

/// Primary-key columns for a cache-backing repository.
pub fn cache_primary_key_names() -> Vec<String> {
    vec!["fingerprint".to_string()]
}

/// Compute the fingerprint `sha256(canonicalJSON(taskType, inputs,
/// provenance))` (spec §4.4 step 2, §4.6).
pub fn fingerprint(task_type: &str, inputs: &Entity, provenance: &Provenance) -> String {
    let composite = serde_json::json!({
        "taskType": task_type,
        "inputs": Json::Object(inputs.clone()),
        "provenance": provenance,
    });
    sha256_hex(canonical_json_string(&composite))
}

/// A specialization of [`Repository`] storing `(fingerprint, output,
/// provenance)` triples.
pub struct OutputCache {
    repository: Arc<dyn Repository>,
}

impl OutputCache {
    /// Wrap a repository already constructed with [`cache_schema`] and
    /// [`cache_primary_key_names`].
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        OutputCache { repository }
    }

    /// Look up a cached output by fingerprint.
    pub async fn lookup(&self, fingerprint: &str) -> Result<Option<Entity>> {
        let pk: PrimaryKey = [("fingerprint".to_string(), Json::String(fingerprint.to_string()))]
            .into_iter()
            .collect();
        let row = self.repository.get(&pk).await?;
        Ok(row.and_then(|entity| entity.get("output").and_then(Json::as_object).cloned()))
    }

    /// Store `output` for `fingerprint`, alongside the task's type and
    /// provenance. Concurrent stores of the same fingerprint: last writer
    /// wins (spec §5 "Shared-resource policy" — the stored outputs must
    /// be deterministically equal, so this is safe).
    pub async fn store(
        &self,
        fingerprint: &str,
        task_type: &str,
        output: &Entity,
        provenance: &Provenance,
    ) -> Result<()> {
        let mut row = Entity::new();
        row.insert("fingerprint".to_string(), Json::String(fingerprint.to_string()));
        row.insert("taskType".to_string(), Json::String(task_type.to_string()));
        row.insert("output".to_string(), Json::Object(output.clone()));
        row.insert(
            "provenance".to_string(),
            serde_json::to_value(provenance).expect("provenance is JSON-serializable"),
        );
        row.insert(
            "storedAt".to_string(),
            Json::String(chrono::Utc::now().to_rfc3339()),
        );
        self.repository.put(row).await?;
        Ok(())
    }

    /// Remove a single cache entry.
    pub async fn invalidate(&self, fingerprint: &str) -> Result<()> {
        let pk: PrimaryKey = [("fingerprint".to_string(), Json::String(fingerprint.to_string()))]
            .into_iter()
            .collect();
        self.repository.delete(&pk).await
    }

    /// Evict every cache entry matching `predicate`. Supplements the
    /// spec's `evict(predicate)` with a concrete implementation: a full
    /// scan, since predicates are arbitrary closures rather than
    /// column/operator pairs the repository's `deleteSearch` can express
    /// (SPEC_FULL.md §10.7).
    pub async fn evict(&self, predicate: impl Fn(&Entity) -> bool) -> Result<u64> {
        let Some(all) = self.repository.get_all().await? else {
            return Ok(0);
        };
        let mut evicted = 0u64;
        for row in all {
            if predicate(&row) {
                let fp = row
                    .get("fingerprint")
                    .and_then(Json::as_str)
                    .unwrap_or_default();
                self.invalidate(fp).await?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn make_cache() -> OutputCache {
        let repo = MemoryRepository::new(cache_schema(), cache_primary_key_names(), vec![]);
        OutputCache::new(Arc::new(repo))
    }

    fn sample_input() -> Entity {
        let mut e = Entity::new();
        e.insert("input".to_string(), serde_json::json!(5));
        e
    }

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let mut a = Entity::new();
        a.insert("x".to_string(), serde_json::json!(1));
        a.insert("y".to_string(), serde_json::json!(2));
        let mut b = Entity::new();
        b.insert("y".to_string(), serde_json::json!(2));
        b.insert("x".to_string(), serde_json::json!(1));
        let prov = Provenance::new();
        assert_eq!(
            fingerprint("TestSquare", &a, &prov),
            fingerprint("TestSquare", &b, &prov)
        );
    }

    #[tokio::test]
    async fn store_then_lookup_round_trips() {
        let cache = make_cache();
        let fp = fingerprint("TestSquare", &sample_input(), &Provenance::new());
        let mut output = Entity::new();
        output.insert("output".to_string(), serde_json::json!(25));
        cache
            .store(&fp, "TestSquare", &output, &Provenance::new())
            .await
            .unwrap();
        let got = cache.lookup(&fp).await.unwrap();
        assert_eq!(got, Some(output));
    }

    #[tokio::test]
    async fn lookup_miss_returns_none() {
        let cache = make_cache();
        assert_eq!(cache.lookup("nonexistent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = make_cache();
        let fp = fingerprint("TestSquare", &sample_input(), &Provenance::new());
        cache
            .store(&fp, "TestSquare", &Entity::new(), &Provenance::new())
            .await
            .unwrap();
        cache.invalidate(&fp).await.unwrap();
        assert_eq!(cache.lookup(&fp).await.unwrap(), None);
    }

    #[tokio::test]
    async fn evict_removes_matching_entries() {
        let cache = make_cache();
        let fp1 = fingerprint("TestSquare", &sample_input(), &Provenance::new());
        cache
            .store(&fp1, "TestSquare", &Entity::new(), &Provenance::new())
            .await
            .unwrap();
        let mut other_input = Entity::new();
        other_input.insert("input".to_string(), serde_json::json!(6));
        let fp2 = fingerprint("TestDouble", &other_input, &Provenance::new());
        cache
            .store(&fp2, "TestDouble", &Entity::new(), &Provenance::new())
            .await
            .unwrap();
        let evicted = cache
            .evict(|row| row.get("taskType").and_then(Json::as_str) == Some("TestSquare"))
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        assert_eq!(cache.lookup(&fp1).await.unwrap(), None);
        assert!(cache.lookup(&fp2).await.unwrap().is_some());
    }
}
