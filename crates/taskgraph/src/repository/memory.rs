// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! In-memory repository backend: a `DashMap` keyed by the fingerprint of
//! the primary key. The simplest backend and the reference implementation
//! every other backend's tests are compared against (spec §4.2, "memory"
//! variant).

use super::{
    delete_search_by_scan, filter_by_partial, require_matching_index, validate_entity,
    ComparisonOp, Repository, RepositoryEvent,
};
use crate::entity::{fingerprint_primary_key, project, Entity, PrimaryKey};
use crate::error::Result;
use crate::events::EventEmitter;
use crate::index::{normalize_indexes, Index};
use crate::schema::Schema;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as Json;

/// In-memory [`Repository`] implementation.
pub struct MemoryRepository {
    schema: Schema,
    primary_key_names: Vec<String>,
    indexes: Vec<Index>,
    rows: DashMap<String, Entity>,
    events: EventEmitter<RepositoryEvent>,
}

impl MemoryRepository {
    /// Construct a new, empty in-memory repository.
    pub fn new(schema: Schema, primary_key_names: Vec<String>, declared_indexes: Vec<Index>) -> Self {
        let indexes = normalize_indexes(&primary_key_names, &declared_indexes);
        Self {
            schema,
            primary_key_names,
            indexes,
            rows: DashMap::new(),
            events: EventEmitter::new(),
        }
    }

    fn all_rows(&self) -> Vec<Entity> {
        self.rows.iter().map(|kv| kv.value().clone()).collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn primary_key_names(&self) -> &[String] {
        &self.primary_key_names
    }

    fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    fn events(&self) -> &EventEmitter<RepositoryEvent> {
        &self.events
    }

    async fn put(&self, entity: Entity) -> Result<Entity> {
        validate_entity(&self.schema, &entity)?;
        let defaults = self.schema.defaults_of();
        let mut full = Entity::new();
        for (k, v) in defaults {
            full.insert(k, v);
        }
        for (k, v) in entity {
            full.insert(k, v);
        }
        let (pk, _) = project(&full, &self.primary_key_names);
        let key = fingerprint_primary_key(&pk);
        self.rows.insert(key, full.clone());
        self.events.emit(RepositoryEvent::Put(full.clone()));
        Ok(full)
    }

    async fn get(&self, primary_key: &PrimaryKey) -> Result<Option<Entity>> {
        let key = fingerprint_primary_key(primary_key);
        let found = self.rows.get(&key).map(|kv| kv.value().clone());
        self.events.emit(RepositoryEvent::Get(found.clone()));
        Ok(found)
    }

    async fn delete(&self, primary_key: &PrimaryKey) -> Result<()> {
        let key = fingerprint_primary_key(primary_key);
        self.rows.remove(&key);
        self.events.emit(RepositoryEvent::Delete(primary_key.clone()));
        Ok(())
    }

    async fn delete_search(&self, column: &str, value: &Json, op: ComparisonOp) -> Result<u64> {
        delete_search_by_scan(self, self.all_rows(), column, value, op).await
    }

    async fn get_all(&self) -> Result<Option<Vec<Entity>>> {
        if self.rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.all_rows()))
        }
    }

    async fn delete_all(&self) -> Result<()> {
        self.rows.clear();
        self.events.emit(RepositoryEvent::ClearAll);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.rows.len())
    }

    async fn search(&self, partial: &Entity) -> Result<Vec<Entity>> {
        require_matching_index(&self.primary_key_names, &self.indexes, partial)?;
        let matched = filter_by_partial(&self.all_rows(), partial);
        self.events.emit(RepositoryEvent::Search(matched.clone()));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropertySchema, PropertyType, Schema};

    fn fixture_schema() -> Schema {
        let mut properties = std::collections::BTreeMap::new();
        properties.insert("id".to_string(), PropertySchema::new(PropertyType::String));
        properties.insert("category".to_string(), PropertySchema::new(PropertyType::String));
        properties.insert("value".to_string(), PropertySchema::new(PropertyType::Number));
        Schema::new(properties, ["id".to_string()].into()).unwrap()
    }

    fn entity(id: &str, category: &str, value: f64) -> Entity {
        let mut e = Entity::new();
        e.insert("id".to_string(), Json::String(id.to_string()));
        e.insert("category".to_string(), Json::String(category.to_string()));
        e.insert("value".to_string(), serde_json::json!(value));
        e
    }

    fn fixture_schema_with_subcategory() -> Schema {
        let mut properties = std::collections::BTreeMap::new();
        properties.insert("id".to_string(), PropertySchema::new(PropertyType::String));
        properties.insert("category".to_string(), PropertySchema::new(PropertyType::String));
        properties.insert("subcategory".to_string(), PropertySchema::new(PropertyType::String));
        properties.insert("value".to_string(), PropertySchema::new(PropertyType::Number));
        Schema::new(properties, ["id".to_string()].into()).unwrap()
    }

    fn entity_with_subcategory(id: &str, category: &str, subcategory: &str, value: f64) -> Entity {
        let mut e = entity(id, category, value);
        e.insert("subcategory".to_string(), Json::String(subcategory.to_string()));
        e
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let repo = MemoryRepository::new(fixture_schema(), vec!["id".to_string()], vec![]);
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        let pk: PrimaryKey = [("id".to_string(), Json::String("1".to_string()))].into();
        let got = repo.get(&pk).await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().get("category").unwrap(), "a");
    }

    #[tokio::test]
    async fn search_requires_declared_index() {
        let repo = MemoryRepository::new(fixture_schema(), vec!["id".to_string()], vec![]);
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        let mut partial = Entity::new();
        partial.insert("category".to_string(), Json::String("a".to_string()));
        assert!(repo.search(&partial).await.is_err());
    }

    #[tokio::test]
    async fn search_by_declared_index_finds_matches() {
        let repo = MemoryRepository::new(
            fixture_schema(),
            vec!["id".to_string()],
            vec![vec!["category".to_string()]],
        );
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        repo.put(entity("2", "b", 2.0)).await.unwrap();
        let mut partial = Entity::new();
        partial.insert("category".to_string(), Json::String("a".to_string()));
        let found = repo.search(&partial).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn delete_search_removes_matching_rows() {
        let repo = MemoryRepository::new(
            fixture_schema(),
            vec!["id".to_string()],
            vec![vec!["value".to_string()]],
        );
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        repo.put(entity("2", "a", 5.0)).await.unwrap();
        let deleted = repo
            .delete_search("value", &serde_json::json!(3.0), ComparisonOp::Gt)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.size().await.unwrap(), 1);
    }

    /// Scenario E5: partial-key search with a compound index, exercised
    /// against the in-memory backend directly.
    #[tokio::test]
    async fn partial_key_search_with_compound_index_is_order_independent() {
        let repo = MemoryRepository::new(
            fixture_schema_with_subcategory(),
            vec!["id".to_string()],
            vec![
                vec!["category".to_string()],
                vec!["category".to_string(), "subcategory".to_string()],
                vec!["value".to_string()],
            ],
        );
        repo.put(entity_with_subcategory("1", "e", "p", 100.0)).await.unwrap();
        repo.put(entity_with_subcategory("2", "e", "l", 200.0)).await.unwrap();
        repo.put(entity_with_subcategory("3", "b", "f", 300.0)).await.unwrap();

        let mut partial = Entity::new();
        partial.insert("category".to_string(), Json::String("e".to_string()));
        partial.insert("subcategory".to_string(), Json::String("p".to_string()));
        let found = repo.search(&partial).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("id").unwrap(), "1");

        let mut reordered = Entity::new();
        reordered.insert("subcategory".to_string(), Json::String("p".to_string()));
        reordered.insert("category".to_string(), Json::String("e".to_string()));
        let found_reordered = repo.search(&reordered).await.unwrap();
        assert_eq!(found_reordered.len(), 1);
        assert_eq!(found_reordered[0].get("id").unwrap(), "1");

        let mut by_value = Entity::new();
        by_value.insert("value".to_string(), serde_json::json!(300.0));
        let found_by_value = repo.search(&by_value).await.unwrap();
        assert_eq!(found_by_value.len(), 1);
        assert_eq!(found_by_value[0].get("id").unwrap(), "3");
    }

    #[tokio::test]
    async fn get_all_is_none_when_empty() {
        let repo = MemoryRepository::new(fixture_schema(), vec!["id".to_string()], vec![]);
        assert!(repo.get_all().await.unwrap().is_none());
    }
}
