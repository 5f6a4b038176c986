//! Integration tests for `PostgresRepository`.
//!
//! These tests require a running PostgreSQL instance. Use Docker Compose
//! to start one:
//!
//! ```bash
//! docker-compose -f docker-compose.postgres.yml up -d
//! POSTGRES_CONNECTION_STRING="host=localhost port=5432 user=postgres password=postgres dbname=taskgraph" \
//!   cargo test --package taskgraph-postgres -- --ignored
//! docker-compose -f docker-compose.postgres.yml down
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use taskgraph::entity::{Entity, PrimaryKey};
use taskgraph::schema::{PropertySchema, PropertyType, Schema};
use taskgraph_postgres::PostgresRepository;

fn get_connection_string() -> String {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    std::env::var("POSTGRES_CONNECTION_STRING").unwrap_or_else(|_| {
        "host=localhost port=5432 user=postgres password=postgres dbname=taskgraph".to_string()
    })
}

fn fixture_schema() -> Schema {
    let mut properties = BTreeMap::new();
    properties.insert("id".to_string(), PropertySchema::new(PropertyType::String));
    properties.insert("category".to_string(), PropertySchema::new(PropertyType::String));
    properties.insert("subcategory".to_string(), PropertySchema::new(PropertyType::String));
    properties.insert("value".to_string(), PropertySchema::new(PropertyType::Number));
    Schema::new(properties, ["id".to_string()].into()).unwrap()
}

fn entity(id: &str, category: &str, subcategory: &str, value: f64) -> Entity {
    let mut e = Entity::new();
    e.insert("id".to_string(), id.into());
    e.insert("category".to_string(), category.into());
    e.insert("subcategory".to_string(), subcategory.into());
    e.insert("value".to_string(), serde_json::json!(value));
    e
}

/// Property 1: put/get round-trip.
#[tokio::test]
#[ignore = "requires running PostgreSQL (run with --ignored)"]
async fn put_then_get_round_trips() {
    use taskgraph::Repository;
    let repo = PostgresRepository::connect(
        &get_connection_string(),
        "taskgraph_it_roundtrip",
        fixture_schema(),
        vec!["id".to_string()],
        vec![],
    )
    .await
    .expect("connect");
    repo.delete_all().await.unwrap();

    repo.put(entity("1", "e", "p", 100.0)).await.unwrap();
    let pk: PrimaryKey = [("id".to_string(), "1".into())].into();
    let got = repo.get(&pk).await.unwrap().unwrap();
    assert_eq!(got.get("category").unwrap(), "e");
    assert_eq!(got.get("value").unwrap(), &serde_json::json!(100.0));
}

/// Scenario E5: partial-key search with a compound index, order-independent.
#[tokio::test]
#[ignore = "requires running PostgreSQL (run with --ignored)"]
async fn partial_key_search_with_compound_index() {
    use taskgraph::Repository;
    let repo = PostgresRepository::connect(
        &get_connection_string(),
        "taskgraph_it_search",
        fixture_schema(),
        vec!["id".to_string()],
        vec![
            vec!["category".to_string()],
            vec!["category".to_string(), "subcategory".to_string()],
            vec!["value".to_string()],
        ],
    )
    .await
    .expect("connect");
    repo.delete_all().await.unwrap();

    repo.put(entity("1", "e", "p", 100.0)).await.unwrap();
    repo.put(entity("2", "e", "l", 200.0)).await.unwrap();
    repo.put(entity("3", "b", "f", 300.0)).await.unwrap();

    let mut partial = Entity::new();
    partial.insert("category".to_string(), "e".into());
    partial.insert("subcategory".to_string(), "p".into());
    let found = repo.search(&partial).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("id").unwrap(), "1");

    let mut reordered = Entity::new();
    reordered.insert("subcategory".to_string(), "p".into());
    reordered.insert("category".to_string(), "e".into());
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
#[ignore = "requires running PostgreSQL (run with --ignored)"]
async fn put_upserts_on_conflicting_primary_key() {
    use taskgraph::Repository;
    let repo = PostgresRepository::connect(
        &get_connection_string(),
        "taskgraph_it_upsert",
        fixture_schema(),
        vec!["id".to_string()],
        vec![],
    )
    .await
    .expect("connect");
    repo.delete_all().await.unwrap();

    repo.put(entity("1", "a", "x", 1.0)).await.unwrap();
    repo.put(entity("1", "b", "y", 2.0)).await.unwrap();
    assert_eq!(repo.size().await.unwrap(), 1);
    let pk: PrimaryKey = [("id".to_string(), "1".into())].into();
    let got = repo.get(&pk).await.unwrap().unwrap();
    assert_eq!(got.get("category").unwrap(), "b");
}
