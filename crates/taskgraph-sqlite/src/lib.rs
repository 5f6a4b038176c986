// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Embedded SQL tabular repository backend, backed by `rusqlite`.
//!
//! Same shape as the sibling `taskgraph-postgres` backend (table creation
//! up front, parameterized SQL, identifier validation) but targets an
//! embedded, file-or-memory SQLite database rather than a remote server.
//! Every declared property becomes a real typed column
//! (not a JSON blob), so `search`/`deleteSearch` run as native `WHERE`
//! clauses instead of an in-process scan.
//!
//! `rusqlite::Connection` is `Send` but not `Sync`: every operation takes
//! the connection's lock and does its work inside `tokio::task::spawn_blocking`,
//! so the async runtime's worker threads are never blocked on SQLite I/O.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value as Json;
use std::path::Path;
use std::sync::Arc;
use taskgraph::entity::{Entity, PrimaryKey};
use taskgraph::error::{Error, Result};
use taskgraph::events::EventEmitter;
use taskgraph::index::{normalize_indexes, Index};
use taskgraph::repository::{
    delete_search_by_scan, filter_by_partial, require_matching_index, validate_entity,
    ComparisonOp, Repository, RepositoryEvent,
};
use taskgraph::schema::{validate_identifier, PropertySchema, PropertyType, Schema};
use tracing::debug;

const TABLE: &str = "entities";

fn sql_type_for(prop: &PropertySchema) -> &'static str {
    if prop.is_blob {
        return "BLOB";
    }
    match prop.type_ {
        PropertyType::Integer => "INTEGER",
        PropertyType::Number => "REAL",
        PropertyType::Boolean => "INTEGER",
        PropertyType::String => "TEXT",
        PropertyType::Object | PropertyType::Array => "TEXT",
    }
}

fn json_to_sql_value(value: &Json, prop: &PropertySchema, column: &str) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    if prop.is_blob {
        let Json::String(text) = value else {
            return Err(Error::workflow(format!(
                "column '{column}' is a blob but value is not a base64 string"
            )));
        };
        let bytes = BASE64
            .decode(text)
            .map_err(|e| Error::workflow(format!("column '{column}' is not valid base64: {e}")))?;
        return Ok(SqlValue::Blob(bytes));
    }
    Ok(match prop.type_ {
        PropertyType::Integer => {
            let n = value.as_i64().ok_or_else(|| {
                Error::workflow(format!("column '{column}' expected an integer, got {value}"))
            })?;
            SqlValue::Integer(n)
        }
        PropertyType::Number => {
            let n = value.as_f64().ok_or_else(|| {
                Error::workflow(format!("column '{column}' expected a number, got {value}"))
            })?;
            SqlValue::Real(n)
        }
        PropertyType::Boolean => {
            let b = value.as_bool().ok_or_else(|| {
                Error::workflow(format!("column '{column}' expected a boolean, got {value}"))
            })?;
            SqlValue::Integer(i64::from(b))
        }
        PropertyType::String => {
            let s = value.as_str().ok_or_else(|| {
                Error::workflow(format!("column '{column}' expected a string, got {value}"))
            })?;
            SqlValue::Text(s.to_string())
        }
        PropertyType::Object | PropertyType::Array => SqlValue::Text(value.to_string()),
    })
}

fn sql_value_to_json(value: SqlValue, prop: &PropertySchema, column: &str) -> Result<Json> {
    if prop.is_blob {
        return Ok(match value {
            SqlValue::Null => Json::Null,
            SqlValue::Blob(bytes) => Json::String(BASE64.encode(bytes)),
            other => {
                return Err(Error::repository(format!(
                    "column '{column}' is a blob but stored value was {other:?}"
                )))
            }
        });
    }
    Ok(match (value, prop.type_) {
        (SqlValue::Null, _) => Json::Null,
        (SqlValue::Integer(i), PropertyType::Boolean) => Json::Bool(i != 0),
        (SqlValue::Integer(i), _) => Json::Number(i.into()),
        (SqlValue::Real(f), _) => serde_json::Number::from_f64(f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        (SqlValue::Text(s), PropertyType::Object | PropertyType::Array) => {
            serde_json::from_str(&s).map_err(|e| {
                Error::repository(format!("column '{column}' is not valid JSON: {e}"))
            })?
        }
        (SqlValue::Text(s), _) => Json::String(s),
        (SqlValue::Blob(_), _) => {
            return Err(Error::repository(format!(
                "column '{column}' unexpectedly stored as a blob"
            )))
        }
    })
}

fn op_sql(op: ComparisonOp) -> &'static str {
    match op {
        ComparisonOp::Eq => "=",
        ComparisonOp::Lt => "<",
        ComparisonOp::Le => "<=",
        ComparisonOp::Gt => ">",
        ComparisonOp::Ge => ">=",
    }
}

/// `rusqlite`-backed [`Repository`] implementation. Each instance owns one
/// SQLite connection (file-backed or `:memory:`) and one table, `entities`,
/// whose columns mirror the schema's declared properties.
pub struct SqliteRepository {
    schema: Schema,
    primary_key_names: Vec<String>,
    indexes: Vec<Index>,
    columns: Vec<String>,
    /// `column_props[i]` is the type descriptor for `columns[i]`, cached so
    /// blocking-task closures can move an owned `Vec<PropertySchema>` rather
    /// than clone the whole [`Schema`] (whose compiled validator is not
    /// guaranteed cheap to duplicate).
    column_props: Vec<PropertySchema>,
    conn: Arc<Mutex<Connection>>,
    events: EventEmitter<RepositoryEvent>,
}

impl SqliteRepository {
    /// Open (creating if absent) a file-backed repository at `path`,
    /// issuing `CREATE TABLE IF NOT EXISTS`/`CREATE INDEX IF NOT EXISTS`
    /// DDL derived from `schema` and `declared_indexes`.
    pub fn open(
        schema: Schema,
        primary_key_names: Vec<String>,
        declared_indexes: Vec<Index>,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::repository(format!("opening sqlite database: {e}")))?;
        Self::from_connection(schema, primary_key_names, declared_indexes, conn)
    }

    /// Open an in-memory repository (per-process, lost on drop); used in
    /// tests and for single-run scratch storage.
    pub fn open_in_memory(
        schema: Schema,
        primary_key_names: Vec<String>,
        declared_indexes: Vec<Index>,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::repository(format!("opening in-memory sqlite database: {e}")))?;
        Self::from_connection(schema, primary_key_names, declared_indexes, conn)
    }

    fn from_connection(
        schema: Schema,
        primary_key_names: Vec<String>,
        declared_indexes: Vec<Index>,
        conn: Connection,
    ) -> Result<Self> {
        for name in &primary_key_names {
            validate_identifier(name)?;
        }
        let indexes = normalize_indexes(&primary_key_names, &declared_indexes);
        let columns: Vec<String> = schema.properties.keys().cloned().collect();
        let column_props: Vec<PropertySchema> = columns
            .iter()
            .map(|c| schema.properties[c].clone())
            .collect();

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::repository(format!("configuring sqlite connection: {e}")))?;
        conn.execute_batch(&create_table_ddl(&schema, &primary_key_names))
            .map_err(|e| Error::repository(format!("creating entities table: {e}")))?;
        for ddl in index_ddls(&indexes) {
            conn.execute_batch(&ddl)
                .map_err(|e| Error::repository(format!("creating index: {e}")))?;
        }
        debug!(columns = columns.len(), indexes = indexes.len(), "sqlite repository schema ready");

        Ok(Self {
            schema,
            primary_key_names,
            indexes,
            columns,
            column_props,
            conn: Arc::new(Mutex::new(conn)),
            events: EventEmitter::new(),
        })
    }

    fn full_entity_with_defaults(&self, entity: Entity) -> Entity {
        let defaults = self.schema.defaults_of();
        let mut full = Entity::new();
        for (k, v) in defaults {
            full.insert(k, v);
        }
        for (k, v) in entity {
            full.insert(k, v);
        }
        full
    }

    fn row_values(&self, full: &Entity) -> Result<Vec<SqlValue>> {
        self.columns
            .iter()
            .map(|column| {
                let prop = &self.schema.properties[column];
                let value = full.get(column).cloned().unwrap_or(Json::Null);
                json_to_sql_value(&value, prop, column)
            })
            .collect()
    }
}

fn create_table_ddl(schema: &Schema, primary_key_names: &[String]) -> String {
    let mut col_defs = Vec::with_capacity(schema.properties.len());
    for (name, prop) in &schema.properties {
        let ty = sql_type_for(prop);
        let nullable = if prop.is_nullable || !primary_key_names.contains(name) {
            ""
        } else {
            " NOT NULL"
        };
        col_defs.push(format!("  {name} {ty}{nullable}"));
    }
    let pk_list = primary_key_names.join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {TABLE} (\n{},\n  PRIMARY KEY ({pk_list})\n);",
        col_defs.join(",\n")
    )
}

fn index_ddls(indexes: &[Index]) -> Vec<String> {
    indexes
        .iter()
        .map(|idx| {
            let name = format!("idx_{TABLE}_{}", idx.join("_"));
            let cols = idx.join(", ");
            format!("CREATE INDEX IF NOT EXISTS {name} ON {TABLE} ({cols});")
        })
        .collect()
}

#[async_trait]
impl Repository for SqliteRepository {
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
        let full = self.full_entity_with_defaults(entity);
        let values = self.row_values(&full)?;
        let columns = self.columns.clone();
        let conn = Arc::clone(&self.conn);

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !self.primary_key_names.contains(c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let sql = if updates.is_empty() {
            format!(
                "INSERT INTO {TABLE} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
                columns.join(", "),
                placeholders.join(", ")
            )
        } else {
            format!(
                "INSERT INTO {TABLE} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                columns.join(", "),
                placeholders.join(", "),
                self.primary_key_names.join(", "),
                updates.join(", ")
            )
        };

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))
                .map_err(|e| Error::repository(format!("put: {e}")))
        })
        .await
        .map_err(|e| Error::repository(format!("put task panicked: {e}")))??;

        self.events.emit(RepositoryEvent::Put(full.clone()));
        Ok(full)
    }

    async fn put_bulk(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        // Validate and default-fill each entity up front, then commit the
        // whole batch inside a single SQLite transaction.
        let mut fulls = Vec::with_capacity(entities.len());
        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities {
            validate_entity(&self.schema, &entity)?;
            let full = self.full_entity_with_defaults(entity);
            rows.push(self.row_values(&full)?);
            fulls.push(full);
        }

        let columns = self.columns.clone();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !self.primary_key_names.contains(c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let sql = if updates.is_empty() {
            format!(
                "INSERT INTO {TABLE} ({}) VALUES ({}) ON CONFLICT DO NOTHING",
                columns.join(", "),
                placeholders.join(", ")
            )
        } else {
            format!(
                "INSERT INTO {TABLE} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
                columns.join(", "),
                placeholders.join(", "),
                self.primary_key_names.join(", "),
                updates.join(", ")
            )
        };
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            let tx = conn
                .transaction()
                .map_err(|e| Error::repository(format!("put_bulk: starting transaction: {e}")))?;
            for values in &rows {
                tx.execute(&sql, rusqlite::params_from_iter(values.iter()))
                    .map_err(|e| Error::repository(format!("put_bulk: {e}")))?;
            }
            tx.commit()
                .map_err(|e| Error::repository(format!("put_bulk: committing transaction: {e}")))
        })
        .await
        .map_err(|e| Error::repository(format!("put_bulk task panicked: {e}")))??;

        for full in &fulls {
            self.events.emit(RepositoryEvent::Put(full.clone()));
        }
        Ok(fulls)
    }

    async fn get(&self, primary_key: &PrimaryKey) -> Result<Option<Entity>> {
        let columns = self.columns.clone();
        let pk_names = self.primary_key_names.clone();
        let pk_values: Vec<SqlValue> = pk_names
            .iter()
            .map(|name| {
                let prop = &self.schema.properties[name];
                let value = primary_key.get(name).cloned().unwrap_or(Json::Null);
                json_to_sql_value(&value, prop, name)
            })
            .collect::<Result<_>>()?;
        let where_clause = pk_names
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("SELECT {} FROM {TABLE} WHERE {where_clause}", columns.join(", "));
        let column_props = self.column_props.clone();
        let conn = Arc::clone(&self.conn);

        let found: Option<Entity> = tokio::task::spawn_blocking(move || -> Result<Option<Entity>> {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::repository(format!("get: preparing statement: {e}")))?;
            let mut rows = stmt
                .query(rusqlite::params_from_iter(pk_values.iter()))
                .map_err(|e| Error::repository(format!("get: {e}")))?;
            match rows
                .next()
                .map_err(|e| Error::repository(format!("get: fetching row: {e}")))?
            {
                Some(row) => {
                    let mut entity = Entity::new();
                    for (i, column) in columns.iter().enumerate() {
                        let prop = &column_props[i];
                        let raw: SqlValue = row
                            .get(i)
                            .map_err(|e| Error::repository(format!("reading column '{column}': {e}")))?;
                        entity.insert(column.clone(), sql_value_to_json(raw, prop, column)?);
                    }
                    Ok(Some(entity))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| Error::repository(format!("get task panicked: {e}")))??;

        self.events.emit(RepositoryEvent::Get(found.clone()));
        Ok(found)
    }

    async fn delete(&self, primary_key: &PrimaryKey) -> Result<()> {
        let pk_names = self.primary_key_names.clone();
        let pk_values: Vec<SqlValue> = pk_names
            .iter()
            .map(|name| {
                let prop = &self.schema.properties[name];
                let value = primary_key.get(name).cloned().unwrap_or(Json::Null);
                json_to_sql_value(&value, prop, name)
            })
            .collect::<Result<_>>()?;
        let where_clause = pk_names
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("DELETE FROM {TABLE} WHERE {where_clause}");
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(&sql, rusqlite::params_from_iter(pk_values.iter()))
                .map_err(|e| Error::repository(format!("delete: {e}")))
        })
        .await
        .map_err(|e| Error::repository(format!("delete task panicked: {e}")))??;

        self.events.emit(RepositoryEvent::Delete(primary_key.clone()));
        Ok(())
    }

    async fn delete_search(&self, column: &str, value: &Json, op: ComparisonOp) -> Result<u64> {
        let Some(prop) = self.schema.properties.get(column).cloned() else {
            // Fall back to the shared scan helper, which raises the same
            // "unknown column" WorkflowError the other backends raise.
            let all = self.get_all().await?.unwrap_or_default();
            return delete_search_by_scan(self, all, column, value, op).await;
        };
        let column = column.to_string();
        let sql_value = json_to_sql_value(value, &prop, &column)?;
        let sql = format!("DELETE FROM {TABLE} WHERE {column} {} ?1", op_sql(op));
        let conn = Arc::clone(&self.conn);

        let deleted = tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = conn.lock();
            let changed = conn
                .execute(&sql, rusqlite::params![sql_value])
                .map_err(|e| Error::repository(format!("delete_search: {e}")))?;
            Ok(changed as u64)
        })
        .await
        .map_err(|e| Error::repository(format!("delete_search task panicked: {e}")))??;

        Ok(deleted)
    }

    async fn get_all(&self) -> Result<Option<Vec<Entity>>> {
        let columns = self.columns.clone();
        let column_props = self.column_props.clone();
        let sql = format!("SELECT {} FROM {TABLE}", columns.join(", "));
        let conn = Arc::clone(&self.conn);

        let all = tokio::task::spawn_blocking(move || -> Result<Vec<Entity>> {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::repository(format!("get_all: preparing statement: {e}")))?;
            let rows = stmt
                .query_map([], |row| {
                    let mut entity = Entity::new();
                    for (i, column) in columns.iter().enumerate() {
                        let prop = &column_props[i];
                        let raw: SqlValue = row.get(i)?;
                        let json = sql_value_to_json(raw, prop, column)
                            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                        entity.insert(column.clone(), json);
                    }
                    Ok(entity)
                })
                .map_err(|e| Error::repository(format!("get_all: {e}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| Error::repository(format!("get_all: reading row: {e}")))?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::repository(format!("get_all task panicked: {e}")))??;

        if all.is_empty() {
            Ok(None)
        } else {
            Ok(Some(all))
        }
    }

    async fn delete_all(&self) -> Result<()> {
        let sql = format!("DELETE FROM {TABLE}");
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(&sql, [])
                .map_err(|e| Error::repository(format!("delete_all: {e}")))
        })
        .await
        .map_err(|e| Error::repository(format!("delete_all task panicked: {e}")))??;
        self.events.emit(RepositoryEvent::ClearAll);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {TABLE}");
        let conn = Arc::clone(&self.conn);
        let count: i64 = tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = conn.lock();
            conn.query_row(&sql, [], |row| row.get(0))
                .map_err(|e| Error::repository(format!("size: {e}")))
        })
        .await
        .map_err(|e| Error::repository(format!("size task panicked: {e}")))??;
        Ok(count as usize)
    }

    async fn search(&self, partial: &Entity) -> Result<Vec<Entity>> {
        require_matching_index(&self.primary_key_names, &self.indexes, partial)?;

        let columns = self.columns.clone();
        let column_props = self.column_props.clone();
        let mut where_parts = Vec::with_capacity(partial.len());
        let mut values = Vec::with_capacity(partial.len());
        for (i, (column, value)) in partial.iter().enumerate() {
            let prop = self
                .schema
                .properties
                .get(column)
                .ok_or_else(|| Error::workflow(format!("unknown search column '{column}'")))?;
            where_parts.push(format!("{column} = ?{}", i + 1));
            values.push(json_to_sql_value(value, prop, column)?);
        }
        let sql = format!(
            "SELECT {} FROM {TABLE} WHERE {}",
            columns.join(", "),
            where_parts.join(" AND ")
        );
        let conn = Arc::clone(&self.conn);

        let matched = tokio::task::spawn_blocking(move || -> Result<Vec<Entity>> {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| Error::repository(format!("search: preparing statement: {e}")))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                    let mut entity = Entity::new();
                    for (i, column) in columns.iter().enumerate() {
                        let prop = &column_props[i];
                        let raw: SqlValue = row.get(i)?;
                        let json = sql_value_to_json(raw, prop, column).unwrap_or(Json::Null);
                        entity.insert(column.clone(), json);
                    }
                    Ok(entity)
                })
                .map_err(|e| Error::repository(format!("search: {e}")))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| Error::repository(format!("search: reading row: {e}")))?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::repository(format!("search task panicked: {e}")))??;

        // The index-backed WHERE clause above already applies every
        // requested equality, but run it back through the same
        // `filter_by_partial` helper the memory backend uses so the two
        // backends agree bit-for-bit on result sets (e.g. null handling).
        let filtered = filter_by_partial(&matched, partial);
        self.events.emit(RepositoryEvent::Search(filtered.clone()));
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use taskgraph::schema::{PropertySchema, PropertyType, Schema};

    fn fixture_schema() -> Schema {
        let mut properties = BTreeMap::new();
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

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let repo = SqliteRepository::open_in_memory(fixture_schema(), vec!["id".to_string()], vec![])
            .unwrap();
        repo.put(entity("1", "a", 1.5)).await.unwrap();
        let pk: PrimaryKey = [("id".to_string(), Json::String("1".to_string()))].into();
        let got = repo.get(&pk).await.unwrap().unwrap();
        assert_eq!(got.get("category").unwrap(), "a");
        assert_eq!(got.get("value").unwrap(), &serde_json::json!(1.5));
    }

    #[tokio::test]
    async fn put_upserts_on_conflicting_primary_key() {
        let repo = SqliteRepository::open_in_memory(fixture_schema(), vec!["id".to_string()], vec![])
            .unwrap();
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        repo.put(entity("1", "b", 2.0)).await.unwrap();
        assert_eq!(repo.size().await.unwrap(), 1);
        let pk: PrimaryKey = [("id".to_string(), Json::String("1".to_string()))].into();
        let got = repo.get(&pk).await.unwrap().unwrap();
        assert_eq!(got.get("category").unwrap(), "b");
    }

    #[tokio::test]
    async fn search_requires_declared_index() {
        let repo = SqliteRepository::open_in_memory(fixture_schema(), vec!["id".to_string()], vec![])
            .unwrap();
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        let mut partial = Entity::new();
        partial.insert("category".to_string(), Json::String("a".to_string()));
        assert!(repo.search(&partial).await.is_err());
    }

    #[tokio::test]
    async fn search_by_declared_index_finds_matches() {
        let repo = SqliteRepository::open_in_memory(
            fixture_schema(),
            vec!["id".to_string()],
            vec![vec!["category".to_string()]],
        )
        .unwrap();
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        repo.put(entity("2", "b", 2.0)).await.unwrap();
        let mut partial = Entity::new();
        partial.insert("category".to_string(), Json::String("a".to_string()));
        let found = repo.search(&partial).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("id").unwrap(), "1");
    }

    #[tokio::test]
    async fn delete_search_removes_matching_rows_via_native_predicate() {
        let repo = SqliteRepository::open_in_memory(
            fixture_schema(),
            vec!["id".to_string()],
            vec![vec!["value".to_string()]],
        )
        .unwrap();
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        repo.put(entity("2", "a", 5.0)).await.unwrap();
        let deleted = repo
            .delete_search("value", &serde_json::json!(3.0), ComparisonOp::Gt)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(repo.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_bulk_commits_as_one_transaction() {
        let repo = SqliteRepository::open_in_memory(fixture_schema(), vec!["id".to_string()], vec![])
            .unwrap();
        let stored = repo
            .put_bulk(vec![entity("1", "a", 1.0), entity("2", "b", 2.0)])
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(repo.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn get_all_is_none_when_empty() {
        let repo = SqliteRepository::open_in_memory(fixture_schema(), vec!["id".to_string()], vec![])
            .unwrap();
        assert!(repo.get_all().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_repository_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.sqlite3");
        {
            let repo = SqliteRepository::open(
                fixture_schema(),
                vec!["id".to_string()],
                vec![],
                &path,
            )
            .unwrap();
            repo.put(entity("1", "a", 1.0)).await.unwrap();
        }
        let repo = SqliteRepository::open(fixture_schema(), vec!["id".to_string()], vec![], &path)
            .unwrap();
        assert_eq!(repo.size().await.unwrap(), 1);
    }
}
