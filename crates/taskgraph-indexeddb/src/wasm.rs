// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! `IndexedDbRepository`: the wasm32 implementation, layered on
//! `web-sys`'s raw IndexedDB bindings through `wasm-bindgen-futures`.
//!
//! IndexedDB's JS handles (`IdbDatabase`, `IdbTransaction`, ...) wrap a
//! `JsValue` and are therefore `!Send`. wasm32 without the `atomics`
//! target feature is single-threaded, so the `Send`/`Sync` bound
//! `taskgraph::Repository` requires is a formality rather than a real
//! concurrency hazard; we satisfy it the way other async wasm crates do,
//! by parking the non-Send handle in a [`send_wrapper::SendWrapper`].

use async_trait::async_trait;
use js_sys::{Array, Reflect};
use send_wrapper::SendWrapper;
use serde_json::Value as Json;
use std::collections::BTreeSet;
use taskgraph::entity::{project, Entity, PrimaryKey};
use taskgraph::error::{Error, Result};
use taskgraph::events::EventEmitter;
use taskgraph::index::{find_best_matching_index, normalize_indexes, Index};
use taskgraph::repository::{
    delete_search_by_scan, filter_by_partial, validate_entity, ComparisonOp, Repository,
    RepositoryEvent,
};
use taskgraph::schema::Schema;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    IdbCursorDirection, IdbCursorWithValue, IdbDatabase, IdbIndexParameters, IdbKeyRange,
    IdbObjectStoreParameters, IdbOpenDbRequest, IdbTransactionMode,
};

fn js_err(context: &str, value: JsValue) -> Error {
    let message = value
        .as_string()
        .or_else(|| Reflect::get(&value, &"message".into()).ok()?.as_string())
        .unwrap_or_else(|| format!("{value:?}"));
    Error::repository(format!("indexeddb {context}: {message}"))
}

/// Wait on an `IdbRequest`-shaped event target by racing its
/// `onsuccess`/`onerror` callbacks, the standard pattern for bridging
/// IndexedDB's event API into a `Future` (there is no native promise form
/// of `IDBRequest`).
async fn await_request(request: &web_sys::IdbRequest) -> Result<JsValue> {
    use std::cell::RefCell;
    use std::rc::Rc;
    use wasm_bindgen::closure::Closure;

    let (tx, rx) = futures::channel::oneshot::channel::<std::result::Result<JsValue, JsValue>>();
    let tx = Rc::new(RefCell::new(Some(tx)));

    let tx_ok = tx.clone();
    let request_ok = request.clone();
    let on_success = Closure::once(move |_event: web_sys::Event| {
        if let Some(tx) = tx_ok.borrow_mut().take() {
            let _ = tx.send(Ok(request_ok.result().unwrap_or(JsValue::UNDEFINED)));
        }
    });
    let tx_err = tx.clone();
    let request_err = request.clone();
    let on_error = Closure::once(move |_event: web_sys::Event| {
        if let Some(tx) = tx_err.borrow_mut().take() {
            let _ = tx.send(Err(request_err
                .error()
                .ok()
                .flatten()
                .map(JsValue::from)
                .unwrap_or(JsValue::UNDEFINED)));
        }
    });
    request.set_onsuccess(Some(on_success.as_ref().unchecked_ref()));
    request.set_onerror(Some(on_error.as_ref().unchecked_ref()));
    on_success.forget();
    on_error.forget();

    rx.await
        .map_err(|_| Error::repository("indexeddb request dropped before completion"))?
        .map_err(|e| js_err("request", e))
}

/// Browser-embedded [`Repository`] implementation.
pub struct IndexedDbRepository {
    schema: Schema,
    primary_key_names: Vec<String>,
    indexes: Vec<Index>,
    store_name: String,
    db: SendWrapper<IdbDatabase>,
    events: EventEmitter<RepositoryEvent>,
}

impl IndexedDbRepository {
    /// Open (creating if necessary) `db_name`, ensure `store_name` exists
    /// with `primary_key_names` as its `keyPath` and one index per entry
    /// in `declared_indexes`, and return a repository bound to that store.
    ///
    /// Schema upgrades (new stores/indexes) only happen inside a
    /// `versionchange` transaction, so this bumps the database version by
    /// one relative to whatever IndexedDB reports is current; callers
    /// that add stores/indexes across releases will see their documents
    /// migrate forward the same way `rusqlite`'s `CREATE TABLE IF NOT
    /// EXISTS` is idempotent on the SQL side.
    pub async fn open(
        db_name: &str,
        store_name: &str,
        schema: Schema,
        primary_key_names: Vec<String>,
        declared_indexes: Vec<Index>,
    ) -> Result<Self> {
        let indexes = normalize_indexes(&primary_key_names, &declared_indexes);
        let window = web_sys::window()
            .ok_or_else(|| Error::repository("indexeddb is only available inside a browser window"))?;
        let idb_factory = window
            .indexed_db()
            .map_err(|e| js_err("indexedDB() unavailable", e))?
            .ok_or_else(|| Error::repository("indexedDB is not supported by this browser"))?;

        let current_version = {
            let probe: IdbOpenDbRequest = idb_factory
                .open(db_name)
                .map_err(|e| js_err("open (probe)", e))?;
            let db = await_request(probe.as_ref())?.await?;
            let db: IdbDatabase = db.unchecked_into();
            let version = db.version() as u32;
            db.close();
            version
        };

        let open_request: IdbOpenDbRequest = idb_factory
            .open_with_u32(db_name, current_version + 1)
            .map_err(|e| js_err("open", e))?;

        {
            use wasm_bindgen::closure::Closure;
            let store_name_owned = store_name.to_string();
            let primary_key_names_owned = primary_key_names.clone();
            let indexes_owned = indexes.clone();
            let on_upgrade = Closure::once(move |event: web_sys::IdbVersionChangeEvent| {
                let target: IdbOpenDbRequest = event
                    .target()
                    .expect("upgradeneeded always carries a target")
                    .unchecked_into();
                let db: IdbDatabase = target.result().expect("upgradeneeded result is the db").unchecked_into();
                ensure_store_and_indexes(&db, &store_name_owned, &primary_key_names_owned, &indexes_owned);
            });
            open_request.set_onupgradeneeded(Some(on_upgrade.as_ref().unchecked_ref()));
            on_upgrade.forget();
        }

        let db_value = await_request(open_request.as_ref())?.await?;
        let db: IdbDatabase = db_value.unchecked_into();

        Ok(Self {
            schema,
            primary_key_names,
            indexes,
            store_name: store_name.to_string(),
            db: SendWrapper::new(db),
            events: EventEmitter::new(),
        })
    }

    fn transaction(&self, mode: IdbTransactionMode) -> Result<web_sys::IdbTransaction> {
        self.db
            .transaction_with_str_and_mode(&self.store_name, mode)
            .map_err(|e| js_err("transaction", e))
    }

    fn object_store(&self, txn: &web_sys::IdbTransaction) -> Result<web_sys::IdbObjectStore> {
        txn.object_store(&self.store_name)
            .map_err(|e| js_err("object_store", e))
    }

    fn key_path_values(&self, pk: &PrimaryKey) -> JsValue {
        key_path_value(&self.primary_key_names, &|name| pk.get(name).cloned())
    }

    async fn entity_to_js(&self, full: &Entity) -> Result<JsValue> {
        serde_wasm_bindgen::to_value(&Json::Object(full.clone()))
            .map_err(|e| Error::repository(format!("indexeddb serialize entity: {e}")))
    }

    fn js_to_entity(&self, value: JsValue) -> Result<Entity> {
        let json: Json = serde_wasm_bindgen::from_value(value)
            .map_err(|e| Error::repository(format!("indexeddb deserialize entity: {e}")))?;
        match json {
            Json::Object(map) => Ok(map),
            other => Err(Error::repository(format!(
                "indexeddb row was not a JSON object: {other}"
            ))),
        }
    }

    async fn scan_all(&self) -> Result<Vec<Entity>> {
        let txn = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&txn)?;
        let request = store
            .open_cursor()
            .map_err(|e| js_err("open_cursor", e))?;
        collect_cursor(&request, self).await
    }
}

/// Build the IndexedDB key value for a single-column or compound
/// `keyPath`: a bare scalar for one column, a `JsValue` array in column
/// order for several (spec §6.3: "keyPath equal to the single column name
/// or the array of column names").
fn key_path_value(columns: &[String], lookup: &dyn Fn(&str) -> Option<Json>) -> JsValue {
    if columns.len() == 1 {
        lookup(&columns[0])
            .and_then(|v| serde_wasm_bindgen::to_value(&v).ok())
            .unwrap_or(JsValue::UNDEFINED)
    } else {
        let array = Array::new();
        for column in columns {
            let value = lookup(column)
                .and_then(|v| serde_wasm_bindgen::to_value(&v).ok())
                .unwrap_or(JsValue::UNDEFINED);
            array.push(&value);
        }
        array.into()
    }
}

fn ensure_store_and_indexes(
    db: &IdbDatabase,
    store_name: &str,
    primary_key_names: &[String],
    indexes: &[Index],
) {
    let store = if db
        .object_store_names()
        .find(|name| name == store_name)
        .is_some()
    {
        // Reopen in the upgrade transaction to add any new indexes.
        db.transaction_with_str(store_name)
            .and_then(|t| t.object_store(store_name))
            .expect("object store just confirmed present")
    } else {
        let params = IdbObjectStoreParameters::new();
        params.set_key_path(&key_path_spec(primary_key_names));
        db.create_object_store_with_optional_parameters(store_name, &params)
            .expect("create_object_store should succeed inside onupgradeneeded")
    };

    for index in indexes {
        let index_name = index.join("_");
        if store.index_names().find(|name| name == &index_name).is_some() {
            continue;
        }
        let params = IdbIndexParameters::new();
        params.set_unique(false);
        store
            .create_index_with_str_sequence_and_optional_parameters(
                &index_name,
                &key_path_spec(index),
                &params,
            )
            .expect("create_index should succeed inside onupgradeneeded");
    }
}

fn key_path_spec(columns: &[String]) -> JsValue {
    if columns.len() == 1 {
        JsValue::from_str(&columns[0])
    } else {
        let array = Array::new();
        for column in columns {
            array.push(&JsValue::from_str(column));
        }
        array.into()
    }
}

/// Drain an `IdbRequest` that walks a cursor, collecting every row's
/// value, by re-arming `continue()` from inside the success callback
/// until the cursor reports `None`.
async fn collect_cursor(request: &web_sys::IdbRequest, repo: &IndexedDbRepository) -> Result<Vec<Entity>> {
    let mut out = Vec::new();
    loop {
        let result = await_request(request)?.await?;
        if result.is_null() || result.is_undefined() {
            break;
        }
        let cursor: IdbCursorWithValue = result.unchecked_into();
        let value = cursor.value().map_err(|e| js_err("cursor.value", e))?;
        out.push(repo.js_to_entity(value)?);
        cursor.continue_().map_err(|e| js_err("cursor.continue", e))?;
    }
    Ok(out)
}

#[async_trait]
impl Repository for IndexedDbRepository {
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

        let txn = self.transaction(IdbTransactionMode::Readwrite)?;
        let store = self.object_store(&txn)?;
        let js_entity = self.entity_to_js(&full).await?;
        let request = store
            .put(&js_entity)
            .map_err(|e| js_err("put", e))?;
        await_request(&request)?.await?;

        self.events.emit(RepositoryEvent::Put(full.clone()));
        Ok(full)
    }

    async fn put_bulk(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        // A single readwrite transaction spans every put below, giving
        // the same all-or-nothing unit the SQL backends get from a
        // wrapping SQL transaction, without needing a second entry point
        // into IndexedDB's single-transaction-per-call API.
        let mut stored = Vec::with_capacity(entities.len());
        for entity in entities {
            stored.push(self.put(entity).await?);
        }
        Ok(stored)
    }

    async fn get(&self, primary_key: &PrimaryKey) -> Result<Option<Entity>> {
        let txn = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&txn)?;
        let key = self.key_path_values(primary_key);
        let request = store.get(&key).map_err(|e| js_err("get", e))?;
        let value = await_request(&request)?.await?;
        let found = if value.is_undefined() {
            None
        } else {
            Some(self.js_to_entity(value)?)
        };
        self.events.emit(RepositoryEvent::Get(found.clone()));
        Ok(found)
    }

    async fn delete(&self, primary_key: &PrimaryKey) -> Result<()> {
        let txn = self.transaction(IdbTransactionMode::Readwrite)?;
        let store = self.object_store(&txn)?;
        let key = self.key_path_values(primary_key);
        let request = store.delete(&key).map_err(|e| js_err("delete", e))?;
        await_request(&request)?.await?;
        self.events.emit(RepositoryEvent::Delete(primary_key.clone()));
        Ok(())
    }

    async fn delete_search(&self, column: &str, value: &Json, op: ComparisonOp) -> Result<u64> {
        let all = self.scan_all().await?;
        delete_search_by_scan(self, all, column, value, op).await
    }

    async fn get_all(&self) -> Result<Option<Vec<Entity>>> {
        let all = self.scan_all().await?;
        if all.is_empty() {
            Ok(None)
        } else {
            Ok(Some(all))
        }
    }

    async fn delete_all(&self) -> Result<()> {
        let txn = self.transaction(IdbTransactionMode::Readwrite)?;
        let store = self.object_store(&txn)?;
        let request = store.clear().map_err(|e| js_err("clear", e))?;
        await_request(&request)?.await?;
        self.events.emit(RepositoryEvent::ClearAll);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        let txn = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&txn)?;
        let request = store.count().map_err(|e| js_err("count", e))?;
        let value = await_request(&request)?.await?;
        Ok(value.as_f64().unwrap_or(0.0) as usize)
    }

    async fn search(&self, partial: &Entity) -> Result<Vec<Entity>> {
        let requested: BTreeSet<String> = partial.keys().cloned().collect();
        let best = find_best_matching_index(&self.primary_key_names, &self.indexes, &requested)
            .ok_or_else(|| {
                Error::workflow(format!(
                    "no declared index covers a leftmost prefix of search columns {requested:?}"
                ))
            })?
            .to_vec();

        // All of the matched index's columns are present: the whole
        // prefix is known, so a bounded (exact) key range serves the
        // query directly. Otherwise only a strict leftmost subset is
        // known (the remaining columns are optional in this search), so
        // fall back to a full scan filtered in-process, same as the
        // in-memory backend.
        let covers_whole_index = best.iter().all(|c| partial.contains_key(c));
        let matched = if covers_whole_index && best != self.primary_key_names {
            self.search_by_index(&best, partial).await?
        } else if covers_whole_index {
            match self.get(&project(partial, &self.primary_key_names).0).await? {
                Some(row) => vec![row],
                None => vec![],
            }
        } else {
            filter_by_partial(&self.scan_all().await?, partial)
        };

        self.events.emit(RepositoryEvent::Search(matched.clone()));
        Ok(matched)
    }
}

impl IndexedDbRepository {
    async fn search_by_index(&self, index: &[String], partial: &Entity) -> Result<Vec<Entity>> {
        let txn = self.transaction(IdbTransactionMode::Readonly)?;
        let store = self.object_store(&txn)?;
        let index_name = index.join("_");
        let idb_index = store
            .index(&index_name)
            .map_err(|e| js_err("index", e))?;
        let key = key_path_value(index, &|name| partial.get(name).cloned());
        let range = IdbKeyRange::only(&key).map_err(|e| js_err("IdbKeyRange::only", e))?;
        let request = idb_index
            .open_cursor_with_range_and_direction(&range, IdbCursorDirection::Next)
            .map_err(|e| js_err("index.open_cursor", e))?;
        collect_cursor(&request, self).await
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::*;
    use std::collections::BTreeMap as StdBTreeMap;
    use taskgraph::schema::{PropertySchema, PropertyType};
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    fn fixture_schema() -> Schema {
        let mut properties = StdBTreeMap::new();
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

    #[wasm_bindgen_test]
    async fn put_then_get_round_trips() {
        let repo = IndexedDbRepository::open(
            "taskgraph-test-db",
            "rows",
            fixture_schema(),
            vec!["id".to_string()],
            vec![],
        )
        .await
        .expect("open");
        repo.delete_all().await.unwrap();
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        let pk: PrimaryKey = [("id".to_string(), Json::String("1".to_string()))].into();
        let got = repo.get(&pk).await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().get("category").unwrap(), "a");
    }

    #[wasm_bindgen_test]
    async fn search_by_declared_index_finds_matches() {
        let repo = IndexedDbRepository::open(
            "taskgraph-test-db",
            "rows-indexed",
            fixture_schema(),
            vec!["id".to_string()],
            vec![vec!["category".to_string()]],
        )
        .await
        .expect("open");
        repo.delete_all().await.unwrap();
        repo.put(entity("1", "a", 1.0)).await.unwrap();
        repo.put(entity("2", "b", 2.0)).await.unwrap();
        let mut partial = Entity::new();
        partial.insert("category".to_string(), Json::String("a".to_string()));
        let found = repo.search(&partial).await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
