// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Tabular Repository (spec §4.2, component B): a uniform
//! `put/get/delete/search/getAll/size/deleteSearch` contract over a
//! schema-typed entity with compound primary keys and declared indexes,
//! implemented identically across multiple backends.
//!
//! The contract is expressed as a trait (`the tabular contract`, per spec
//! §9's design note) rather than an abstract base class with per-backend
//! subclasses: each backend is a concrete type implementing
//! [`Repository`], and the truly shared logic (schema split, index
//! normalization/selection, primary-key canonicalization) lives in free
//! functions in [`crate::schema`], [`crate::index`], and [`crate::entity`].

pub mod filesystem;
pub mod memory;

use crate::entity::{Entity, PrimaryKey};
use crate::error::{Error, Result};
use crate::events::EventEmitter;
use crate::index::Index;
use crate::schema::Schema;
use async_trait::async_trait;
use serde_json::Value as Json;

pub use filesystem::FilesystemRepository;
pub use memory::MemoryRepository;

/// Comparison operator for [`Repository::delete_search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    /// `=`
    Eq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl ComparisonOp {
    fn matches(self, lhs: &Json, rhs: &Json) -> bool {
        use std::cmp::Ordering;
        let Some(ord) = compare_json(lhs, rhs) else {
            return false;
        };
        match self {
            ComparisonOp::Eq => ord == Ordering::Equal,
            ComparisonOp::Lt => ord == Ordering::Less,
            ComparisonOp::Le => ord != Ordering::Greater,
            ComparisonOp::Gt => ord == Ordering::Greater,
            ComparisonOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Order two scalar JSON values the way SQL `ORDER BY` would: numerically
/// for numbers, lexicographically for strings, `false < true` for bools.
/// Returns `None` for incomparable types (e.g. comparing an object).
fn compare_json(a: &Json, b: &Json) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Json::String(x), Json::String(y)) => Some(x.cmp(y)),
        (Json::Bool(x), Json::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Events emitted by every mutating repository operation (spec §6.4).
#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    /// Emitted after a successful `put`.
    Put(Entity),
    /// Emitted after a `get` (hit or miss).
    Get(Option<Entity>),
    /// Emitted after a `search`, carrying the matched set.
    Search(Vec<Entity>),
    /// Emitted after a successful `delete` (by key or predicate).
    Delete(PrimaryKey),
    /// Emitted after `deleteAll`.
    ClearAll,
}

/// The tabular contract: identical for every backend (spec §4.2 table).
///
/// Implementors must fail with [`Error::Unsupported`] — never silently
/// no-op — for any operation they cannot honor (spec §7 "no silent data
/// loss"; spec §9 open question (iii)).
#[async_trait]
pub trait Repository: Send + Sync {
    /// The full entity schema this repository was constructed with.
    fn schema(&self) -> &Schema;

    /// Declared primary-key property names, in order.
    fn primary_key_names(&self) -> &[String];

    /// Declared secondary indexes, after prefix-normalization.
    fn indexes(&self) -> &[Index];

    /// The event bus for this repository instance.
    fn events(&self) -> &EventEmitter<RepositoryEvent>;

    /// Upsert by primary key. Returns the stored entity with any
    /// backend-generated columns filled in.
    async fn put(&self, entity: Entity) -> Result<Entity>;

    /// Upsert many entities, all-or-nothing within the backend's smallest
    /// atomicity unit. Default implementation calls `put` sequentially,
    /// which is correct but not necessarily atomic; SQL backends override
    /// this with a single transaction.
    async fn put_bulk(&self, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let mut stored = Vec::with_capacity(entities.len());
        for entity in entities {
            stored.push(self.put(entity).await?);
        }
        Ok(stored)
    }

    /// Look up by primary key.
    async fn get(&self, primary_key: &PrimaryKey) -> Result<Option<Entity>>;

    /// Delete by primary key. A no-op (but still `Ok`) if no row matches.
    async fn delete(&self, primary_key: &PrimaryKey) -> Result<()>;

    /// Delete every row matching `column <op> value`.
    async fn delete_search(
        &self,
        column: &str,
        value: &Json,
        op: ComparisonOp,
    ) -> Result<u64>;

    /// All rows, or `None` if the table is empty.
    async fn get_all(&self) -> Result<Option<Vec<Entity>>>;

    /// Remove every row.
    async fn delete_all(&self) -> Result<()>;

    /// Row count.
    async fn size(&self) -> Result<usize>;

    /// Every entity whose declared columns equal the given partial
    /// entity's values, chosen via `findBestMatchingIndex`. Fails if no
    /// declared index covers any leftmost subset of the provided columns.
    async fn search(&self, partial: &Entity) -> Result<Vec<Entity>>;
}

/// Validate `entity` against `schema`, mapping failure into the
/// `InvalidInput` variant `put`/`put_bulk` must return (spec §4.2 table).
pub fn validate_entity(schema: &Schema, entity: &Entity) -> Result<()> {
    schema.validate(&Json::Object(entity.clone()))
}

/// Shared `deleteSearch` fallback for backends with no native predicate
/// delete: scan with `search` restricted to the single column's equality
/// case, then apply the comparison in-process and delete matches one at a
/// time, the same default-from-primitives shape as `get_all` + per-row
/// `delete`.
pub async fn delete_search_by_scan<R: Repository + ?Sized>(
    repo: &R,
    all: Vec<Entity>,
    column: &str,
    value: &Json,
    op: ComparisonOp,
) -> Result<u64> {
    if !repo.schema().properties.contains_key(column) {
        return Err(Error::workflow(format!(
            "unknown column '{column}' in deleteSearch"
        )));
    }
    let mut deleted = 0u64;
    for entity in all {
        let Some(field) = entity.get(column) else {
            continue;
        };
        if op.matches(field, value) {
            let (pk, _) = crate::entity::project(&entity, repo.primary_key_names());
            repo.delete(&pk).await?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Shared `search` implementation for in-process backends (memory,
/// filesystem via a full scan): select the best matching index, then
/// filter a candidate set by equality on every requested column.
pub fn filter_by_partial(
    candidates: &[Entity],
    partial: &Entity,
) -> Vec<Entity> {
    candidates
        .iter()
        .filter(|entity| {
            partial
                .iter()
                .all(|(k, v)| entity.get(k).map(|existing| existing == v).unwrap_or(false))
        })
        .cloned()
        .collect()
}

/// Determine the requested-columns set from a partial entity and confirm
/// an index covers a leftmost prefix of it, per `findBestMatchingIndex`
/// (spec §4.2). Returns the index used, for diagnostics/testing.
pub fn require_matching_index(
    primary_key_names: &[String],
    indexes: &[Index],
    partial: &Entity,
) -> Result<Vec<String>> {
    let requested: std::collections::BTreeSet<String> = partial.keys().cloned().collect();
    crate::index::find_best_matching_index(primary_key_names, indexes, &requested)
        .map(<[String]>::to_vec)
        .ok_or_else(|| {
            Error::workflow(format!(
                "no declared index covers a leftmost prefix of search columns {requested:?}"
            ))
        })
}
