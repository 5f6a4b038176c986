// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Browser-embedded tabular repository backend, backed by IndexedDB (spec
//! §4.2 "browser-embedded" variant, §6.3 object-store layout).
//!
//! One object store per table. The store's `keyPath` is the declared
//! primary key (a single column name, or the array of column names for a
//! compound key). Each declared index becomes an IndexedDB index on that
//! store with `keyPath` equal to the single column or the array of
//! columns; compound indexes therefore use a composite key path exactly
//! as `taskgraph-sqlite`'s `CREATE INDEX (col1, col2)` does for SQL.
//! Leftmost-prefix search is served from the matching index's bounded key
//! range when every prefix column is present and non-optional, and falls
//! back to a full-store scan filtered in-process otherwise — the same
//! `filter_by_partial` used by the in-memory and filesystem backends.
//!
//! This crate only compiles its IndexedDB bindings under
//! `target_arch = "wasm32"`; on other targets it exposes no repository
//! type, the same way the sibling SQL backends are each scoped to the
//! driver they wrap.

#![cfg_attr(not(target_arch = "wasm32"), allow(unused))]

#[cfg(target_arch = "wasm32")]
mod wasm;

#[cfg(target_arch = "wasm32")]
pub use wasm::IndexedDbRepository;

// On a native target this crate is an intentionally empty placeholder so
// that `cargo check --workspace` keeps working from a non-browser host;
// the real bindings only make sense once compiled to wasm32 and loaded
// into a page, the same way `rusqlite`'s bundled SQLite only makes sense
// once linked into a native binary.
