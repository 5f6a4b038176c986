// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Filesystem repository backend: one JSON file per entity, named by the
//! fingerprint of its primary key, under a configured folder (spec §4.2
//! "filesystem" variant, §6.3).
//!
//! Every file is wrapped with a 20-byte integrity header (magic + format
//! version + CRC32 + payload length) around a canonical-JSON payload. A
//! corrupted or truncated file surfaces as a `RepositoryError` rather
//! than silently vanishing from `getAll`.
//!
//! `search` and `deleteSearch` are not implemented: without a secondary
//! index structure on disk, honoring them would require a full-directory
//! scan on every call, which this backend declines to do silently. Both
//! return [`Error::Unsupported`].

use super::{validate_entity, ComparisonOp, Repository, RepositoryEvent};
use crate::entity::{canonical_json_string, fingerprint_primary_key, project, Entity, PrimaryKey};
use crate::error::{Error, Result};
use crate::events::EventEmitter;
use crate::index::Index;
use crate::schema::Schema;
use async_trait::async_trait;
use fs2::FileExt;
use serde_json::Value as Json;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"TGFS";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 20;

fn wrap(payload: &[u8]) -> Vec<u8> {
    let checksum = crc32fast::hash(payload);
    let length = payload.len() as u64;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn unwrap(data: &[u8]) -> Result<&[u8]> {
    if data.len() < HEADER_SIZE {
        return Err(Error::repository(format!(
            "entity file too small: {} bytes (minimum {HEADER_SIZE})",
            data.len()
        )));
    }
    let magic: [u8; 4] = data[0..4].try_into().expect("slice is exactly 4 bytes");
    if &magic != MAGIC {
        return Err(Error::repository(format!(
            "invalid entity file magic bytes: found {magic:?}"
        )));
    }
    let version = u32::from_le_bytes(data[4..8].try_into().expect("slice is exactly 4 bytes"));
    if version > FORMAT_VERSION {
        return Err(Error::repository(format!(
            "unsupported entity file format version {version}"
        )));
    }
    let stored_checksum =
        u32::from_le_bytes(data[8..12].try_into().expect("slice is exactly 4 bytes"));
    let declared_length =
        u64::from_le_bytes(data[12..20].try_into().expect("slice is exactly 8 bytes"));
    let payload = &data[HEADER_SIZE..];
    if declared_length != payload.len() as u64 {
        return Err(Error::repository(format!(
            "entity file length mismatch: declared {declared_length}, actual {}",
            payload.len()
        )));
    }
    let computed_checksum = crc32fast::hash(payload);
    if stored_checksum != computed_checksum {
        return Err(Error::repository(format!(
            "entity file checksum mismatch: expected 0x{stored_checksum:08x}, computed 0x{computed_checksum:08x}"
        )));
    }
    Ok(payload)
}

/// Filesystem-backed [`Repository`] implementation: one integrity-wrapped
/// JSON file per entity under `folder`.
pub struct FilesystemRepository {
    schema: Schema,
    primary_key_names: Vec<String>,
    indexes: Vec<Index>,
    folder: PathBuf,
    events: EventEmitter<RepositoryEvent>,
}

impl FilesystemRepository {
    /// Construct a repository rooted at `folder`, creating it if absent.
    pub fn new(
        schema: Schema,
        primary_key_names: Vec<String>,
        declared_indexes: Vec<Index>,
        folder: impl Into<PathBuf>,
    ) -> Result<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder)
            .map_err(|e| Error::repository(format!("creating repository folder: {e}")))?;
        let indexes = crate::index::normalize_indexes(&primary_key_names, &declared_indexes);
        Ok(Self {
            schema,
            primary_key_names,
            indexes,
            folder,
            events: EventEmitter::new(),
        })
    }

    fn path_for(&self, pk: &PrimaryKey) -> PathBuf {
        self.folder.join(format!("{}.json", fingerprint_primary_key(pk)))
    }

    fn write_entity(&self, path: &Path, entity: &Entity) -> Result<()> {
        let payload = canonical_json_string(&Json::Object(entity.clone())).into_bytes();
        let wrapped = wrap(&payload);
        let tmp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path)
            .map_err(|e| Error::repository(format!("creating entity file: {e}")))?;
        file.lock_exclusive()
            .map_err(|e| Error::repository(format!("locking entity file: {e}")))?;
        file.write_all(&wrapped)
            .map_err(|e| Error::repository(format!("writing entity file: {e}")))?;
        file.sync_all()
            .map_err(|e| Error::repository(format!("syncing entity file: {e}")))?;
        drop(file);
        fs::rename(&tmp_path, path)
            .map_err(|e| Error::repository(format!("renaming entity file: {e}")))?;
        Ok(())
    }

    fn read_entity(path: &Path) -> Result<Entity> {
        let mut file = fs::File::open(path)
            .map_err(|e| Error::repository(format!("opening entity file: {e}")))?;
        file.lock_shared()
            .map_err(|e| Error::repository(format!("locking entity file: {e}")))?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)
            .map_err(|e| Error::repository(format!("reading entity file: {e}")))?;
        let payload = unwrap(&raw)?;
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::repository(format!("entity file is not utf-8: {e}")))?;
        let value: Json = serde_json::from_str(text)
            .map_err(|e| Error::repository(format!("entity file is not valid JSON: {e}")))?;
        match value {
            Json::Object(map) => Ok(map),
            _ => Err(Error::repository("entity file did not contain a JSON object")),
        }
    }

    fn all_entity_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let entries = fs::read_dir(&self.folder)
            .map_err(|e| Error::repository(format!("reading repository folder: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::repository(format!("reading directory entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

#[async_trait]
impl Repository for FilesystemRepository {
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
        let path = self.path_for(&pk);
        self.write_entity(&path, &full)?;
        self.events.emit(RepositoryEvent::Put(full.clone()));
        Ok(full)
    }

    async fn get(&self, primary_key: &PrimaryKey) -> Result<Option<Entity>> {
        let path = self.path_for(primary_key);
        let found = if path.exists() {
            Some(Self::read_entity(&path)?)
        } else {
            None
        };
        self.events.emit(RepositoryEvent::Get(found.clone()));
        Ok(found)
    }

    async fn delete(&self, primary_key: &PrimaryKey) -> Result<()> {
        let path = self.path_for(primary_key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| Error::repository(format!("removing entity file: {e}")))?;
        }
        self.events.emit(RepositoryEvent::Delete(primary_key.clone()));
        Ok(())
    }

    async fn delete_search(&self, _column: &str, _value: &Json, _op: ComparisonOp) -> Result<u64> {
        Err(Error::Unsupported(
            "filesystem repository does not support deleteSearch",
        ))
    }

    async fn get_all(&self) -> Result<Option<Vec<Entity>>> {
        let paths = self.all_entity_paths()?;
        if paths.is_empty() {
            return Ok(None);
        }
        let mut all = Vec::with_capacity(paths.len());
        for path in paths {
            all.push(Self::read_entity(&path)?);
        }
        Ok(Some(all))
    }

    async fn delete_all(&self) -> Result<()> {
        for path in self.all_entity_paths()? {
            fs::remove_file(&path)
                .map_err(|e| Error::repository(format!("removing entity file: {e}")))?;
        }
        self.events.emit(RepositoryEvent::ClearAll);
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.all_entity_paths()?.len())
    }

    async fn search(&self, _partial: &Entity) -> Result<Vec<Entity>> {
        Err(Error::Unsupported(
            "filesystem repository does not support search",
        ))
    }
}
