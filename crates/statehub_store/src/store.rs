//! The local transactional collection store.
//!
//! A store is a directory holding one CBOR file per collection plus a
//! manifest. Collections are maps from key string to item, keyed by each
//! collection's configured key field. Schema is created lazily: opening a
//! store with collections the manifest does not know about bumps the
//! manifest version and creates the missing files. If the directory cannot
//! be loaded at all, it is deleted and recreated empty (destructive
//! recovery).

use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use statehub_core::{CollectionSpec, Item};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const MANIFEST_FILE: &str = "manifest.cbor";

/// Uniform record-level interface over a set of named collections.
///
/// Implemented by [`LocalStore`] and
/// [`crate::EncryptedLocalStore`], and consumed by the offline replay
/// queue and the persistent cache.
pub trait RecordStore: Send + Sync {
    /// Returns the names of the collections in the schema.
    fn collection_names(&self) -> Vec<String>;

    /// Returns every record in a collection, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or a record cannot be
    /// decoded.
    fn get_all(&self, name: &str) -> StoreResult<Vec<Item>>;

    /// Returns the record stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or the record cannot
    /// be decoded.
    fn get(&self, name: &str, key: &str) -> StoreResult<Option<Item>>;

    /// Inserts or replaces a record, keyed by the collection's key field.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown, the item lacks its
    /// key field, or the write fails.
    fn put(&self, name: &str, item: &Item) -> StoreResult<()>;

    /// Replaces the whole collection with `items` in one write.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or the write fails.
    fn put_all(&self, name: &str, items: &[Item]) -> StoreResult<()>;

    /// Deletes the record stored under `key`. Missing keys are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or the write fails.
    fn delete(&self, name: &str, key: &str) -> StoreResult<()>;

    /// Removes every record from a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection is unknown or the write fails.
    fn clear(&self, name: &str) -> StoreResult<()>;
}

/// The store manifest: schema version plus known collection names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub(crate) version: u32,
    pub(crate) collections: Vec<String>,
}

struct Inner {
    manifest: Manifest,
    collections: HashMap<String, BTreeMap<String, Item>>,
}

/// Plain on-disk collection store.
pub struct LocalStore {
    dir: PathBuf,
    specs: HashMap<String, CollectionSpec>,
    inner: RwLock<Inner>,
}

impl LocalStore {
    /// Opens (or creates) a store at `dir` for the configured collections.
    ///
    /// Collections configured here but absent from the stored manifest
    /// trigger a version bump and are created empty. A store that fails to
    /// load outright is deleted and recreated.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory cannot be created or written
    /// even after recovery.
    pub fn open(dir: impl Into<PathBuf>, specs: &[CollectionSpec], version: u32) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut inner = match Self::load(&dir) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "store load failed, recreating");
                Self::destroy(&dir)?;
                Inner {
                    manifest: Manifest {
                        version,
                        collections: Vec::new(),
                    },
                    collections: HashMap::new(),
                }
            }
        };

        let store = {
            let missing: Vec<String> = specs
                .iter()
                .map(|s| s.name.clone())
                .filter(|name| !inner.manifest.collections.contains(name))
                .collect();
            if !missing.is_empty() {
                inner.manifest.version = inner.manifest.version.max(version).saturating_add(1);
                for name in missing {
                    tracing::info!(collection = %name, "creating missing collection");
                    inner.manifest.collections.push(name.clone());
                    inner.collections.insert(name, BTreeMap::new());
                }
            }
            Self {
                dir,
                specs: specs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
                inner: RwLock::new(inner),
            }
        };

        store.persist_manifest()?;
        for name in store.collection_names() {
            store.persist_collection(&name)?;
        }
        Ok(store)
    }

    /// Returns the store's schema version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner.read().manifest.version
    }

    fn load(dir: &Path) -> StoreResult<Inner> {
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(Inner {
                manifest: Manifest::default(),
                collections: HashMap::new(),
            });
        }

        let manifest: Manifest = read_cbor(&manifest_path)?;
        let mut collections = HashMap::new();
        for name in &manifest.collections {
            let records: BTreeMap<String, Item> = read_cbor(&dir.join(collection_file(name)))?;
            collections.insert(name.clone(), records);
        }
        Ok(Inner {
            manifest,
            collections,
        })
    }

    fn destroy(dir: &Path) -> StoreResult<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        Ok(())
    }

    fn persist_manifest(&self) -> StoreResult<()> {
        write_cbor(&self.dir.join(MANIFEST_FILE), &self.inner.read().manifest)
    }

    fn persist_collection(&self, name: &str) -> StoreResult<()> {
        let inner = self.inner.read();
        let records = inner
            .collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
        write_cbor(&self.dir.join(collection_file(name)), records)
    }

    fn spec(&self, name: &str) -> StoreResult<&CollectionSpec> {
        self.specs
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }
}

impl RecordStore for LocalStore {
    fn collection_names(&self) -> Vec<String> {
        self.inner.read().manifest.collections.clone()
    }

    fn get_all(&self, name: &str) -> StoreResult<Vec<Item>> {
        let inner = self.inner.read();
        let records = inner
            .collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
        Ok(records.values().cloned().collect())
    }

    fn get(&self, name: &str, key: &str) -> StoreResult<Option<Item>> {
        let inner = self.inner.read();
        let records = inner
            .collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
        Ok(records.get(key).cloned())
    }

    fn put(&self, name: &str, item: &Item) -> StoreResult<()> {
        let key = item.key_string(name, &self.spec(name)?.key_field)?;
        {
            let mut inner = self.inner.write();
            let records = inner
                .collections
                .get_mut(name)
                .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
            records.insert(key, item.clone());
        }
        self.persist_collection(name)
    }

    fn put_all(&self, name: &str, items: &[Item]) -> StoreResult<()> {
        let key_field = self.spec(name)?.key_field.clone();
        let mut records = BTreeMap::new();
        for item in items {
            records.insert(item.key_string(name, &key_field)?, item.clone());
        }
        self.inner
            .write()
            .collections
            .insert(name.to_string(), records);
        self.persist_collection(name)
    }

    fn delete(&self, name: &str, key: &str) -> StoreResult<()> {
        {
            let mut inner = self.inner.write();
            let records = inner
                .collections
                .get_mut(name)
                .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
            records.remove(key);
        }
        self.persist_collection(name)
    }

    fn clear(&self, name: &str) -> StoreResult<()> {
        {
            let mut inner = self.inner.write();
            let records = inner
                .collections
                .get_mut(name)
                .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
            records.clear();
        }
        self.persist_collection(name)
    }
}

pub(crate) fn collection_file(name: &str) -> String {
    format!("{name}.cbor")
}

pub(crate) fn read_cbor<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let file = fs::File::open(path)?;
    ciborium::from_reader(std::io::BufReader::new(file))
        .map_err(|e| StoreError::Decode(e.to_string()))
}

pub(crate) fn write_cbor<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let file = fs::File::create(path)?;
    ciborium::into_writer(value, std::io::BufWriter::new(file))
        .map_err(|e| StoreError::Encode(e.to_string()))
}
