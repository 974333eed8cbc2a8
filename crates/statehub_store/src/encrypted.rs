//! Encrypted variant of the local store.
//!
//! Same directory layout and manifest as [`crate::LocalStore`], with two
//! differences: the store lives in a per-user subdirectory so each signed-in
//! user gets an isolated namespace, and record values are opaque encrypted
//! blobs rather than plaintext items. Keys stay in the clear so lookups and
//! deletes work without decryption.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    collection_file, read_cbor, write_cbor, Manifest, RecordStore, MANIFEST_FILE,
};
use parking_lot::RwLock;
use statehub_core::{CollectionSpec, CoreError, Item, ObjectCipher, UserIdentity};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct Inner {
    manifest: Manifest,
    collections: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

/// On-disk collection store holding encrypted records.
pub struct EncryptedLocalStore {
    dir: PathBuf,
    specs: HashMap<String, CollectionSpec>,
    cipher: Arc<dyn ObjectCipher>,
    inner: RwLock<Inner>,
}

impl EncryptedLocalStore {
    /// Opens (or creates) an encrypted store under `base_dir` for the
    /// signed-in user.
    ///
    /// The actual store directory is `base_dir/<username>`. Recovery and
    /// lazy schema creation behave as in [`crate::LocalStore::open`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NoSignedInUser`] if nobody is signed in, or an
    /// I/O error if the directory cannot be created or written.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        specs: &[CollectionSpec],
        version: u32,
        cipher: Arc<dyn ObjectCipher>,
        identity: &dyn UserIdentity,
    ) -> StoreResult<Self> {
        let username = identity
            .logged_in_username()
            .ok_or(CoreError::NoSignedInUser)?;
        let dir = base_dir.into().join(username);
        fs::create_dir_all(&dir)?;

        let mut inner = match Self::load(&dir) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "encrypted store load failed, recreating");
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                fs::create_dir_all(&dir)?;
                Inner {
                    manifest: Manifest {
                        version,
                        collections: Vec::new(),
                    },
                    collections: HashMap::new(),
                }
            }
        };

        let missing: Vec<String> = specs
            .iter()
            .map(|s| s.name.clone())
            .filter(|name| !inner.manifest.collections.contains(name))
            .collect();
        if !missing.is_empty() {
            inner.manifest.version = inner.manifest.version.max(version).saturating_add(1);
            for name in missing {
                tracing::info!(collection = %name, "creating missing encrypted collection");
                inner.manifest.collections.push(name.clone());
                inner.collections.insert(name, BTreeMap::new());
            }
        }

        let store = Self {
            dir,
            specs: specs.iter().map(|s| (s.name.clone(), s.clone())).collect(),
            cipher,
            inner: RwLock::new(inner),
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

    /// Returns the directory this user's store lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
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
            let records: BTreeMap<String, Vec<u8>> = read_cbor(&dir.join(collection_file(name)))?;
            collections.insert(name.clone(), records);
        }
        Ok(Inner {
            manifest,
            collections,
        })
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

    fn encrypt_item(&self, item: &Item) -> StoreResult<Vec<u8>> {
        Ok(self.cipher.encrypt_object(&item.clone().into_value())?)
    }

    fn decrypt_item(&self, blob: &[u8]) -> StoreResult<Item> {
        let value = self.cipher.decrypt_object(blob)?;
        Ok(Item::from_value(value)?)
    }
}

impl RecordStore for EncryptedLocalStore {
    fn collection_names(&self) -> Vec<String> {
        self.inner.read().manifest.collections.clone()
    }

    fn get_all(&self, name: &str) -> StoreResult<Vec<Item>> {
        let blobs: Vec<Vec<u8>> = {
            let inner = self.inner.read();
            let records = inner
                .collections
                .get(name)
                .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
            records.values().cloned().collect()
        };
        blobs.iter().map(|b| self.decrypt_item(b)).collect()
    }

    fn get(&self, name: &str, key: &str) -> StoreResult<Option<Item>> {
        let blob = {
            let inner = self.inner.read();
            let records = inner
                .collections
                .get(name)
                .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
            records.get(key).cloned()
        };
        blob.map(|b| self.decrypt_item(&b)).transpose()
    }

    fn put(&self, name: &str, item: &Item) -> StoreResult<()> {
        let key = item.key_string(name, &self.spec(name)?.key_field)?;
        let blob = self.encrypt_item(item)?;
        {
            let mut inner = self.inner.write();
            let records = inner
                .collections
                .get_mut(name)
                .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
            records.insert(key, blob);
        }
        self.persist_collection(name)
    }

    fn put_all(&self, name: &str, items: &[Item]) -> StoreResult<()> {
        let key_field = self.spec(name)?.key_field.clone();
        let mut records = BTreeMap::new();
        for item in items {
            let key = item.key_string(name, &key_field)?;
            records.insert(key, self.encrypt_item(item)?);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesObjectCipher, EncryptionKey};
    use serde_json::json;
    use statehub_core::StaticIdentity;

    fn item(v: serde_json::Value) -> Item {
        Item::from_value(v).unwrap()
    }

    fn specs() -> Vec<CollectionSpec> {
        vec![CollectionSpec::keyed_by_id("notes")]
    }

    fn cipher() -> Arc<dyn ObjectCipher> {
        Arc::new(AesObjectCipher::new(
            EncryptionKey::derive_from_password(b"test", b"salt").unwrap(),
        ))
    }

    #[test]
    fn round_trip_through_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedLocalStore::open(
            dir.path(),
            &specs(),
            1,
            cipher(),
            &StaticIdentity::signed_in("alice"),
        )
        .unwrap();

        store.put("notes", &item(json!({"id": 1, "body": "secret"}))).unwrap();
        let got = store.get("notes", "1").unwrap().unwrap();
        assert_eq!(got.get("body"), Some(&json!("secret")));
    }

    #[test]
    fn plaintext_never_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedLocalStore::open(
            dir.path(),
            &specs(),
            1,
            cipher(),
            &StaticIdentity::signed_in("alice"),
        )
        .unwrap();
        store.put("notes", &item(json!({"id": 1, "body": "topsecret"}))).unwrap();

        let raw = fs::read(store.dir().join("notes.cbor")).unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("topsecret"));
    }

    #[test]
    fn users_get_isolated_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let alice = EncryptedLocalStore::open(
            dir.path(),
            &specs(),
            1,
            cipher(),
            &StaticIdentity::signed_in("alice"),
        )
        .unwrap();
        alice.put("notes", &item(json!({"id": 1, "body": "alice only"}))).unwrap();

        let bob = EncryptedLocalStore::open(
            dir.path(),
            &specs(),
            1,
            cipher(),
            &StaticIdentity::signed_in("bob"),
        )
        .unwrap();
        assert!(bob.get_all("notes").unwrap().is_empty());
        assert_ne!(alice.dir(), bob.dir());
    }

    #[test]
    fn signed_out_user_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let result = EncryptedLocalStore::open(
            dir.path(),
            &specs(),
            1,
            cipher(),
            &StaticIdentity::signed_out(),
        );
        assert!(matches!(
            result,
            Err(StoreError::Core(CoreError::NoSignedInUser))
        ));
    }

    #[test]
    fn wrong_key_recovers_destructively_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = EncryptedLocalStore::open(
                dir.path(),
                &specs(),
                1,
                cipher(),
                &StaticIdentity::signed_in("alice"),
            )
            .unwrap();
            store.put("notes", &item(json!({"id": 1}))).unwrap();
        }
        // Corrupt the collection file so the reopen cannot parse it.
        let user_dir = dir.path().join("alice");
        fs::write(user_dir.join("notes.cbor"), b"junk").unwrap();

        let recovered = EncryptedLocalStore::open(
            dir.path(),
            &specs(),
            1,
            cipher(),
            &StaticIdentity::signed_in("alice"),
        )
        .unwrap();
        assert!(recovered.get_all("notes").unwrap().is_empty());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = EncryptedLocalStore::open(
                dir.path(),
                &specs(),
                1,
                cipher(),
                &StaticIdentity::signed_in("alice"),
            )
            .unwrap();
            store.put("notes", &item(json!({"id": 9, "body": "kept"}))).unwrap();
        }

        let reopened = EncryptedLocalStore::open(
            dir.path(),
            &specs(),
            1,
            cipher(),
            &StaticIdentity::signed_in("alice"),
        )
        .unwrap();
        let items = reopened.get_all("notes").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get("body"), Some(&json!("kept")));
    }
}
