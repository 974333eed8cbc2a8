//! Adapter exposing a [`RecordStore`] as an asynchronous backend.
//!
//! The local store resolves immediately, but it is surfaced through the
//! asynchronous contract so callers and composites treat local and remote
//! collections uniformly: fetches complete on the calling thread, writes go
//! straight through to disk.

use crate::error::StoreResult;
use crate::store::RecordStore;
use statehub_core::{AsyncFetcher, CollectionSpec, CoreError, CoreResult, Item, RunHandle};
use std::collections::HashMap;
use std::sync::Arc;

fn to_core(result: StoreResult<()>) -> CoreResult<()> {
    result.map_err(|e| CoreError::Storage(e.to_string()))
}

/// [`AsyncFetcher`] backed by a local [`RecordStore`].
pub struct StoreBackend {
    store: Arc<dyn RecordStore>,
    key_fields: HashMap<String, String>,
}

impl StoreBackend {
    /// Creates a backend over `store` for the configured collections.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, specs: &[CollectionSpec]) -> Self {
        Self {
            store,
            key_fields: specs
                .iter()
                .map(|s| (s.name.clone(), s.key_field.clone()))
                .collect(),
        }
    }

    fn key_for(&self, name: &str, item: &Item) -> CoreResult<String> {
        let key_field = self
            .key_fields
            .get(name)
            .ok_or_else(|| CoreError::NoConfiguration(name.to_string()))?;
        item.key_string(name, key_field)
    }
}

impl AsyncFetcher for StoreBackend {
    fn start_fetch(&self, name: &str, run: RunHandle) -> CoreResult<()> {
        match self.store.get_all(name) {
            Ok(items) => run.complete(items),
            Err(e) => run.fail(&CoreError::Storage(e.to_string())),
        }
        Ok(())
    }

    fn create(&self, name: &str, item: &Item) -> CoreResult<()> {
        to_core(self.store.put(name, item))
    }

    fn update(&self, name: &str, item: &Item) -> CoreResult<()> {
        to_core(self.store.put(name, item))
    }

    fn destroy(&self, name: &str, item: &Item) -> CoreResult<()> {
        let key = self.key_for(name, item)?;
        to_core(self.store.delete(name, &key))
    }
}
