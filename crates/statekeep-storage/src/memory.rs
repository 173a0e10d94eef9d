//! In-memory storage backend for testing and development.
//!
//! This backend stores all data in a `BTreeMap` behind a `RwLock`. It is not
//! persistent; all data is lost when the process exits. Multi-key writes
//! apply under a single write guard, so readers never observe half a batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{BackendFactory, Entries, KeyValueBackend, StorageError};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Clones share the same underlying map.
///
/// # Examples
///
/// ```
/// # use statekeep_storage::{Entries, KeyValueBackend, MemoryBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// let mut entries = Entries::new();
/// entries.insert("meta".to_owned(), serde_json::json!({ "version": 1 }));
/// backend.set(&entries).await.unwrap();
/// let values = backend.get(&["meta".to_owned()]).await.unwrap();
/// assert_eq!(values[0], Some(serde_json::json!({ "version": 1 })));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return every key currently stored, in sorted order.
    pub async fn keys(&self) -> Vec<String> {
        self.data.read().await.keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError> {
        let data = self.data.read().await;
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    async fn set(&self, entries: &Entries) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        for (key, value) in entries {
            data.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), StorageError> {
        self.data.write().await.clear();
        Ok(())
    }
}

/// Hands out one shared [`MemoryBackend`] per store name.
///
/// Versions are tracked per name so upgrade/downgrade rules match the
/// on-disk factories.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    stores: Mutex<HashMap<String, (u32, MemoryBackend)>>,
}

impl MemoryFactory {
    /// Create a factory with no stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the store called `name` if it has been opened.
    #[must_use]
    pub fn store(&self, name: &str) -> Option<MemoryBackend> {
        self.stores.lock().get(name).map(|(_, b)| b.clone())
    }
}

#[async_trait::async_trait]
impl BackendFactory for MemoryFactory {
    async fn open(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Arc<dyn KeyValueBackend>, StorageError> {
        let mut stores = self.stores.lock();
        let entry = stores
            .entry(name.to_owned())
            .or_insert_with(|| (version, MemoryBackend::new()));
        if entry.0 > version {
            return Err(StorageError::VersionMismatch {
                name: name.to_owned(),
                found: entry.0,
                requested: version,
            });
        }
        entry.0 = version;
        let backend: Arc<dyn KeyValueBackend> = Arc::new(entry.1.clone());
        Ok(backend)
    }
}
