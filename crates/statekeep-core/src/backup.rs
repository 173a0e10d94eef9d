//! Independent backup store for the recovery record.
//!
//! The backup lives on its own medium, opened through a [`BackendFactory`],
//! so a primary-store outage cannot take it down. It only ever holds the
//! fixed [`BACKED_UP_KEYS`] plus `meta`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use statekeep_storage::{BackendFactory, Entries, KeyValueBackend, StorageError, unique_keys};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::types::{APP_METADATA_CONTROLLER, BACKED_UP_KEYS, BackupRecord, KEYRING_CONTROLLER, META_KEY};

/// Default name of the backup store.
pub const BACKUP_STORE_NAME: &str = "state-backup";

/// Schema version of the backup store.
pub const BACKUP_STORE_VERSION: u32 = 1;

/// Adapter over the backup medium.
pub struct BackupStore {
    factory: Arc<dyn BackendFactory>,
    db: OnceCell<Arc<dyn KeyValueBackend>>,
}

impl BackupStore {
    /// Create an unopened backup store.
    #[must_use]
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            db: OnceCell::new(),
        }
    }

    /// Open the store. Returns immediately if it is already open.
    ///
    /// # Errors
    ///
    /// Propagates the factory error, including
    /// [`StorageError::MutationsDisallowed`].
    pub async fn open(&self, name: &str, version: u32) -> Result<(), StorageError> {
        self.db
            .get_or_try_init(|| async {
                debug!(store = %name, version, "opening backup store");
                self.factory.open(name, version).await
            })
            .await?;
        Ok(())
    }

    /// Whether [`open`](Self::open) has succeeded.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.db.initialized()
    }

    /// Read `keys`, preserving order and duplicates.
    ///
    /// The physical read is deduplicated. Keys that are missing, or whose
    /// element failed to read, come back as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or the read as a whole fails.
    pub async fn get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError> {
        let db = self.db()?;
        let unique = unique_keys(keys);
        let results = db.read_each(&unique).await?;

        let by_key: HashMap<String, Option<Value>> = unique
            .into_iter()
            .zip(results)
            .map(|(key, result)| {
                let value = result.unwrap_or_else(|e| {
                    debug!(key = %key, error = %e, "backup element unreadable, treating as absent");
                    None
                });
                (key, value)
            })
            .collect();

        Ok(keys
            .iter()
            .map(|k| by_key.get(k).cloned().flatten())
            .collect())
    }

    /// Write every pair in one transaction.
    ///
    /// # Errors
    ///
    /// Returns the underlying error unchanged, including serialization
    /// failures.
    pub async fn set(&self, entries: &Entries) -> Result<(), StorageError> {
        self.db()?.set(entries).await
    }

    /// Remove keys in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or the removal fails.
    pub async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        self.db()?.remove(keys).await
    }

    /// Clear the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or the reset fails.
    pub async fn reset(&self) -> Result<(), StorageError> {
        self.db()?.reset().await
    }

    /// Read the recognised keys and assemble a [`BackupRecord`].
    ///
    /// Fields that are absent or undecodable are left empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not open or the read fails.
    pub async fn read_record(&self) -> Result<BackupRecord, StorageError> {
        let mut keys: Vec<String> = BACKED_UP_KEYS.iter().map(|k| (*k).to_owned()).collect();
        keys.push(META_KEY.to_owned());

        let mut values: HashMap<String, Value> = keys
            .iter()
            .cloned()
            .zip(self.get(&keys).await?)
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();

        let meta = values.remove(META_KEY).and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| debug!(error = %e, "backup metadata undecodable, ignoring"))
                .ok()
        });
        Ok(BackupRecord {
            keyring_controller: values.remove(KEYRING_CONTROLLER),
            app_metadata_controller: values.remove(APP_METADATA_CONTROLLER),
            meta,
        })
    }

    fn db(&self) -> Result<&Arc<dyn KeyValueBackend>, StorageError> {
        self.db.get().ok_or_else(|| StorageError::ConnectionClosed {
            operation: "backup store not opened".to_owned(),
        })
    }
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use statekeep_storage::MemoryFactory;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    async fn open_store() -> (Arc<MemoryFactory>, BackupStore) {
        let factory = Arc::new(MemoryFactory::new());
        let store = BackupStore::new(Arc::clone(&factory) as Arc<dyn BackendFactory>);
        store.open(BACKUP_STORE_NAME, BACKUP_STORE_VERSION).await.unwrap();
        (factory, store)
    }

    #[tokio::test]
    async fn unopened_store_rejects_reads() {
        let store = BackupStore::new(Arc::new(MemoryFactory::new()));
        assert!(!store.is_open());
        assert!(store.get(&keys(&["meta"])).await.is_err());
    }

    #[tokio::test]
    async fn open_twice_is_idempotent() {
        let (_factory, store) = open_store().await;
        store.open(BACKUP_STORE_NAME, BACKUP_STORE_VERSION).await.unwrap();
        assert!(store.is_open());
    }

    #[tokio::test]
    async fn get_preserves_duplicates_and_order() {
        let (_factory, store) = open_store().await;
        let mut entries = Entries::new();
        entries.insert("a".to_owned(), json!(1));
        store.set(&entries).await.unwrap();

        let values = store.get(&keys(&["a", "missing", "a"])).await.unwrap();
        assert_eq!(values, vec![Some(json!(1)), None, Some(json!(1))]);
    }

    #[tokio::test]
    async fn read_record_assembles_recognised_keys() {
        let (factory, store) = open_store().await;
        let record = BackupRecord {
            keyring_controller: Some(json!({"vault": "cipher"})),
            app_metadata_controller: None,
            meta: Some(crate::types::MetaData::new(7)),
        };
        store.set(&record.entries().unwrap()).await.unwrap();

        let mut unrelated = Entries::new();
        unrelated.insert("Other".to_owned(), json!(true));
        let raw = factory.store(BACKUP_STORE_NAME).unwrap();
        raw.set(&unrelated).await.unwrap();

        assert_eq!(store.read_record().await.unwrap(), record);
    }

    #[tokio::test]
    async fn reset_empties_record() {
        let (_factory, store) = open_store().await;
        let mut entries = Entries::new();
        entries.insert(KEYRING_CONTROLLER.to_owned(), json!({"vault": "x"}));
        store.set(&entries).await.unwrap();

        store.reset().await.unwrap();
        assert!(!store.read_record().await.unwrap().has_any_value());
    }
}
