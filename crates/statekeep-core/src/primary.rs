//! Manifest-tracked primary store.
//!
//! Wraps a [`KeyValueBackend`] holding the bulk application state. The
//! adapter only ever touches keys listed in its [`Manifest`] (or, for
//! installs that predate the manifest, the fixed `data`/`meta` pair), so it
//! can share a medium with unrelated data.
//!
//! Every backend call goes through a retry-once policy: a
//! [`StorageError::ConnectionClosed`] triggers a reopen and a single retry of
//! the same operation.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use statekeep_storage::{Entries, KeyValueBackend, StorageError};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::PersistenceError;
use crate::manifest::Manifest;
use crate::sink::ExceptionSink;
use crate::types::{
    DATA_KEY, MANIFEST_KEY, META_KEY, MetaData, PendingEntries, PendingWrite, StateTree,
    StorageKind, StorageStructure,
};

/// The primary store adapter.
pub struct PrimaryStore {
    backend: Arc<dyn KeyValueBackend>,
    sink: Arc<dyn ExceptionSink>,
    /// `None` until first loaded from the backend.
    manifest: Mutex<Option<Manifest>>,
}

impl PrimaryStore {
    /// Wrap `backend`. The manifest is loaded lazily on first use.
    #[must_use]
    pub fn new(backend: Arc<dyn KeyValueBackend>, sink: Arc<dyn ExceptionSink>) -> Self {
        Self {
            backend,
            sink,
            manifest: Mutex::new(None),
        }
    }

    /// Read the stored state.
    ///
    /// Returns an empty [`StorageStructure`] when nothing has been stored.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::Storage`] if the backend read fails.
    /// - [`PersistenceError::Corrupted`] if the manifest or metadata is malformed.
    pub async fn get(&self) -> Result<StorageStructure, PersistenceError> {
        let manifest = self.load_manifest().await?;
        let keys: Vec<String> = manifest.keys().map(str::to_owned).collect();
        *self.manifest.lock().await = Some(manifest);

        let values = self.retry_once("get", |b| {
            let keys = keys.clone();
            async move { b.get(&keys).await }
        })
        .await?;

        let mut found: Entries = keys
            .into_iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();

        let meta = found
            .remove(META_KEY)
            .map(|v| {
                serde_json::from_value::<MetaData>(v).map_err(|e| PersistenceError::Corrupted {
                    key: META_KEY.to_owned(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let data = if meta.as_ref().map(MetaData::storage_kind) == Some(StorageKind::Split) {
            found.remove(DATA_KEY);
            (!found.is_empty()).then(|| found.into_iter().collect::<StateTree>())
        } else {
            match found.remove(DATA_KEY) {
                None => None,
                Some(Value::Object(map)) => Some(map),
                Some(_) => {
                    return Err(PersistenceError::Corrupted {
                        key: DATA_KEY.to_owned(),
                        reason: "expected an object".to_owned(),
                    });
                }
            }
        };

        Ok(StorageStructure { data, meta })
    }

    /// Overwrite the whole state in monolithic layout.
    ///
    /// Writes `data` and `meta` in one transaction and tracks both keys.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Storage`] if the write fails.
    pub async fn set(&self, data: &StateTree, meta: &MetaData) -> Result<(), PersistenceError> {
        let meta_value = serde_json::to_value(meta).map_err(|e| PersistenceError::Serialization {
            what: "metadata".to_owned(),
            reason: e.to_string(),
        })?;
        let mut entries = Entries::new();
        entries.insert(DATA_KEY.to_owned(), Value::Object(data.clone()));
        entries.insert(META_KEY.to_owned(), meta_value);

        let mut slot = self.manifest.lock().await;
        let mut manifest = match slot.clone() {
            Some(m) => m,
            None => self.load_manifest().await?,
        };
        self.retry_once("set", |b| {
            let entries = entries.clone();
            async move { b.set(&entries).await }
        })
        .await?;
        manifest.insert(DATA_KEY);
        manifest.insert(META_KEY);
        *slot = Some(manifest);
        Ok(())
    }

    /// Apply a batch of per-key writes and removals.
    ///
    /// Removals of keys absent from the manifest are skipped with a warning.
    /// When key membership changes, the new manifest is written in the same
    /// transaction as the data. Removals run afterwards; their failure is
    /// logged and reported but does not fail the call.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Storage`] if the data write fails. The
    /// in-memory manifest is left unchanged in that case.
    pub async fn set_key_values(&self, pending: &PendingEntries) -> Result<(), PersistenceError> {
        let mut slot = self.manifest.lock().await;
        let current = match slot.as_ref() {
            Some(m) => m.clone(),
            None => {
                let loaded = self.load_manifest().await?;
                *slot = Some(loaded.clone());
                loaded
            }
        };

        let mut next = current.clone();
        let mut to_write = Entries::new();
        let mut to_remove = Vec::new();
        for (key, write) in pending {
            match write {
                PendingWrite::Put(value) => {
                    to_write.insert(key.clone(), value.clone());
                    next.insert(key.as_str());
                }
                PendingWrite::Delete if current.contains(key) => {
                    to_remove.push(key.clone());
                    next.remove(key);
                }
                PendingWrite::Delete => {
                    warn!(key = %key, "skipping removal of key not tracked in manifest");
                }
            }
        }

        if next != current {
            to_write.insert(MANIFEST_KEY.to_owned(), next.to_value());
        }

        if !to_write.is_empty() {
            self.retry_once("set", |b| {
                let entries = to_write.clone();
                async move { b.set(&entries).await }
            })
            .await?;
        }
        *slot = Some(next);
        drop(slot);

        if !to_remove.is_empty() {
            let removed = self
                .retry_once("remove", |b| {
                    let keys = to_remove.clone();
                    async move { b.remove(&keys).await }
                })
                .await;
            if let Err(e) = removed {
                error!(keys = ?to_remove, error = %e, "failed to remove keys after write");
                self.sink.capture(&PersistenceError::Storage(e));
            }
        }
        Ok(())
    }

    /// Remove the manifest key and every key it lists.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Storage`] if the removal fails.
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        let mut slot = self.manifest.lock().await;
        let manifest = match slot.clone() {
            Some(m) => m,
            None => self.load_manifest().await?,
        };
        let mut keys: Vec<String> = manifest.keys().map(str::to_owned).collect();
        keys.push(MANIFEST_KEY.to_owned());

        self.retry_once("reset", |b| {
            let keys = keys.clone();
            async move { b.remove(&keys).await }
        })
        .await?;
        *slot = Some(Manifest::new());
        Ok(())
    }

    /// Read the manifest key, falling back to the legacy `data`/`meta` pair.
    async fn load_manifest(&self) -> Result<Manifest, PersistenceError> {
        let stored = self
            .retry_once("get", |b| async move { b.get(&[MANIFEST_KEY.to_owned()]).await })
            .await?;
        if let Some(Some(value)) = stored.into_iter().next() {
            return Manifest::from_value(&value);
        }

        let legacy = [DATA_KEY.to_owned(), META_KEY.to_owned()];
        let values = self
            .retry_once("get", |b| {
                let keys = legacy.clone();
                async move { b.get(&keys).await }
            })
            .await?;
        let manifest: Manifest = legacy
            .iter()
            .zip(values)
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        debug!(keys = manifest.len(), "adopted legacy keys into manifest");
        Ok(manifest)
    }

    async fn retry_once<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<dyn KeyValueBackend>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        match op(Arc::clone(&self.backend)).await {
            Err(e) if e.is_connection_closed() => {
                warn!(operation, error = %e, "primary store connection closed, reopening");
                self.backend.reopen().await?;
                op(Arc::clone(&self.backend)).await
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for PrimaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryStore").finish_non_exhaustive()
    }
}
