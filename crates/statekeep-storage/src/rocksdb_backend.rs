//! `RocksDB` storage backend.
//!
//! Wraps the `rocksdb` crate behind the [`KeyValueBackend`] trait. All
//! operations are dispatched to a blocking thread via
//! [`tokio::task::spawn_blocking`] since `RocksDB` is a synchronous C++ library.
//!
//! Multi-key writes and removals go through a single `WriteBatch`, which
//! `RocksDB` applies atomically.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde_json::Value;

use crate::{Entries, KeyValueBackend, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

/// A storage backend backed by `RocksDB`.
///
/// Thread-safe (`Arc<DB>` internally) and safe to share across async tasks.
///
/// # Examples
///
/// ```no_run
/// # use statekeep_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/statekeep/primary").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open a `RocksDB` database at the given path.
    ///
    /// Creates the database directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` fails to open or create the
    /// database at the specified path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }
}

#[async_trait::async_trait]
impl KeyValueBackend for RocksDbBackend {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError> {
        let db = Arc::clone(&self.db);
        let keys = keys.to_vec();
        tokio::task::spawn_blocking(move || {
            keys.iter()
                .map(|key| -> Result<Option<Value>, StorageError> {
                    let bytes = db.get(key.as_bytes()).map_err(|e| StorageError::Read {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                    bytes
                        .map(|b| {
                            serde_json::from_slice(&b).map_err(|e| StorageError::Serialization {
                                key: key.clone(),
                                reason: e.to_string(),
                            })
                        })
                        .transpose()
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| StorageError::Read {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn set(&self, entries: &Entries) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            let bytes = serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            batch.put(key.as_bytes(), bytes);
        }

        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            db.write(batch).map_err(|e| StorageError::Write {
                key: "<batch>".to_owned(),
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Write {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key.as_bytes());
        }

        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            db.write(batch).map_err(|e| StorageError::Delete {
                key: "<batch>".to_owned(),
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Delete {
            key: String::new(),
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn reset(&self) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut batch = WriteBatch::default();
            for item in db.iterator(IteratorMode::Start) {
                let (k, _) = item.map_err(|e| StorageError::Transaction {
                    reason: e.to_string(),
                })?;
                batch.delete(k);
            }
            db.write(batch).map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Transaction {
            reason: format!("blocking task panicked: {e}"),
        })?
    }
}
