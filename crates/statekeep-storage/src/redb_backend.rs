//! Pure-Rust redb storage backend.
//!
//! The default on-disk medium. Every value is stored as its JSON encoding in
//! a single table called `store`; multi-key writes share one write
//! transaction, so a batch is either fully visible or not at all.
//!
//! A second table, `meta`, records the schema version used by
//! [`RedbFactory`] to decide whether the upgrade step has to run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{BackendFactory, Entries, KeyValueBackend, StorageError, unique_keys};

/// The single logical table holding all key-value data.
const STORE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("store");

/// Schema bookkeeping: `version -> u32`.
const META_TABLE: TableDefinition<&str, u32> = TableDefinition::new("meta");

const VERSION_KEY: &str = "version";

/// A storage backend backed by redb (pure Rust, B-tree based).
///
/// The database handle can be closed and reopened; operations on a closed
/// handle fail with [`StorageError::ConnectionClosed`]. Blocking redb calls
/// are offloaded to the Tokio blocking thread pool.
///
/// # Examples
///
/// ```no_run
/// # use statekeep_storage::RedbBackend;
/// let backend = RedbBackend::open("/var/lib/statekeep/primary.redb").unwrap();
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<RwLock<Option<Arc<Database>>>>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbBackend {
    /// Open or create a redb database at the given path.
    ///
    /// # Errors
    ///
    /// - [`StorageError::MutationsDisallowed`] if the file cannot be written.
    /// - [`StorageError::Open`] if redb fails to open or create the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = create_database(path)?;

        // Opening the table in a write txn creates it if missing.
        let txn = db.begin_write().map_err(|e| StorageError::Transaction {
            reason: e.to_string(),
        })?;
        {
            let _table = txn
                .open_table(STORE_TABLE)
                .map_err(|e| StorageError::MissingTable {
                    name: format!("store: {e}"),
                })?;
        }
        txn.commit().map_err(|e| StorageError::Transaction {
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(RwLock::new(Some(Arc::new(db)))),
            path: path.to_path_buf(),
        })
    }

    /// Drop the database handle. Later operations fail with
    /// [`StorageError::ConnectionClosed`] until [`reopen`](KeyValueBackend::reopen).
    pub async fn close(&self) {
        self.db.write().await.take();
    }

    /// Bring the schema up to `version`, running the upgrade step if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::VersionMismatch`] if the file is already at a
    /// newer version, or a transaction error if the upgrade fails.
    pub async fn ensure_version(&self, name: &str, version: u32) -> Result<(), StorageError> {
        let db = self.handle("upgrade").await?;
        let name = name.to_owned();
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })?;
            {
                let mut meta = txn
                    .open_table(META_TABLE)
                    .map_err(|e| StorageError::MissingTable {
                        name: format!("meta: {e}"),
                    })?;
                let found = meta
                    .get(VERSION_KEY)
                    .map_err(|e| StorageError::Read {
                        key: VERSION_KEY.to_owned(),
                        reason: e.to_string(),
                    })?
                    .map_or(0, |v| v.value());

                if found > version {
                    return Err(StorageError::VersionMismatch {
                        name,
                        found,
                        requested: version,
                    });
                }
                if found < version {
                    // Upgrade step: the store table must exist afterwards.
                    let _store =
                        txn.open_table(STORE_TABLE)
                            .map_err(|e| StorageError::MissingTable {
                                name: format!("store: {e}"),
                            })?;
                    meta.insert(VERSION_KEY, version)
                        .map_err(|e| StorageError::Write {
                            key: VERSION_KEY.to_owned(),
                            reason: e.to_string(),
                        })?;
                    info!(store = %name, from = found, to = version, "upgraded store schema");
                }
            }
            txn.commit().map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Transaction {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn handle(&self, operation: &str) -> Result<Arc<Database>, StorageError> {
        self.db
            .read()
            .await
            .clone()
            .ok_or_else(|| StorageError::ConnectionClosed {
                operation: operation.to_owned(),
            })
    }
}

fn create_database(path: &Path) -> Result<Database, StorageError> {
    Database::create(path).map_err(|e| {
        if let redb::DatabaseError::Storage(redb::StorageError::Io(io)) = &e {
            if io.kind() == std::io::ErrorKind::PermissionDenied {
                return StorageError::MutationsDisallowed {
                    name: path.display().to_string(),
                    reason: io.to_string(),
                };
            }
        }
        StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })
}

fn decode(key: &str, bytes: &[u8]) -> Result<Value, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

/// Read every key in one read transaction, one result per key.
fn read_keys(
    db: &Database,
    keys: &[String],
) -> Result<Vec<Result<Option<Value>, StorageError>>, StorageError> {
    let txn = db.begin_read().map_err(|e| StorageError::Transaction {
        reason: e.to_string(),
    })?;
    let table = txn
        .open_table(STORE_TABLE)
        .map_err(|e| StorageError::MissingTable {
            name: format!("store: {e}"),
        })?;

    let values = keys
        .iter()
        .map(|key| -> Result<Option<Value>, StorageError> {
            let guard = table.get(key.as_str()).map_err(|e| StorageError::Read {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            guard.map(|v| decode(key, v.value())).transpose()
        })
        .collect();
    Ok(values)
}

#[async_trait::async_trait]
impl KeyValueBackend for RedbBackend {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError> {
        self.read_each(keys).await?.into_iter().collect()
    }

    async fn read_each(
        &self,
        keys: &[String],
    ) -> Result<Vec<Result<Option<Value>, StorageError>>, StorageError> {
        let db = self.handle("get").await?;
        let keys = keys.to_vec();
        tokio::task::spawn_blocking(move || read_keys(&db, &keys))
            .await
            .map_err(|e| StorageError::Read {
                key: String::new(),
                reason: format!("blocking task panicked: {e}"),
            })?
    }

    async fn set(&self, entries: &Entries) -> Result<(), StorageError> {
        // Encode before opening the transaction so a bad value writes nothing.
        let encoded = entries
            .iter()
            .map(|(key, value)| {
                serde_json::to_vec(value)
                    .map(|bytes| (key.clone(), bytes))
                    .map_err(|e| StorageError::Serialization {
                        key: key.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let db = self.handle("set").await?;
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })?;
            {
                let mut table =
                    txn.open_table(STORE_TABLE)
                        .map_err(|e| StorageError::MissingTable {
                            name: format!("store: {e}"),
                        })?;
                for (key, bytes) in &encoded {
                    table
                        .insert(key.as_str(), bytes.as_slice())
                        .map_err(|e| StorageError::Write {
                            key: key.clone(),
                            reason: e.to_string(),
                        })?;
                }
            }
            txn.commit().map_err(|e| StorageError::Transaction {
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
        let db = self.handle("remove").await?;
        let keys = unique_keys(keys);
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })?;
            {
                let mut table =
                    txn.open_table(STORE_TABLE)
                        .map_err(|e| StorageError::MissingTable {
                            name: format!("store: {e}"),
                        })?;
                for key in &keys {
                    // remove() returns Ok(None) for absent keys.
                    table
                        .remove(key.as_str())
                        .map_err(|e| StorageError::Delete {
                            key: key.clone(),
                            reason: e.to_string(),
                        })?;
                }
            }
            txn.commit().map_err(|e| StorageError::Transaction {
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
        let db = self.handle("reset").await?;
        tokio::task::spawn_blocking(move || {
            let txn = db.begin_write().map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })?;
            txn.delete_table(STORE_TABLE)
                .map_err(|e| StorageError::MissingTable {
                    name: format!("store: {e}"),
                })?;
            {
                let _table =
                    txn.open_table(STORE_TABLE)
                        .map_err(|e| StorageError::MissingTable {
                            name: format!("store: {e}"),
                        })?;
            }
            txn.commit().map_err(|e| StorageError::Transaction {
                reason: e.to_string(),
            })
        })
        .await
        .map_err(|e| StorageError::Transaction {
            reason: format!("blocking task panicked: {e}"),
        })?
    }

    async fn reopen(&self) -> Result<(), StorageError> {
        let mut guard = self.db.write().await;
        // Release the old handle first; redb refuses a second open of one file.
        guard.take();
        let path = self.path.clone();
        let db = tokio::task::spawn_blocking(move || create_database(&path))
            .await
            .map_err(|e| StorageError::Open {
                path: self.path.display().to_string(),
                reason: format!("blocking task panicked: {e}"),
            })??;
        debug!(path = %self.path.display(), "reopened redb database");
        *guard = Some(Arc::new(db));
        Ok(())
    }
}

/// Opens one redb file per store name under a directory.
///
/// Open handles are cached, so opening the same name twice returns the same
/// database instead of tripping redb's single-open file lock.
#[derive(Debug)]
pub struct RedbFactory {
    dir: PathBuf,
    open: Mutex<HashMap<String, RedbBackend>>,
}

impl RedbFactory {
    /// Create a factory rooted at `dir`. The directory is created on first open.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Return the file path used for the store called `name`.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.redb"))
    }
}

#[async_trait::async_trait]
impl BackendFactory for RedbFactory {
    async fn open(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Arc<dyn KeyValueBackend>, StorageError> {
        let mut open = self.open.lock().await;
        let backend = if let Some(existing) = open.get(name) {
            existing.clone()
        } else {
            tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    StorageError::MutationsDisallowed {
                        name: name.to_owned(),
                        reason: e.to_string(),
                    }
                } else {
                    StorageError::Open {
                        path: self.dir.display().to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;
            let path = self.path_for(name);
            let backend = tokio::task::spawn_blocking(move || RedbBackend::open(path))
                .await
                .map_err(|e| StorageError::Open {
                    path: self.dir.display().to_string(),
                    reason: format!("blocking task panicked: {e}"),
                })??;
            open.insert(name.to_owned(), backend.clone());
            backend
        };

        backend.ensure_version(name, version).await?;
        let backend: Arc<dyn KeyValueBackend> = Arc::new(backend);
        Ok(backend)
    }
}
