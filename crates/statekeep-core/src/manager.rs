//! Persistence manager: the orchestrator over the primary and backup stores.
//!
//! # Locking
//!
//! Every physical write (`set`, `persist`, `reset`) runs under the exclusive
//! side of a [`NamedLock`]; reads (`get`) take the shared side. `update` and
//! `set_metadata` only touch in-memory state and never wait on the lock.
//!
//! # Supersede policy
//!
//! Each `set`/`persist` creates a fresh [`CancellationToken`] and swaps it
//! into a single-slot mailbox, cancelling whatever token was there. A write
//! still queued for the lock when a newer one arrives therefore never runs:
//! only the latest state is written. A write already inside the lock is not
//! affected.
//!
//! # Failure handling
//!
//! Failures inside the locked write section are logged and sent to the
//! [`ExceptionSink`], at most once per failure streak, and are not returned
//! to the caller. Only input errors, backup-open failures other than
//! "mutations disallowed", and the missing-vault condition propagate.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use statekeep_storage::{BackendFactory, KeyValueBackend};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{BACKUP_STORE_NAME, BACKUP_STORE_VERSION, BackupStore};
use crate::error::{MissingVaultError, PersistenceError};
use crate::lock::NamedLock;
use crate::primary::PrimaryStore;
use crate::sink::{ExceptionSink, TracingSink};
use crate::types::{
    BackupRecord, DATA_KEY, MANIFEST_KEY, META_KEY, MetaData, PendingEntries, PendingWrite,
    StateTree, StorageKind, StorageStructure, into_state_tree,
};

/// Mutable bookkeeping owned by the manager.
#[derive(Debug, Default)]
struct ManagerState {
    metadata: Option<MetaData>,
    storage_kind: StorageKind,
    pending: PendingEntries,
    /// Serialized form of the last record written to the backup store.
    last_backup: Option<String>,
    /// Set once a write has entered the locked section.
    initialized: bool,
    /// Error latch: a failure is reported only when this flips to `true`.
    data_persistence_failing: bool,
}

/// Builder for [`PersistenceManager`].
pub struct PersistenceManagerBuilder {
    primary: Arc<dyn KeyValueBackend>,
    backup: Option<Arc<dyn BackendFactory>>,
    backup_name: String,
    backup_version: u32,
    lock: Option<NamedLock>,
    sink: Option<Arc<dyn ExceptionSink>>,
}

impl PersistenceManagerBuilder {
    /// Use `factory` to open the backup store.
    #[must_use]
    pub fn backup(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.backup = Some(factory);
        self
    }

    /// Override the backup store name and schema version.
    #[must_use]
    pub fn backup_store(mut self, name: impl Into<String>, version: u32) -> Self {
        self.backup_name = name.into();
        self.backup_version = version;
        self
    }

    /// Share `lock` with other components instead of creating a private one.
    #[must_use]
    pub fn lock(mut self, lock: NamedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Send swallowed failures to `sink` instead of the tracing default.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn ExceptionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the manager. No I/O happens until the first operation.
    #[must_use]
    pub fn build(self) -> PersistenceManager {
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        PersistenceManager {
            primary: PrimaryStore::new(self.primary, Arc::clone(&sink)),
            backup: self.backup.map(BackupStore::new),
            backup_name: self.backup_name,
            backup_version: self.backup_version,
            lock: self.lock.unwrap_or_default(),
            sink,
            opened: OnceCell::new(),
            state: Mutex::new(ManagerState::default()),
            pending_write: Mutex::new(None),
            retrieved: Mutex::new(None),
        }
    }
}

/// Coordinates reads, writes, migration, and reset across both stores.
pub struct PersistenceManager {
    primary: PrimaryStore,
    backup: Option<BackupStore>,
    backup_name: String,
    backup_version: u32,
    lock: NamedLock,
    sink: Arc<dyn ExceptionSink>,
    /// `Some(true)` once open with a usable backup, `Some(false)` without.
    opened: OnceCell<bool>,
    state: Mutex<ManagerState>,
    /// Token of the most recently submitted write.
    pending_write: Mutex<Option<CancellationToken>>,
    /// Advisory snapshot of the last state read before any own write.
    retrieved: Mutex<Option<StorageStructure>>,
}

impl PersistenceManager {
    /// Start building a manager over `primary`.
    #[must_use]
    pub fn builder(primary: Arc<dyn KeyValueBackend>) -> PersistenceManagerBuilder {
        PersistenceManagerBuilder {
            primary,
            backup: None,
            backup_name: BACKUP_STORE_NAME.to_owned(),
            backup_version: BACKUP_STORE_VERSION,
            lock: None,
            sink: None,
        }
    }

    /// Open the backup store. Idempotent.
    ///
    /// A backup medium that refuses mutations is reported and skipped; the
    /// manager then runs without a backup for the rest of its lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Storage`] for any other open failure. The
    /// next call will try again.
    pub async fn open(&self) -> Result<(), PersistenceError> {
        self.opened
            .get_or_try_init(|| async {
                let Some(backup) = &self.backup else {
                    debug!("no backup store configured");
                    return Ok(false);
                };
                match backup.open(&self.backup_name, self.backup_version).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_mutations_disallowed() => {
                        warn!(error = %e, "backup store unavailable, continuing without backup");
                        self.sink.capture(&PersistenceError::Storage(e));
                        Ok(false)
                    }
                    Err(e) => Err(PersistenceError::Storage(e)),
                }
            })
            .await?;
        Ok(())
    }

    /// Replace the in-memory metadata.
    ///
    /// In split mode the metadata is stamped with the split kind and staged
    /// for the next [`persist`](Self::persist), unless it equals the current
    /// value, in which case this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Serialization`] if the metadata cannot be
    /// encoded for staging.
    pub fn set_metadata(&self, meta: MetaData) -> Result<(), PersistenceError> {
        let mut state = self.state.lock();
        if state.storage_kind == StorageKind::Split {
            let meta = meta.with_storage_kind(StorageKind::Split);
            if state.metadata.as_ref() == Some(&meta) {
                return Ok(());
            }
            state
                .pending
                .insert(META_KEY.to_owned(), PendingWrite::Put(meta_value(&meta)?));
            state.metadata = Some(meta);
        } else {
            state.metadata = Some(meta);
        }
        Ok(())
    }

    /// Overwrite the whole persisted state (monolithic layout only).
    ///
    /// Returns `Ok(())` whether or not the write reached storage; failures
    /// go to the exception sink.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::WrongStorageKind`] in split mode.
    /// - [`PersistenceError::MissingState`] / [`PersistenceError::InvalidState`]
    ///   if `state` is not an object.
    /// - [`PersistenceError::MetadataNotSet`] if no metadata was provided.
    /// - [`PersistenceError::Storage`] if the backup store fails to open.
    pub async fn set(&self, state: Value) -> Result<(), PersistenceError> {
        self.require_kind(StorageKind::Data, "set")?;
        let state = into_state_tree(state)?;
        let meta = self.require_metadata("set")?;

        self.open().await?;
        let token = self.supersede_pending_write();
        let Some(_guard) = self.lock.exclusive(&token).await else {
            debug!(lock = %self.lock.name(), "set superseded by a newer write");
            return Ok(());
        };
        self.state.lock().initialized = true;

        let outcome = self.write_monolithic(&state, &meta).await;
        self.settle(outcome);
        Ok(())
    }

    /// Stage one key for the next [`persist`](Self::persist) (split layout only).
    ///
    /// `None` marks the key for deletion.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::WrongStorageKind`] in monolithic mode.
    /// - [`PersistenceError::ReservedKey`] for keys the layout uses itself.
    pub fn update(&self, key: &str, value: Option<Value>) -> Result<(), PersistenceError> {
        check_state_key(key)?;
        let mut state = self.state.lock();
        if state.storage_kind != StorageKind::Split {
            return Err(PersistenceError::WrongStorageKind {
                operation: "update",
                kind: state.storage_kind,
            });
        }
        state.pending.insert(key.to_owned(), PendingWrite::from(value));
        Ok(())
    }

    /// Write every staged key (split layout only).
    ///
    /// Returns `Ok(())` whether or not the write reached storage. On failure
    /// the staged keys are restored, without overwriting keys updated again
    /// while the write was in flight.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::WrongStorageKind`] in monolithic mode.
    /// - [`PersistenceError::MetadataNotSet`] if no metadata was provided.
    /// - [`PersistenceError::Storage`] if the backup store fails to open.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        self.require_kind(StorageKind::Split, "persist")?;
        self.require_metadata("persist")?;

        self.open().await?;
        let token = self.supersede_pending_write();
        let Some(_guard) = self.lock.exclusive(&token).await else {
            debug!(lock = %self.lock.name(), "persist superseded by a newer write");
            return Ok(());
        };

        let (snapshot, meta) = {
            let mut state = self.state.lock();
            state.initialized = true;
            (std::mem::take(&mut state.pending), state.metadata.clone())
        };
        let outcome = match meta {
            Some(meta) => self.write_split(snapshot, &meta).await,
            None => Err(PersistenceError::MetadataNotSet {
                operation: "persist",
            }),
        };
        self.settle(outcome);
        Ok(())
    }

    /// Read the persisted state.
    ///
    /// With `validate_vault`, a state without a vault is checked against the
    /// backup store: if the backup holds any record, the vault is considered
    /// lost and the call fails with [`MissingVaultError`]. An empty or
    /// unavailable backup is treated as a first run.
    ///
    /// Returns `Ok(None)` when nothing has been stored.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::MissingVault`] on detected vault loss.
    /// - [`PersistenceError::Storage`] / [`PersistenceError::Corrupted`] if
    ///   the primary read fails.
    pub async fn get(
        &self,
        validate_vault: bool,
    ) -> Result<Option<StorageStructure>, PersistenceError> {
        self.open().await?;
        let _guard = self.lock.shared().await;
        let result = self.primary.get().await?;

        if validate_vault && !result.has_vault() {
            if let Some(backup) = self.get_backup().await? {
                if backup.has_any_value() {
                    warn!("persisted state has no vault but the backup store does");
                    return Err(MissingVaultError {
                        backup: Some(backup),
                    }
                    .into());
                }
            }
        }

        if result.is_empty() {
            *self.retrieved.lock() = None;
            return Ok(None);
        }

        let (initialized, kind) = {
            let mut state = self.state.lock();
            state.storage_kind = result
                .meta
                .as_ref()
                .map_or(StorageKind::Data, MetaData::storage_kind);
            (state.initialized, state.storage_kind)
        };
        if !initialized {
            *self.retrieved.lock() = Some(result.clone());
        }
        debug!(storage_kind = %kind, "state retrieved");
        Ok(Some(result))
    }

    /// Clear both stores and every piece of in-memory bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns the first store error; in-memory state is kept in that case.
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        self.open().await?;
        let _guard = self.lock.exclusive_uncancellable().await;

        let backup = self.backup_db();
        let (primary, backup) = tokio::join!(self.primary.reset(), async {
            match backup {
                Some(b) => b.reset().await.map_err(PersistenceError::from),
                None => Ok(()),
            }
        });
        primary?;
        backup?;

        *self.state.lock() = ManagerState::default();
        *self.retrieved.lock() = None;
        info!("persisted state reset");
        Ok(())
    }

    /// Read the backup record without taking the lock.
    ///
    /// Returns `Ok(None)` when no backup store is open.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Storage`] if the backup read fails.
    pub async fn get_backup(&self) -> Result<Option<BackupRecord>, PersistenceError> {
        let Some(backup) = self.backup_db() else {
            return Ok(None);
        };
        Ok(Some(backup.read_record().await?))
    }

    /// Switch from monolithic to split layout and persist `state` key by key.
    ///
    /// A no-op if already split. Must not run concurrently with other writers.
    ///
    /// # Errors
    ///
    /// - [`PersistenceError::MetadataNotSet`] if no metadata was provided.
    /// - Input errors for a malformed `state`.
    pub async fn migrate_to_split_state(&self, state: Value) -> Result<(), PersistenceError> {
        let state: StateTree = into_state_tree(state)?;
        for key in state.keys() {
            check_state_key(key)?;
        }
        {
            let mut current = self.state.lock();
            if current.storage_kind == StorageKind::Split {
                return Ok(());
            }
            let meta = current
                .metadata
                .clone()
                .ok_or(PersistenceError::MetadataNotSet {
                    operation: "migrate_to_split_state",
                })?
                .with_storage_kind(StorageKind::Split);
            let meta_entry = meta_value(&meta)?;

            current.storage_kind = StorageKind::Split;
            current.metadata = Some(meta);
            for (key, value) in state {
                current.pending.insert(key, PendingWrite::Put(value));
            }
            current
                .pending
                .insert(META_KEY.to_owned(), PendingWrite::Put(meta_entry));
            current
                .pending
                .insert(DATA_KEY.to_owned(), PendingWrite::Delete);
        }
        info!("migrating persisted state to split storage");
        self.persist().await
    }

    /// Current storage layout.
    #[must_use]
    pub fn storage_kind(&self) -> StorageKind {
        self.state.lock().storage_kind
    }

    /// Current in-memory metadata.
    #[must_use]
    pub fn metadata(&self) -> Option<MetaData> {
        self.state.lock().metadata.clone()
    }

    /// Keys staged for the next persist.
    #[must_use]
    pub fn pending_writes(&self) -> PendingEntries {
        self.state.lock().pending.clone()
    }

    /// Whether the last write attempt failed.
    #[must_use]
    pub fn data_persistence_failing(&self) -> bool {
        self.state.lock().data_persistence_failing
    }

    /// Whether a write has entered the locked section since start or reset.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Whether the backup store is open and usable.
    #[must_use]
    pub fn is_backup_available(&self) -> bool {
        self.backup_db().is_some()
    }

    /// Advisory snapshot of the state last read before any own write.
    ///
    /// Unsynchronized with writers; use for diagnostics only.
    #[must_use]
    pub fn most_recently_retrieved_state(&self) -> Option<StorageStructure> {
        self.retrieved.lock().clone()
    }

    fn backup_db(&self) -> Option<&BackupStore> {
        match self.opened.get() {
            Some(true) => self.backup.as_ref(),
            _ => None,
        }
    }

    fn require_kind(
        &self,
        expected: StorageKind,
        operation: &'static str,
    ) -> Result<(), PersistenceError> {
        let kind = self.state.lock().storage_kind;
        if kind == expected {
            Ok(())
        } else {
            Err(PersistenceError::WrongStorageKind { operation, kind })
        }
    }

    fn require_metadata(&self, operation: &'static str) -> Result<MetaData, PersistenceError> {
        self.state
            .lock()
            .metadata
            .clone()
            .ok_or(PersistenceError::MetadataNotSet { operation })
    }

    /// Swap a fresh token into the mailbox and cancel the previous one.
    fn supersede_pending_write(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.pending_write.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    async fn write_monolithic(
        &self,
        state: &StateTree,
        meta: &MetaData,
    ) -> Result<(), PersistenceError> {
        self.primary.set(state, meta).await?;
        let record = BackupRecord::from_state(state, meta);
        if record.has_vault() {
            self.write_backup(&record).await?;
        }
        Ok(())
    }

    async fn write_split(
        &self,
        snapshot: PendingEntries,
        meta: &MetaData,
    ) -> Result<(), PersistenceError> {
        if snapshot.is_empty() {
            debug!("no pending writes to persist");
            return Ok(());
        }
        if let Err(e) = self.primary.set_key_values(&snapshot).await {
            let mut state = self.state.lock();
            for (key, write) in snapshot {
                // Newer intent staged during the write wins.
                state.pending.entry(key).or_insert(write);
            }
            return Err(e);
        }
        if let Some(record) = BackupRecord::from_pending(&snapshot, meta) {
            self.write_backup(&record).await?;
        }
        Ok(())
    }

    async fn write_backup(&self, record: &BackupRecord) -> Result<(), PersistenceError> {
        let Some(backup) = self.backup_db() else {
            return Ok(());
        };
        let entries = record.entries()?;
        let fingerprint = record.fingerprint()?;
        let unchanged = self.state.lock().last_backup.as_deref() == Some(fingerprint.as_str());
        if unchanged {
            debug!("backup record unchanged, skipping write");
            return Ok(());
        }
        backup.set(&entries).await?;
        self.state.lock().last_backup = Some(fingerprint);
        Ok(())
    }

    /// Update the error latch and report the first failure of a streak.
    fn settle(&self, outcome: Result<(), PersistenceError>) {
        let report = {
            let mut state = self.state.lock();
            match outcome {
                Ok(()) => {
                    state.data_persistence_failing = false;
                    None
                }
                Err(e) => {
                    error!(error = %e, "failed to persist state");
                    let first = !state.data_persistence_failing;
                    state.data_persistence_failing = true;
                    first.then_some(e)
                }
            }
        };
        if let Some(e) = report {
            self.sink.capture(&e);
        }
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("lock", &self.lock.name())
            .field("backup_name", &self.backup_name)
            .finish_non_exhaustive()
    }
}

fn meta_value(meta: &MetaData) -> Result<Value, PersistenceError> {
    serde_json::to_value(meta).map_err(|e| PersistenceError::Serialization {
        what: "metadata".to_owned(),
        reason: e.to_string(),
    })
}

/// Keys the split layout reserves for its own bookkeeping.
fn check_state_key(key: &str) -> Result<(), PersistenceError> {
    if [MANIFEST_KEY, DATA_KEY, META_KEY].contains(&key) {
        Err(PersistenceError::ReservedKey {
            key: key.to_owned(),
        })
    } else {
        Ok(())
    }
}
