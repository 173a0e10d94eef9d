//! Key-value backend abstraction for `statekeep`.
//!
//! This crate defines the [`KeyValueBackend`] trait, a pure key-value
//! storage interface that knows nothing about wallet state, manifests, or
//! backups. The persistence layer in `statekeep-core` wraps a backend to add
//! manifest tracking, retries, and backup semantics.
//!
//! Three implementations are provided:
//!
//! - [`RedbBackend`]: pure-Rust, transactional, the default on-disk medium (feature `redb-backend`)
//! - [`RocksDbBackend`]: backed by `RocksDB` (feature `rocksdb-backend`)
//! - [`MemoryBackend`]: in-memory, for tests and development
//!
//! Named, versioned stores are opened through a [`BackendFactory`].

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

pub use error::StorageError;
pub use memory::{MemoryBackend, MemoryFactory};
#[cfg(feature = "redb-backend")]
pub use redb_backend::{RedbBackend, RedbFactory};
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// A batch of key/value pairs written in one physical transaction.
pub type Entries = BTreeMap<String, Value>;

/// A pluggable key-value storage backend.
///
/// Keys are arbitrary UTF-8 strings. Values are JSON documents; on-disk
/// mediums store their serialized form.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait KeyValueBackend: Send + Sync + 'static {
    /// Read one value per input key, preserving order and duplicates.
    ///
    /// Missing keys yield `None`. A backend-level failure fails the whole
    /// call; nothing is partially returned.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] (or a transaction error) if the
    /// underlying medium fails.
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<Value>>, StorageError>;

    /// Read one result per input key, reporting per-element failures.
    ///
    /// The default implementation delegates to [`get`](KeyValueBackend::get).
    /// Transactional backends override this so that one undecodable value
    /// does not hide the others.
    ///
    /// # Errors
    ///
    /// Returns an error only when the read as a whole could not be started.
    async fn read_each(
        &self,
        keys: &[String],
    ) -> Result<Vec<Result<Option<Value>, StorageError>>, StorageError> {
        Ok(self.get(keys).await?.into_iter().map(Ok).collect())
    }

    /// Write every pair in a single physical transaction.
    ///
    /// Reads issued after this call completes observe all pairs.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] or [`StorageError::Serialization`] if
    /// any pair cannot be stored; in that case none of them are.
    async fn set(&self, entries: &Entries) -> Result<(), StorageError>;

    /// Delete keys. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying medium fails.
    async fn remove(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Clear every key owned by this logical store.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium fails.
    async fn reset(&self) -> Result<(), StorageError>;

    /// Re-establish a connection after [`StorageError::ConnectionClosed`].
    ///
    /// The default is a no-op for mediums that cannot lose their connection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the medium cannot be reopened.
    async fn reopen(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Opens named, versioned stores.
///
/// Opening a store at a version higher than the one recorded runs its
/// upgrade step, which creates the single logical table if it is missing.
#[async_trait::async_trait]
pub trait BackendFactory: Send + Sync + 'static {
    /// Open (creating or upgrading if needed) the store called `name`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::MutationsDisallowed`] if the medium is read-only here.
    /// - [`StorageError::VersionMismatch`] if the store is newer than `version`.
    /// - [`StorageError::Open`] for any other failure.
    async fn open(&self, name: &str, version: u32)
    -> Result<Arc<dyn KeyValueBackend>, StorageError>;
}

/// Return the deduplicated keys of `keys`, in first-seen order.
#[must_use]
pub fn unique_keys(keys: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|k| seen.insert(k.as_str()))
        .cloned()
        .collect()
}
