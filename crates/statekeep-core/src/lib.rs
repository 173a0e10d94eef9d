//! Core library for `statekeep`.
//!
//! Contains the persistence manager, the manifest-tracked primary store, the
//! independent vault backup, the named state lock, and the exception sink.
//! This crate depends on `statekeep-storage` for the backend traits and
//! knows nothing about specific on-disk mediums.

pub mod backup;
pub mod error;
pub mod lock;
pub mod manager;
pub mod manifest;
pub mod primary;
pub mod sink;
pub mod types;

pub use error::{MissingVaultError, PersistenceError};
pub use lock::NamedLock;
pub use manager::{PersistenceManager, PersistenceManagerBuilder};
pub use sink::{ExceptionSink, TracingSink};
pub use types::{BackupRecord, MetaData, StateTree, StorageKind, StorageStructure};
