//! Error types for `statekeep-core`.
//!
//! Only input errors and the missing-vault condition are meant to reach an
//! interactive caller. Write failures inside `set`/`persist` are logged and
//! sent to the [`ExceptionSink`](crate::sink::ExceptionSink) instead of
//! being returned.

use statekeep_storage::StorageError;

use crate::types::{BackupRecord, StorageKind};

/// The primary store lost its vault while the backup still remembers one.
///
/// Carries the backup payload so the caller can drive a recovery flow.
#[derive(Debug, Clone, thiserror::Error)]
#[error("vault is missing from persisted state but the backup store holds a prior record")]
pub struct MissingVaultError {
    /// What the backup store held when the loss was detected.
    pub backup: Option<BackupRecord>,
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// `set` was called without a state tree.
    #[error("state is missing")]
    MissingState,

    /// The state tree was not a JSON object.
    #[error("state must be a JSON object, got {found}")]
    InvalidState { found: &'static str },

    /// A write was attempted before any metadata was provided.
    #[error("metadata must be set before calling {operation}")]
    MetadataNotSet { operation: &'static str },

    /// The operation does not apply to the current storage layout.
    #[error("cannot call {operation} while storage kind is '{kind}'")]
    WrongStorageKind {
        operation: &'static str,
        kind: StorageKind,
    },

    /// The key is used by the storage layout itself.
    #[error("'{key}' is a reserved storage key")]
    ReservedKey { key: String },

    /// Vault loss detected during a validating read.
    #[error(transparent)]
    MissingVault(#[from] MissingVaultError),

    /// A stored value had an unexpected shape.
    #[error("stored value for '{key}' is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    /// A value could not be serialized.
    #[error("failed to serialize {what}: {reason}")]
    Serialization { what: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("persistence storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PersistenceError {
    /// The backup payload, if this is a missing-vault error.
    #[must_use]
    pub fn backup(&self) -> Option<&BackupRecord> {
        match self {
            Self::MissingVault(e) => e.backup.as_ref(),
            _ => None,
        }
    }
}
