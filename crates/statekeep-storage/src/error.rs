//! Storage error types.
//!
//! Every variant carries enough context to diagnose the failure from a log
//! line alone. Two variants are load-bearing for the layers above:
//! [`StorageError::ConnectionClosed`] is retried once by the primary adapter,
//! and [`StorageError::MutationsDisallowed`] downgrades the backup store to
//! "unavailable" instead of failing startup.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open the storage medium at the given location.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Failed to read a value from storage.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// Failed to write a value to storage.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// Failed to delete a key from storage.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// A required table was not found.
    #[error("missing table '{name}'")]
    MissingTable { name: String },

    /// Failed to begin or commit a transaction.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A storage key contained invalid UTF-8.
    #[error("invalid key encoding: {reason}")]
    InvalidKey { reason: String },

    /// A value could not be encoded for storage or decoded after a read.
    #[error("failed to serialize value for key '{key}': {reason}")]
    Serialization { key: String, reason: String },

    /// The underlying connection was closed while an operation was in flight.
    #[error("storage connection closed during {operation}")]
    ConnectionClosed { operation: String },

    /// The medium refuses writes in the current context.
    #[error("storage '{name}' does not allow mutations: {reason}")]
    MutationsDisallowed { name: String, reason: String },

    /// The on-disk schema is newer than the version requested by the caller.
    #[error("storage '{name}' is at version {found}, cannot open at version {requested}")]
    VersionMismatch {
        name: String,
        found: u32,
        requested: u32,
    },
}

impl StorageError {
    /// Whether this error signals a connection that was closed concurrently
    /// and may succeed after a reopen.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }

    /// Whether this error means the medium is read-only in this context.
    #[must_use]
    pub fn is_mutations_disallowed(&self) -> bool {
        matches!(self, Self::MutationsDisallowed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_match_their_variants() {
        let closed = StorageError::ConnectionClosed {
            operation: "get".to_owned(),
        };
        assert!(closed.is_connection_closed());
        assert!(!closed.is_mutations_disallowed());

        let disallowed = StorageError::MutationsDisallowed {
            name: "state-backup".to_owned(),
            reason: "private browsing".to_owned(),
        };
        assert!(disallowed.is_mutations_disallowed());
        assert!(!disallowed.is_connection_closed());
    }

    #[test]
    fn version_mismatch_message_names_both_versions() {
        let err = StorageError::VersionMismatch {
            name: "state-backup".to_owned(),
            found: 3,
            requested: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("version 3"));
        assert!(msg.contains("version 1"));
    }
}
