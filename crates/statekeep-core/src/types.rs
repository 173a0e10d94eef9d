//! Persisted data model.
//!
//! The state tree itself is open-schema JSON. Only three things get typed
//! structure: the schema metadata, the assembled [`StorageStructure`], and
//! the small [`BackupRecord`] kept in the independent backup store. Shape
//! checks happen once, when values cross into these types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PersistenceError;

/// The application state tree: top-level controller name to its state.
pub type StateTree = serde_json::Map<String, Value>;

/// Key holding the manifest array in the primary store.
pub const MANIFEST_KEY: &str = "manifest";

/// Key holding the whole state tree in monolithic mode.
pub const DATA_KEY: &str = "data";

/// Key holding [`MetaData`].
pub const META_KEY: &str = "meta";

/// Controller whose state contains the encrypted vault.
pub const KEYRING_CONTROLLER: &str = "KeyringController";

/// Controller holding account identity metadata.
pub const APP_METADATA_CONTROLLER: &str = "AppMetadataController";

/// Top-level state keys mirrored into the backup store.
pub const BACKED_UP_KEYS: [&str; 2] = [KEYRING_CONTROLLER, APP_METADATA_CONTROLLER];

/// Physical layout of the primary store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// One monolithic `data` blob plus `meta`.
    #[default]
    Data,
    /// One physical key per top-level controller.
    Split,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => f.write_str("data"),
            Self::Split => f.write_str("split"),
        }
    }
}

/// Schema metadata stored next to the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    /// Schema (migration) version of the state tree.
    pub version: u64,
    /// Layout the state was written with. Absent on un-migrated installs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_kind: Option<StorageKind>,
}

impl MetaData {
    /// Metadata for `version` with no recorded storage kind.
    #[must_use]
    pub fn new(version: u64) -> Self {
        Self {
            version,
            storage_kind: None,
        }
    }

    /// Return a copy stamped with `kind`.
    #[must_use]
    pub fn with_storage_kind(mut self, kind: StorageKind) -> Self {
        self.storage_kind = Some(kind);
        self
    }

    /// The recorded storage kind, defaulting to [`StorageKind::Data`].
    #[must_use]
    pub fn storage_kind(&self) -> StorageKind {
        self.storage_kind.unwrap_or_default()
    }
}

/// Everything read back from the primary store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStructure {
    /// The state tree, if any was stored.
    pub data: Option<StateTree>,
    /// The schema metadata, if any was stored.
    pub meta: Option<MetaData>,
}

impl StorageStructure {
    /// Whether nothing at all was read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.meta.is_none()
    }

    /// Whether the state carries a usable vault.
    #[must_use]
    pub fn has_vault(&self) -> bool {
        self.data.as_ref().is_some_and(state_has_vault)
    }
}

/// Whether `state.KeyringController.vault` is present and non-empty.
#[must_use]
pub fn state_has_vault(state: &StateTree) -> bool {
    state
        .get(KEYRING_CONTROLLER)
        .is_some_and(controller_has_vault)
}

fn controller_has_vault(controller: &Value) -> bool {
    match controller.get("vault") {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Validate a caller-supplied state value at the API boundary.
///
/// # Errors
///
/// - [`PersistenceError::MissingState`] for `null`.
/// - [`PersistenceError::InvalidState`] for anything that is not an object.
pub fn into_state_tree(value: Value) -> Result<StateTree, PersistenceError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(PersistenceError::MissingState),
        other => Err(PersistenceError::InvalidState {
            found: json_type_name(&other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Minimal recovery payload kept in the backup store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Keyring controller state, including the encrypted vault.
    #[serde(
        rename = "KeyringController",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub keyring_controller: Option<Value>,
    /// Account identity metadata.
    #[serde(
        rename = "AppMetadataController",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub app_metadata_controller: Option<Value>,
    /// Schema metadata at the time of backup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaData>,
}

impl BackupRecord {
    /// Derive a record from the backed-up subset of `state`.
    #[must_use]
    pub fn from_state(state: &StateTree, meta: &MetaData) -> Self {
        Self {
            keyring_controller: state.get(KEYRING_CONTROLLER).cloned(),
            app_metadata_controller: state.get(APP_METADATA_CONTROLLER).cloned(),
            meta: Some(meta.clone()),
        }
    }

    /// Derive a record from whichever backed-up keys a batch of pending
    /// writes sets. Returns `None` if the batch touches none of them.
    #[must_use]
    pub fn from_pending(pending: &PendingEntries, meta: &MetaData) -> Option<Self> {
        let value_of = |key: &str| match pending.get(key) {
            Some(PendingWrite::Put(v)) => Some(v.clone()),
            _ => None,
        };
        let record = Self {
            keyring_controller: value_of(KEYRING_CONTROLLER),
            app_metadata_controller: value_of(APP_METADATA_CONTROLLER),
            meta: None,
        };
        if record.has_any_value() {
            Some(Self {
                meta: Some(meta.clone()),
                ..record
            })
        } else {
            None
        }
    }

    /// Whether any field holds a value.
    #[must_use]
    pub fn has_any_value(&self) -> bool {
        self.keyring_controller.is_some()
            || self.app_metadata_controller.is_some()
            || self.meta.is_some()
    }

    /// Whether the keyring entry carries a non-empty vault.
    #[must_use]
    pub fn has_vault(&self) -> bool {
        self.keyring_controller
            .as_ref()
            .is_some_and(controller_has_vault)
    }

    /// The key/value pairs to write to the backup store.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Serialization`] if the metadata cannot be
    /// encoded.
    pub fn entries(&self) -> Result<statekeep_storage::Entries, PersistenceError> {
        let mut entries = statekeep_storage::Entries::new();
        if let Some(v) = &self.keyring_controller {
            entries.insert(KEYRING_CONTROLLER.to_owned(), v.clone());
        }
        if let Some(v) = &self.app_metadata_controller {
            entries.insert(APP_METADATA_CONTROLLER.to_owned(), v.clone());
        }
        if let Some(meta) = &self.meta {
            let v = serde_json::to_value(meta).map_err(|e| PersistenceError::Serialization {
                what: "backup metadata".to_owned(),
                reason: e.to_string(),
            })?;
            entries.insert(META_KEY.to_owned(), v);
        }
        Ok(entries)
    }

    /// Stable serialized form used to skip redundant backup writes.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Serialization`] if the record cannot be
    /// encoded.
    pub fn fingerprint(&self) -> Result<String, PersistenceError> {
        serde_json::to_string(self).map_err(|e| PersistenceError::Serialization {
            what: "backup record".to_owned(),
            reason: e.to_string(),
        })
    }
}

/// A staged change to one primary-store key.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Write this value.
    Put(Value),
    /// Remove the key.
    Delete,
}

impl From<Option<Value>> for PendingWrite {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Delete, Self::Put)
    }
}

/// Keys awaiting persistence, each holding the most recent intent.
pub type PendingEntries = BTreeMap<String, PendingWrite>;
