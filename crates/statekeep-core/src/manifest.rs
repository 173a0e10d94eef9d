//! In-memory record of the keys held by the primary store.
//!
//! The manifest lets the primary adapter read exactly the keys it owns and
//! compute add/remove diffs, without ever scanning the medium for entries
//! written by other code.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::PersistenceError;
use crate::types::MANIFEST_KEY;

/// Set of keys the primary store is known to hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    keys: BTreeSet<String>,
}

impl Manifest {
    /// An empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the stored manifest array.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Corrupted`] if the value is not an array
    /// of strings.
    pub fn from_value(value: &Value) -> Result<Self, PersistenceError> {
        let corrupted = |reason: &str| PersistenceError::Corrupted {
            key: MANIFEST_KEY.to_owned(),
            reason: reason.to_owned(),
        };
        let items = value
            .as_array()
            .ok_or_else(|| corrupted("expected an array"))?;
        let keys = items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| corrupted("expected only string entries"))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { keys })
    }

    /// Encode as the array stored under [`MANIFEST_KEY`].
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Array(self.keys.iter().cloned().map(Value::String).collect())
    }

    /// Whether `key` is tracked.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Track `key`. Returns `true` if it was new.
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    /// Stop tracking `key`. Returns `true` if it was tracked.
    pub fn remove(&mut self, key: &str) -> bool {
        self.keys.remove(key)
    }

    /// Tracked keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Manifest {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            keys: iter.into_iter().map(Into::into).collect(),
        }
    }
}
