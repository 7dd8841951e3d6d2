//! Replicated key/value data shared by a lobby and by each of its members.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyData {
    pub name: String,
    pub value: String,
}

impl LobbyData {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Key/value store with unique keys. Mutations report whether anything
/// actually changed so callers can skip redundant replication.
///
/// Merging a serialized blob never removes keys: last write wins per key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LobbyDataContainer {
    entries: Vec<LobbyData>,
}

impl LobbyDataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert. Returns false when the key already held exactly this value.
    pub fn set_data(&mut self, name: &str, value: &str) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            if entry.value == value {
                return false;
            }
            entry.value = value.to_string();
            return true;
        }
        self.entries.push(LobbyData::new(name, value));
        true
    }

    /// Value for `name`, or None when the key is not present.
    pub fn get_data(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Returns true when a key was actually removed.
    pub fn remove_data(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[LobbyData] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot as a name → value map for the wire.
    pub fn serialize_data(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect()
    }

    /// Merge a snapshot: existing keys are updated, new keys inserted, absent keys kept.
    pub fn deserialize_data(&mut self, blob: &BTreeMap<String, String>) {
        for (name, value) in blob {
            self.set_data(name, value);
        }
    }
}
