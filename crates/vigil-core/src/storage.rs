// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task storage blob.
//!
//! The storage blob is the only memory a suspended task has of its progress.
//! It is a JSON object loaded before every invocation and written back after.
//! Handlers keep their state under namespaced keys, so a workflow can hand a
//! sub-document to a nested handler without the two trampling each other.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable JSON object carried across invocations of one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Storage(Map<String, Value>);

impl Storage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a persisted blob. Empty text and JSON `null` yield empty storage.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Self::default());
        }
        serde_json::from_str(trimmed)
    }

    /// Serialize for persistence.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Typed read of a top-level key. Missing or mistyped keys give `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Raw value of a top-level key.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a top-level key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), serde_json::Error> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Remove a top-level key, returning its old value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Whether a top-level key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy of the sub-document stored under `key`. Anything that is not an
    /// object yields empty storage.
    pub fn sub(&self, key: &str) -> Storage {
        match self.0.get(key) {
            Some(Value::Object(map)) => Storage(map.clone()),
            _ => Storage::default(),
        }
    }

    /// Replace the sub-document stored under `key`.
    pub fn set_sub(&mut self, key: impl Into<String>, sub: Storage) {
        self.0.insert(key.into(), Value::Object(sub.0));
    }

    /// Deserialize the whole blob into a typed document. Empty storage yields
    /// the document's default.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T, serde_json::Error> {
        if self.0.is_empty() {
            return Ok(T::default());
        }
        serde_json::from_value(Value::Object(self.0.clone()))
    }

    /// Replace the whole blob with a typed document.
    pub fn store<T: Serialize>(&mut self, document: &T) -> Result<(), serde_json::Error> {
        match serde_json::to_value(document)? {
            Value::Object(map) => self.0 = map,
            Value::Null => self.0.clear(),
            other => {
                self.0.clear();
                self.0.insert("value".to_string(), other);
            }
        }
        Ok(())
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Storage {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Storage> for Value {
    fn from(storage: Storage) -> Self {
        Value::Object(storage.0)
    }
}
