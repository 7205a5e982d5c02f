use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Versioned key-value snapshot attached to a message.
///
/// This is where tool-call history, citation ordinals and module storage live
/// between requests. Every write bumps `version`; the whole snapshot is saved
/// to the store at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl DebugInfo {
    /// Tool messages produced while answering this message.
    pub const TOOL_CALLS: &'static str = "_tool_calls";
    /// Source registry snapshot, position = ordinal.
    pub const SOURCES: &'static str = "_sources";
    /// `[sourceN]` marker to footnote number.
    pub const CITATIONS: &'static str = "_citations";
    /// Module key-value storage.
    pub const STORE: &'static str = "_store";
    /// Failure diagnostics.
    pub const DEBUG: &'static str = "_debug";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Deserialize a value, returning `None` if absent or malformed.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                log::warn!("Ignoring malformed debug entry {}: {}", key, e);
                None
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
        self.version += 1;
    }

    pub fn set_as<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    /// Overlay `other` onto this snapshot; keys in `other` win.
    pub fn merge(&mut self, other: &DebugInfo) {
        if other.values.is_empty() {
            return;
        }
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
        self.version = self.version.max(other.version) + 1;
    }
}
