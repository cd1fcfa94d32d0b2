use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::traits::BusinessObject;

/// In-memory business object backed by a JSON field map.
///
/// Used by the CLI (loaded from a JSON file) and by tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldObject {
    #[serde(default)]
    title: String,
    #[serde(default)]
    fields: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pending_changes: bool,
    #[serde(default = "default_exists")]
    exists: bool,
}

fn default_exists() -> bool {
    true
}

impl Default for FieldObject {
    fn default() -> Self {
        Self::new("")
    }
}

impl FieldObject {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            fields: HashMap::new(),
            pending_changes: false,
            exists: true,
        }
    }

    /// Create a FieldObject from initial data.
    pub fn from_map(fields: HashMap<String, serde_json::Value>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Parse a JSON object into a FieldObject. A top-level `title` key is
    /// used as the title; every key (including `title`) becomes a field.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let mut result = Self::new(
            obj.get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
        for (k, v) in obj {
            result.fields.insert(k.clone(), v.clone());
        }
        Some(result)
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Builder form of `set`.
    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.set(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.fields.remove(key)
    }

    pub fn mark_pending_changes(&mut self, pending: bool) {
        self.pending_changes = pending;
    }

    pub fn mark_deleted(&mut self) {
        self.exists = false;
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.fields
    }
}

impl BusinessObject for FieldObject {
    fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    fn title(&self) -> String {
        self.title.clone()
    }

    fn has_pending_changes(&self) -> bool {
        self.pending_changes
    }

    fn exists(&self) -> bool {
        self.exists
    }
}
