use chrono::Duration;

use crate::error::Result;

/// The business object a workflow is attached to.
///
/// Steps only read from it: field conditions, release preconditions and
/// rendering titles all go through this accessor.
pub trait BusinessObject {
    /// Read a field value by key.
    fn field(&self, key: &str) -> Option<&serde_json::Value>;

    /// Human-readable title used when rendering the workflow.
    fn title(&self) -> String {
        String::new()
    }

    /// Whether the object carries edits that were not saved yet.
    fn has_pending_changes(&self) -> bool {
        false
    }

    /// Whether the object still exists in storage.
    fn exists(&self) -> bool {
        true
    }
}

/// Historical-duration query facade, implemented by the persistence layer.
pub trait DurationStats {
    /// Average time spent in steps of the given type, over all closed
    /// history items. `None` when no traversal was recorded yet.
    fn average_duration(&self, step_type: &str) -> Result<Option<Duration>>;
}
