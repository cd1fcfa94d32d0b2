//! Fixtures shared by the Stepwise test suites.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use stepwise_core::FieldObject;
use stepwise_engine::{Workflow, WorkflowTemplate};

/// The purchase approval template shipped under `demos/`.
pub const APPROVAL_TEMPLATE: &str = include_str!("../../../demos/purchase_approval.toml");

/// Wall-clock time on the day the approval template's cooling-off period
/// ends (2026-03-02, UTC).
pub fn at(hour: u32) -> DateTime<Utc> {
    at_minute(hour, 0)
}

pub fn at_minute(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0)
        .single()
        .unwrap_or_else(|| panic!("invalid fixture time {}:{}", hour, minute))
}

pub fn approval_template() -> WorkflowTemplate {
    WorkflowTemplate::from_toml_str(APPROVAL_TEMPLATE).expect("approval template parses")
}

/// A fresh, unstarted purchase approval instance.
pub fn approval_workflow() -> Workflow {
    approval_template()
        .instantiate()
        .expect("approval template is valid")
}

/// Business object with the given fields.
pub fn document(fields: &[(&str, Value)]) -> FieldObject {
    fields
        .iter()
        .fold(FieldObject::new("Purchase request"), |obj, (key, value)| {
            obj.with(*key, value.clone())
        })
}

/// Write `content` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write fixture file");
    path
}

/// Temp dir holding the approval template as `approval.toml`.
pub fn template_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = write_file(dir.path(), "approval.toml", APPROVAL_TEMPLATE);
    (dir, path)
}
