use serde::{Deserialize, Serialize};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::BusinessObject;

/// Policy of a `WaitForFieldValues` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCondition {
    AllMustMatch,
    AllMustNotMatch,
    OneMustMatch,
    OneMustNotMatch,
}

/// Expected value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldExpectation {
    pub key: String,
    pub value: serde_json::Value,
}

impl FieldExpectation {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Evaluate a field condition against the object.
///
/// "One must" policies start unsatisfied and stop at the first qualifying
/// field; "all must" policies start satisfied and stop at the first
/// disqualifying one. Fields after the deciding one are never read, so a
/// missing field there does not raise `KeyNotFound`.
pub fn evaluate_fields(
    condition: FieldCondition,
    fields: &[FieldExpectation],
    object: &dyn BusinessObject,
    ignore_missing: bool,
) -> Result<bool> {
    let one_must = matches!(
        condition,
        FieldCondition::OneMustMatch | FieldCondition::OneMustNotMatch
    );
    let mut satisfied = !one_must;

    for expected in fields {
        let actual = match object.field(&expected.key) {
            Some(v) => v,
            None if ignore_missing => continue,
            None => return Err(StepwiseError::key_not_found(&expected.key)),
        };
        let matches = values_match(actual, &expected.value);

        let decided = match condition {
            FieldCondition::AllMustMatch => !matches,
            FieldCondition::AllMustNotMatch => matches,
            FieldCondition::OneMustMatch => matches,
            FieldCondition::OneMustNotMatch => !matches,
        };
        if decided {
            satisfied = one_must;
            break;
        }
    }

    Ok(satisfied)
}

/// Field values compare by JSON equality, falling back to their string
/// rendering so that `"5"` matches `5`.
fn values_match(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    if actual == expected {
        return true;
    }
    render(actual) == render(expected)
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
