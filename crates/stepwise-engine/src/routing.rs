//! Button routing: find the step (possibly inside a parallel branch) that
//! owns a clicked button, and list the buttons currently on offer.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::BusinessObject;
use stepwise_core::types::StepId;

use crate::graph::{BranchRef, ButtonSpec, Step, StepGraph, StepSequence};

/// Where a button lives: the branch path from the top-level sequence and
/// the step owning it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ButtonLocation {
    pub path: Vec<BranchRef>,
    pub step: StepId,
}

/// A button the presentation layer may render right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfferedButton {
    pub button: ButtonSpec,
    pub location: ButtonLocation,
}

/// Ids of every button shown by steps inside the branches of `step`.
fn nested_button_ids(graph: &StepGraph, step: &Step) -> HashSet<String> {
    let mut ids = HashSet::new();
    for branch in step.branches_ref() {
        for id in graph.reachable_all(&branch.first_step) {
            if let Some(nested) = graph.get(&id) {
                ids.extend(nested.own_buttons().into_iter().map(|b| b.id.clone()));
            }
        }
    }
    ids
}

/// A button is directly associated with a step when the step shows it and
/// no nested branch shows it too; branch buttons are the more specific.
pub fn is_directly_associated(graph: &StepGraph, step: &Step, button_id: &str) -> bool {
    step.own_buttons().iter().any(|b| b.id == button_id)
        && !nested_button_ids(graph, step).contains(button_id)
}

/// Find the owner of `button_id` below the current step of `sequence`.
///
/// The current step's direct buttons are searched first, then each branch
/// in declared order.
pub fn locate_button(
    graph: &StepGraph,
    sequence: &StepSequence,
    button_id: &str,
) -> Option<ButtonLocation> {
    let current = sequence.current_step.as_ref()?;
    let step = graph.get(current)?;

    if is_directly_associated(graph, step, button_id) {
        return Some(ButtonLocation {
            path: vec![],
            step: current.clone(),
        });
    }

    for (index, branch) in step.branches_ref().iter().enumerate() {
        if let Some(mut found) = locate_button(graph, branch, button_id) {
            found.path.insert(
                0,
                BranchRef {
                    parallel_step: current.clone(),
                    branch: index,
                },
            );
            debug!(
                button = button_id,
                step_id = %found.step,
                depth = found.path.len(),
                "Routed button into branch"
            );
            return Some(found);
        }
    }
    None
}

/// The object must be saved and still exist; otherwise the release
/// preconditions cannot be checked and a `Workflow` error is returned.
pub fn check_object(object: &dyn BusinessObject) -> Result<()> {
    if object.has_pending_changes() {
        return Err(StepwiseError::Workflow(
            "object has unsaved changes".to_string(),
        ));
    }
    if !object.exists() {
        return Err(StepwiseError::Workflow(
            "object no longer exists".to_string(),
        ));
    }
    Ok(())
}

/// First field `step` requires that the object does not carry.
pub fn missing_required_field<'a>(
    step: &'a Step,
    object: &dyn BusinessObject,
) -> Option<&'a str> {
    step.required_fields()
        .iter()
        .find(|key| object.field(key).is_none())
        .map(String::as_str)
}

/// Buttons offered by the active steps of `sequence` and its branches.
///
/// Fails like `check_object`. Release buttons whose required fields are
/// missing are left out.
pub fn offered_buttons(
    graph: &StepGraph,
    sequence: &StepSequence,
    object: &dyn BusinessObject,
) -> Result<Vec<OfferedButton>> {
    check_object(object)?;
    let mut offered = Vec::new();
    collect_offered(graph, sequence, object, &mut vec![], &mut offered);
    Ok(offered)
}

fn collect_offered(
    graph: &StepGraph,
    sequence: &StepSequence,
    object: &dyn BusinessObject,
    path: &mut Vec<BranchRef>,
    offered: &mut Vec<OfferedButton>,
) {
    let Some(current) = sequence.current_step.as_ref() else {
        return;
    };
    let Some(step) = graph.get(current) else {
        return;
    };

    if missing_required_field(step, object).is_none() {
        for button in step.own_buttons() {
            if is_directly_associated(graph, step, &button.id) {
                offered.push(OfferedButton {
                    button: button.clone(),
                    location: ButtonLocation {
                        path: path.clone(),
                        step: current.clone(),
                    },
                });
            }
        }
    }

    for (index, branch) in step.branches_ref().iter().enumerate() {
        path.push(BranchRef {
            parallel_step: current.clone(),
            branch: index,
        });
        collect_offered(graph, branch, object, path, offered);
        path.pop();
    }
}
