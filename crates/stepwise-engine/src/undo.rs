use std::collections::HashSet;

use serde::Serialize;

use stepwise_core::types::StepId;

use crate::graph::{BranchRef, ButtonSpec, StepGraph, StepSequence};

/// An undo button on offer, with the step it reverts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndoButton {
    pub button: ButtonSpec,
    pub target: StepId,
    /// Branch path of the sequence the target belongs to.
    pub path: Vec<BranchRef>,
}

/// Undo buttons available in `sequence` and the branches of its current
/// step.
///
/// Computed on demand, never stored as edges: every step already visited
/// that lies between the first step and the current one contributes its
/// declared buttons, targeting itself. Steps are listed in walk order from
/// the first step.
pub fn undo_buttons(graph: &StepGraph, sequence: &StepSequence) -> Vec<UndoButton> {
    let mut found = Vec::new();
    collect(graph, sequence, &mut vec![], &mut found);
    found
}

fn collect(
    graph: &StepGraph,
    sequence: &StepSequence,
    path: &mut Vec<BranchRef>,
    found: &mut Vec<UndoButton>,
) {
    let Some(current) = sequence.current_step.as_ref() else {
        return;
    };
    let visited: HashSet<&StepId> = sequence.visited_steps().into_iter().collect();

    for id in graph.reachable_within(&sequence.first_step) {
        if &id == current || !visited.contains(&id) {
            continue;
        }
        if !graph.reachable_within(&id).contains(current) {
            continue;
        }
        let Some(step) = graph.get(&id) else {
            continue;
        };
        for button in &step.undo_buttons {
            found.push(UndoButton {
                button: button.clone(),
                target: id.clone(),
                path: path.clone(),
            });
        }
    }

    if let Some(step) = graph.get(current) {
        for (index, branch) in step.branches_ref().iter().enumerate() {
            path.push(BranchRef {
                parallel_step: current.clone(),
                branch: index,
            });
            collect(graph, branch, path, found);
            path.pop();
        }
    }
}
