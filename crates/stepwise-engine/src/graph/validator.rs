use std::collections::{HashMap, HashSet};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::StepId;

use super::{StepGraph, StepKind};

/// Knobs for `validate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    /// Permit back-edges. Only diagram demonstrations need this; a workflow
    /// with a cycle of non-waiting steps never pauses.
    pub allow_back_edges: bool,
}

/// Check a graph rooted at `first_step` before it is registered.
///
/// Rejects duplicate ids, dangling or unset edges, choices without exactly
/// two edges, steps shared between sequences, and (unless allowed) cycles.
pub fn validate(graph: &StepGraph, first_step: &StepId, options: ValidationOptions) -> Result<()> {
    if graph.has_duplicates() {
        return Err(StepwiseError::configuration("duplicate step ids in graph"));
    }
    graph.step(first_step)?;

    let mut owner: HashMap<StepId, StepId> = HashMap::new();
    check_sequence(graph, first_step, &mut owner)?;

    if !options.allow_back_edges {
        if let Some(step) = find_cycle(graph, first_step) {
            return Err(StepwiseError::configuration(format!(
                "cycle through step '{}'",
                step
            )));
        }
    }
    Ok(())
}

/// Validate one sequence and recurse into the branches it contains.
/// `owner` maps each step to the first step of the sequence owning it.
fn check_sequence(
    graph: &StepGraph,
    head: &StepId,
    owner: &mut HashMap<StepId, StepId>,
) -> Result<()> {
    let members = graph.reachable_within(head);
    for id in &members {
        if let Some(other) = owner.insert(id.clone(), head.clone()) {
            return Err(StepwiseError::configuration(format!(
                "step '{}' is shared by the sequences starting at '{}' and '{}'",
                id, other, head
            )));
        }
    }

    for id in &members {
        let step = graph.step(id)?;

        match &step.kind {
            StepKind::ButtonChoice { options } if options.len() != 2 => {
                return Err(StepwiseError::configuration(format!(
                    "choice step '{}' has {} options, exactly 2 are supported",
                    id,
                    options.len()
                )));
            }
            StepKind::Parallelism { branches, .. } if branches.is_empty() => {
                return Err(StepwiseError::configuration(format!(
                    "parallel step '{}' has no branches",
                    id
                )));
            }
            _ => {}
        }

        for edge in step.possible_next_steps() {
            match edge {
                None => {
                    return Err(StepwiseError::configuration(format!(
                        "step '{}' has an unset outgoing edge",
                        id
                    )))
                }
                Some(target) if !graph.contains(&target) => {
                    return Err(StepwiseError::configuration(format!(
                        "step '{}' points at unknown step '{}'",
                        id, target
                    )))
                }
                Some(_) => {}
            }
        }

        for branch in step.branches_ref() {
            graph.step(&branch.first_step)?;
            check_sequence(graph, &branch.first_step, owner)?;
        }
    }
    Ok(())
}

/// Depth-first search for a back-edge, within every sequence.
fn find_cycle(graph: &StepGraph, start: &StepId) -> Option<StepId> {
    fn visit(
        graph: &StepGraph,
        id: &StepId,
        on_path: &mut HashSet<StepId>,
        done: &mut HashSet<StepId>,
    ) -> Option<StepId> {
        if on_path.contains(id) {
            return Some(id.clone());
        }
        if !done.insert(id.clone()) {
            return None;
        }
        let step = graph.get(id)?;
        on_path.insert(id.clone());

        let heads = step.branches_ref().iter().map(|b| b.first_step.clone());
        for next in step.next_step_ids().into_iter().chain(heads) {
            if let Some(found) = visit(graph, &next, on_path, done) {
                return Some(found);
            }
        }
        on_path.remove(id);
        None
    }

    visit(graph, start, &mut HashSet::new(), &mut HashSet::new())
}
