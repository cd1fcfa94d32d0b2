//! Mermaid flowchart export.
//!
//! Choice steps are annotated with the merge point of their two lanes, as
//! found by the convergence search.

use std::fmt::Write as _;

use stepwise_core::error::Result;
use stepwise_core::types::StepId;

use crate::graph::convergence::merge_point;
use crate::graph::{MergePoint, Step, StepGraph, StepKind};
use crate::workflow::Workflow;

/// Render the graph reachable from `first_step`.
///
/// Fails with a configuration error when a choice does not have exactly two
/// set edges.
pub fn render_mermaid(
    graph: &StepGraph,
    first_step: &StepId,
    bound_terminal: Option<&StepId>,
) -> Result<String> {
    let mut out = String::from("flowchart TD\n");
    declare_sequence(graph, first_step, 1, &mut out);

    for id in graph.reachable_all(first_step) {
        let step = graph.step(&id)?;
        render_edges(graph, step, bound_terminal, &mut out)?;
    }
    Ok(out)
}

/// Render a workflow instance, highlighting the steps it currently sits on.
pub fn render_workflow(workflow: &Workflow) -> Result<String> {
    let mut out = render_mermaid(
        &workflow.graph,
        workflow.first_step(),
        workflow.last_step.as_ref(),
    )?;
    for id in workflow.active_steps() {
        let _ = writeln!(out, "    style {} stroke-width:3px", node_id(&id));
    }
    Ok(out)
}

fn declare_sequence(graph: &StepGraph, head: &StepId, depth: usize, out: &mut String) {
    let indent = "    ".repeat(depth);
    for id in graph.reachable_within(head) {
        let Some(step) = graph.get(&id) else {
            continue;
        };
        let _ = writeln!(out, "{}{}", indent, node(step));

        for (index, branch) in step.branches_ref().iter().enumerate() {
            let _ = writeln!(
                out,
                "{}subgraph {}_b{}[\"{} #{}\"]",
                indent,
                node_id(&id),
                index + 1,
                escape(step.title()),
                index + 1
            );
            declare_sequence(graph, &branch.first_step, depth + 1, out);
            let _ = writeln!(out, "{}end", indent);
        }
    }
}

fn render_edges(
    graph: &StepGraph,
    step: &Step,
    bound_terminal: Option<&StepId>,
    out: &mut String,
) -> Result<()> {
    let from = node_id(&step.id);

    if step.is_choice() {
        let buttons = step.own_buttons();
        for (edge, button) in step.possible_next_steps().iter().zip(buttons) {
            if let Some(to) = edge {
                let _ = writeln!(
                    out,
                    "    {} -->|{}| {}",
                    from,
                    escape(&button.label),
                    node_id(to)
                );
            }
        }
        match merge_point(graph, &step.id, bound_terminal)? {
            MergePoint::Converge {
                step: merge,
                left_distance,
                right_distance,
            } => {
                let _ = writeln!(
                    out,
                    "    %% {} merges at {} ({}/{} hops)",
                    from,
                    node_id(&merge),
                    left_distance,
                    right_distance
                );
            }
            MergePoint::Terminal { left, right } => {
                let lanes: Vec<String> = [("left", left), ("right", right)]
                    .into_iter()
                    .filter_map(|(side, common)| {
                        common.map(|c| format!("{} after {} hops", side, c.distance))
                    })
                    .collect();
                let _ = writeln!(
                    out,
                    "    %% {} lanes end at the terminal: {}",
                    from,
                    lanes.join(", ")
                );
            }
            MergePoint::Diverge => {
                let _ = writeln!(out, "    %% {} lanes never merge", from);
            }
        }
        return Ok(());
    }

    for branch in step.branches_ref() {
        let _ = writeln!(out, "    {} -.-> {}", from, node_id(&branch.first_step));
    }
    for to in step.next_step_ids() {
        let _ = writeln!(out, "    {} --> {}", from, node_id(&to));
    }
    Ok(())
}

fn node(step: &Step) -> String {
    let id = node_id(&step.id);
    let title = escape(step.title());
    match step.kind {
        StepKind::Placeholder { .. } => format!("{}[\"{}\"]", id, title),
        StepKind::WaitForRelease { .. }
        | StepKind::WaitForDraftRelease { .. }
        | StepKind::WaitUntil { .. }
        | StepKind::WaitForFieldValues { .. } => format!("{}(\"{}\")", id, title),
        StepKind::ButtonChoice { .. } | StepKind::TrueFalseChoice { .. } => {
            format!("{}{{\"{}\"}}", id, title)
        }
        StepKind::Parallelism { .. } => format!("{}[[\"{}\"]]", id, title),
        StepKind::Last { .. } => format!("{}((\"{}\"))", id, title),
    }
}

/// Mermaid node ids only allow a restricted character set, and `end`
/// closes a subgraph.
fn node_id(id: &StepId) -> String {
    let mut out: String = id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.eq_ignore_ascii_case("end") {
        out.push('_');
    }
    out
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;").replace('|', "#124;")
}
