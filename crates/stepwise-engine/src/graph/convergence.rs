//! Nearest-common-descendant search used to lay out choice branches.
//!
//! Both searches are breadth-first over a visited set, so they terminate on
//! graphs with back-edges.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::StepId;

use super::StepGraph;

/// A step reachable from two origins, with its hop distance from the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommonStep {
    pub step: StepId,
    pub distance: usize,
}

/// Where the two lanes of a choice meet again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergePoint {
    /// Both branches reach `step`.
    Converge {
        step: StepId,
        left_distance: usize,
        right_distance: usize,
    },
    /// The branches never meet; the lanes that reach the bound terminal
    /// merge there.
    Terminal {
        left: Option<CommonStep>,
        right: Option<CommonStep>,
    },
    Diverge,
}

/// Hop distances from `start` to everything reachable from it.
fn distances_from(graph: &StepGraph, start: &StepId) -> HashMap<StepId, usize> {
    let mut dist = HashMap::new();
    let mut queue = VecDeque::new();
    if !graph.contains(start) {
        return dist;
    }
    dist.insert(start.clone(), 0);
    queue.push_back(start.clone());

    while let Some(current) = queue.pop_front() {
        let here = dist[&current];
        let Some(step) = graph.get(&current) else {
            continue;
        };
        for next in step.next_step_ids() {
            if graph.contains(&next) && !dist.contains_key(&next) {
                dist.insert(next.clone(), here + 1);
                queue.push_back(next);
            }
        }
    }
    dist
}

/// Number of hops from `from` to `to`, if `to` is reachable.
pub fn distance(graph: &StepGraph, from: &StepId, to: &StepId) -> Option<usize> {
    distances_from(graph, from).get(to).copied()
}

/// Nearest step reachable from both `from` and `other`.
///
/// Hop distances from `other` are computed once up front, then the frontier
/// from `from` is expanded one level at a time. The first level holding any
/// descendant of `other` decides the result, so `distance` is always the
/// minimum hop count from `from`. Within that level the step nearest to
/// `other` wins, and equal pairs keep the level's edge order.
///
/// `from` itself counts when it equals `other` or descends from it
/// (distance 0).
pub fn closest_common_next_step(
    graph: &StepGraph,
    from: &StepId,
    other: &StepId,
) -> Option<CommonStep> {
    let targets = distances_from(graph, other);
    if targets.is_empty() || !graph.contains(from) {
        return None;
    }

    let mut visited: HashSet<StepId> = HashSet::from([from.clone()]);
    let mut level = vec![from.clone()];
    let mut distance = 0;

    while !level.is_empty() {
        let hit = level
            .iter()
            .filter_map(|id| targets.get(id).map(|d| (d, id)))
            .min_by_key(|(d, _)| **d);
        if let Some((_, id)) = hit {
            return Some(CommonStep {
                step: id.clone(),
                distance,
            });
        }

        let mut next_level = Vec::new();
        for id in &level {
            let Some(step) = graph.get(id) else {
                continue;
            };
            for next in step.next_step_ids() {
                if visited.insert(next.clone()) {
                    next_level.push(next);
                }
            }
        }
        level = next_level;
        distance += 1;
    }
    None
}

/// Merge point of the two edges leaving a choice step.
///
/// Falls back to `bound_terminal` when the branches never meet each other.
/// A choice without exactly two set edges cannot be laid out and is a
/// configuration error.
pub fn merge_point(
    graph: &StepGraph,
    choice: &StepId,
    bound_terminal: Option<&StepId>,
) -> Result<MergePoint> {
    let step = graph.step(choice)?;
    if !step.is_choice() {
        return Err(StepwiseError::configuration(format!(
            "step '{}' is not a choice",
            choice
        )));
    }
    let edges = step.possible_next_steps();
    let (left, right) = match edges.as_slice() {
        [Some(left), Some(right)] => (left, right),
        _ => {
            return Err(StepwiseError::configuration(format!(
                "choice step '{}' must have exactly two set edges, found {}",
                choice,
                edges.iter().flatten().count()
            )))
        }
    };

    if let Some(common) = closest_common_next_step(graph, left, right) {
        let right_distance = distance(graph, right, &common.step).unwrap_or(0);
        return Ok(MergePoint::Converge {
            step: common.step,
            left_distance: common.distance,
            right_distance,
        });
    }

    let Some(terminal) = bound_terminal else {
        return Ok(MergePoint::Diverge);
    };
    let left = closest_common_next_step(graph, left, terminal);
    let right = closest_common_next_step(graph, right, terminal);
    if left.is_none() && right.is_none() {
        return Ok(MergePoint::Diverge);
    }
    Ok(MergePoint::Terminal { left, right })
}
