//! Step graph: an arena of typed steps indexed by stable id.
//!
//! Edges are stored as step ids. Parallelism steps own their branch
//! sequences, whose steps live in the same arena. Removing a step is an
//! explicit reachability sweep instead of a cascade.

pub mod condition;
pub mod convergence;
pub mod sequence;
pub mod step;
pub mod validator;

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::StepId;

pub use condition::{FieldCondition, FieldExpectation};
pub use convergence::{CommonStep, MergePoint};
pub use sequence::StepSequence;
pub use step::{ButtonSpec, ChoiceOption, Outcome, Step, StepContext, StepKind};
pub use validator::{validate, ValidationOptions};

/// Address of a nested branch sequence: the parallelism step and the index
/// of the branch inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    pub parallel_step: StepId,
    pub branch: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Step>", into = "Vec<Step>")]
pub struct StepGraph {
    steps: Vec<Step>,
    index: HashMap<StepId, usize>,
}

impl From<Vec<Step>> for StepGraph {
    fn from(steps: Vec<Step>) -> Self {
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Self { steps, index }
    }
}

impl From<StepGraph> for Vec<Step> {
    fn from(graph: StepGraph) -> Self {
        graph.steps
    }
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph, rejecting duplicate ids.
    pub fn from_steps(steps: Vec<Step>) -> Result<Self> {
        let mut graph = Self::new();
        for step in steps {
            graph.insert(step)?;
        }
        Ok(graph)
    }

    pub fn insert(&mut self, step: Step) -> Result<()> {
        if self.index.contains_key(&step.id) {
            return Err(StepwiseError::configuration(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        self.index.insert(step.id.clone(), self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    pub fn get(&self, id: &StepId) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn step(&self, id: &StepId) -> Result<&Step> {
        self.get(id)
            .ok_or_else(|| StepwiseError::StepNotFound(id.clone()))
    }

    pub fn step_mut(&mut self, id: &StepId) -> Result<&mut Step> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.steps[i]),
            None => Err(StepwiseError::StepNotFound(id.clone())),
        }
    }

    pub fn contains(&self, id: &StepId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Whether the arena holds two steps with the same id.
    pub(crate) fn has_duplicates(&self) -> bool {
        self.index.len() != self.steps.len()
    }

    /// Insert `step` right after `prev`, taking over `prev`'s outgoing edge.
    ///
    /// Only non-branching steps can be chained this way: appending after a
    /// terminal or a choice is a modeling error.
    pub fn append_after(&mut self, prev: &StepId, mut step: Step) -> Result<()> {
        let prev_step = self.step(prev)?;
        if prev_step.is_terminal() {
            return Err(StepwiseError::configuration(format!(
                "cannot append after terminal step '{}'",
                prev
            )));
        }
        if prev_step.is_choice() {
            return Err(StepwiseError::configuration(format!(
                "choice step '{}' needs explicit edges",
                prev
            )));
        }
        let inherited = prev_step.possible_next_steps().into_iter().next().flatten();
        let new_id = step.id.clone();

        match step.next_slot_mut() {
            Some(slot) => *slot = inherited,
            None => {
                return Err(StepwiseError::configuration(format!(
                    "step '{}' cannot be chained after '{}'",
                    new_id, prev
                )))
            }
        }
        self.insert(step)?;

        if let Some(slot) = self.step_mut(prev)?.next_slot_mut() {
            *slot = Some(new_id);
        }
        Ok(())
    }

    /// Rewire every edge in the graph pointing at `old`. Returns the number
    /// of steps that changed.
    pub fn rewire(&mut self, old: &StepId, new: &StepId) -> usize {
        self.steps
            .iter_mut()
            .filter_map(|s| s.replace_possible_next_step(old, new).then_some(()))
            .count()
    }

    /// Steps reachable from `start` along edges, `start` included, in BFS
    /// order. Does not descend into parallel branches.
    pub fn reachable_within(&self, start: &StepId) -> Vec<StepId> {
        self.bfs(start, false)
    }

    /// Like `reachable_within`, but also walks every parallel branch.
    pub fn reachable_all(&self, start: &StepId) -> Vec<StepId> {
        self.bfs(start, true)
    }

    fn bfs(&self, start: &StepId, into_branches: bool) -> Vec<StepId> {
        let mut visited: HashSet<StepId> = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back(start.clone());

        while let Some(current) = queue.pop_front() {
            let Some(step) = self.get(&current) else {
                continue;
            };
            order.push(current);

            let mut next = step.next_step_ids();
            if into_branches {
                next.extend(step.branches_ref().iter().map(|b| b.first_step.clone()));
            }
            for id in next {
                if visited.insert(id.clone()) {
                    queue.push_back(id);
                }
            }
        }
        order
    }

    /// Remove a step, then every step no longer reachable from `roots`.
    /// Edges left pointing at removed steps are cleared. Returns the ids
    /// removed, the requested one first.
    pub fn remove_step(&mut self, id: &StepId, roots: &[StepId]) -> Result<Vec<StepId>> {
        if !self.contains(id) {
            return Err(StepwiseError::StepNotFound(id.clone()));
        }
        if roots.contains(id) {
            return Err(StepwiseError::Workflow(format!(
                "cannot remove root step '{}'",
                id
            )));
        }

        let mut removed = vec![id.clone()];
        self.steps.retain(|s| &s.id != id);
        self.reindex();

        let mut keep: HashSet<StepId> = HashSet::new();
        for root in roots {
            keep.extend(self.reachable_all(root));
        }
        let swept: Vec<StepId> = self
            .steps
            .iter()
            .filter(|s| !keep.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();
        self.steps.retain(|s| keep.contains(&s.id));
        self.reindex();
        removed.extend(swept);

        for step in self.steps.iter_mut() {
            for gone in &removed {
                step.detach_edges_to(gone);
            }
        }
        Ok(removed)
    }

    fn reindex(&mut self) {
        self.index = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
    }

    /// Move a parallelism step's branches out so they can be driven while
    /// the graph is borrowed mutably. Must be paired with `restore_branches`.
    pub(crate) fn take_branches(&mut self, id: &StepId) -> Result<Vec<StepSequence>> {
        match &mut self.step_mut(id)?.kind {
            StepKind::Parallelism { branches, .. } => Ok(std::mem::take(branches)),
            _ => Err(StepwiseError::Workflow(format!(
                "step '{}' has no parallel branches",
                id
            ))),
        }
    }

    pub(crate) fn restore_branches(&mut self, id: &StepId, restored: Vec<StepSequence>) {
        if let Ok(step) = self.step_mut(id) {
            if let StepKind::Parallelism { branches, .. } = &mut step.kind {
                *branches = restored;
            }
        }
    }

    /// Run `f` on every branch of a parallelism step.
    pub(crate) fn for_each_branch<F>(&mut self, id: &StepId, mut f: F) -> Result<()>
    where
        F: FnMut(&mut StepGraph, &mut StepSequence) -> Result<()>,
    {
        let mut branches = self.take_branches(id)?;
        let outcome = branches.iter_mut().try_for_each(|b| f(self, b));
        self.restore_branches(id, branches);
        outcome
    }

    /// Run `f` on the sequence addressed by `path`, starting at `root`.
    pub(crate) fn with_sequence<R, F>(
        &mut self,
        root: &mut StepSequence,
        path: &[BranchRef],
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut StepGraph, &mut StepSequence) -> Result<R>,
    {
        let Some((head, rest)) = path.split_first() else {
            return f(self, root);
        };
        let mut branches = self.take_branches(&head.parallel_step)?;
        let outcome = match branches.get_mut(head.branch) {
            Some(branch) => self.with_sequence(branch, rest, f),
            None => Err(StepwiseError::Workflow(format!(
                "step '{}' has no branch {}",
                head.parallel_step, head.branch
            ))),
        };
        self.restore_branches(&head.parallel_step, branches);
        outcome
    }

    /// Rewind every step reachable from `start` within its sequence;
    /// parallel branches are rewound recursively. History is kept.
    pub fn reset_from(&mut self, start: &StepId) -> Result<()> {
        for id in self.reachable_within(start) {
            self.step_mut(&id)?.reset();
            if matches!(self.step(&id)?.kind, StepKind::Parallelism { .. }) {
                self.for_each_branch(&id, |graph, branch| {
                    branch.rewind();
                    graph.reset_from(&branch.first_step.clone())
                })?;
            }
        }
        Ok(())
    }

    /// Cancel the active work below a step: every branch of a parallelism
    /// step closes its open history item and is reset.
    pub(crate) fn cancel_step(&mut self, id: &StepId, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.step(id)?.kind, StepKind::Parallelism { .. }) {
            return Ok(());
        }
        self.for_each_branch(id, |graph, branch| {
            if let Some(current) = branch.current_step.clone() {
                graph.cancel_step(&current, now)?;
            }
            branch.close_open_item(now);
            branch.rewind();
            graph.reset_from(&branch.first_step.clone())
        })
    }
}
