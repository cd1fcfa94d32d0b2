use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::DurationStats;
use stepwise_core::types::{HistoryItem, StepId, WorkflowId};

use crate::graph::{validate, Step, StepGraph, StepSequence, ValidationOptions};

/// A running instance of a workflow: the step arena plus the top-level
/// sequence walking it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub graph: StepGraph,
    pub sequence: StepSequence,
    /// Terminal step used as the merge lane of diverging choices.
    #[serde(default)]
    pub last_step: Option<StepId>,
    /// Terminal recorded in the history when the workflow is canceled.
    #[serde(default)]
    pub cancel_step: Option<StepId>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Create an instance without validating the graph.
    pub fn new(name: impl Into<String>, graph: StepGraph, first_step: impl Into<StepId>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            graph,
            sequence: StepSequence::new(first_step.into()),
            last_step: None,
            cancel_step: None,
            created_at: Utc::now(),
        }
    }

    /// Create an instance, rejecting graphs that `validate` refuses.
    pub fn validated(
        name: impl Into<String>,
        graph: StepGraph,
        first_step: impl Into<StepId>,
        options: ValidationOptions,
    ) -> Result<Self> {
        let workflow = Self::new(name, graph, first_step);
        validate(&workflow.graph, &workflow.sequence.first_step, options)?;
        Ok(workflow)
    }

    pub fn with_last_step(mut self, id: impl Into<StepId>) -> Self {
        self.last_step = Some(id.into());
        self
    }

    pub fn with_cancel_step(mut self, id: impl Into<StepId>) -> Self {
        self.cancel_step = Some(id.into());
        self
    }

    /// Bound terminals must exist and have no outgoing edges.
    pub fn check_bound_terminal(&self, id: Option<&StepId>) -> Result<()> {
        let Some(id) = id else {
            return Ok(());
        };
        if !self.graph.step(id)?.is_terminal() {
            return Err(StepwiseError::configuration(format!(
                "bound step '{}' is not a terminal step",
                id
            )));
        }
        Ok(())
    }

    pub fn first_step(&self) -> &StepId {
        &self.sequence.first_step
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.sequence
            .current_step
            .as_ref()
            .and_then(|id| self.graph.get(id))
    }

    pub fn is_started(&self) -> bool {
        self.sequence.is_started()
    }

    pub fn is_completed(&self) -> bool {
        self.sequence.completed
    }

    pub fn is_canceled(&self) -> bool {
        self.sequence.canceled
    }

    pub fn is_finished(&self) -> bool {
        self.sequence.is_finished()
    }

    pub fn auto_execution_schedule(&self) -> Option<DateTime<Utc>> {
        self.sequence.auto_execution_schedule
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.sequence.is_due(now)
    }

    pub fn history(&self) -> &[HistoryItem] {
        &self.sequence.history
    }

    /// History of the top-level sequence and of every parallel branch.
    pub fn all_history(&self) -> Vec<&HistoryItem> {
        self.history_log().into_iter().map(|(_, _, item)| item).collect()
    }

    /// Every history item keyed by the sequence it belongs to (`""` for the
    /// top-level sequence, `"<parallel step>#<branch>"` otherwise) and its
    /// position there. Positions never change since history only grows.
    pub fn history_log(&self) -> Vec<(String, usize, &HistoryItem)> {
        let mut log: Vec<(String, usize, &HistoryItem)> = self
            .sequence
            .history
            .iter()
            .enumerate()
            .map(|(i, item)| (String::new(), i, item))
            .collect();
        for step in self.graph.iter() {
            for (index, branch) in step.branches_ref().iter().enumerate() {
                let key = format!("{}#{}", step.id, index);
                log.extend(
                    branch
                        .history
                        .iter()
                        .enumerate()
                        .map(|(i, item)| (key.clone(), i, item)),
                );
            }
        }
        log
    }

    /// Record the form submitted on a draft release step.
    pub fn submit_form(&mut self, step: &StepId, data: serde_json::Value) -> Result<()> {
        self.graph.step_mut(step)?.submit_form(data)
    }

    /// Remove a step and everything only reachable through it.
    ///
    /// Bound terminals are kept alive even when no edge leads to them;
    /// removing one explicitly unbinds it. A step some sequence currently
    /// sits on cannot be removed.
    pub fn remove_step(&mut self, id: &StepId) -> Result<Vec<StepId>> {
        if self.active_steps().contains(id) {
            return Err(StepwiseError::Workflow(format!(
                "cannot remove active step '{}'",
                id
            )));
        }
        let mut roots = vec![self.sequence.first_step.clone()];
        roots.extend(
            [&self.last_step, &self.cancel_step]
                .into_iter()
                .flatten()
                .filter(|bound| *bound != id)
                .cloned(),
        );
        let removed = self.graph.remove_step(id, &roots)?;
        for bound in [&mut self.last_step, &mut self.cancel_step] {
            if bound.as_ref().is_some_and(|b| removed.contains(b)) {
                *bound = None;
            }
        }
        Ok(removed)
    }

    /// Current steps of the top-level sequence and every branch.
    pub fn active_steps(&self) -> Vec<StepId> {
        let mut active: Vec<StepId> = self.sequence.current_step.iter().cloned().collect();
        for step in self.graph.iter() {
            for branch in step.branches_ref() {
                active.extend(branch.current_step.iter().cloned());
            }
        }
        active
    }

    /// Typical time spent in the given step, from `stats`.
    pub fn step_average_duration(
        &self,
        id: &StepId,
        stats: &dyn DurationStats,
    ) -> Result<Option<Duration>> {
        self.graph.step(id)?.average_duration(stats)
    }
}

/// Averages over this instance's own history.
impl DurationStats for Workflow {
    fn average_duration(&self, step_type: &str) -> Result<Option<Duration>> {
        let durations: Vec<Duration> = self
            .all_history()
            .into_iter()
            .filter(|item| item.step_type == step_type)
            .filter_map(|item| item.duration())
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        let total: Duration = durations.iter().copied().sum();
        Ok(Some(total / durations.len() as i32))
    }
}
