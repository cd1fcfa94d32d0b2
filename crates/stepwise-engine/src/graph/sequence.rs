use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stepwise_core::types::{HistoryItem, StepId};

/// An independently progressing chain of steps: the whole workflow, or one
/// branch of a parallelism step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSequence {
    pub first_step: StepId,
    /// `None` before the sequence starts and after it finished.
    #[serde(default)]
    pub current_step: Option<StepId>,
    /// Append-only traversal log.
    #[serde(default)]
    pub history: Vec<HistoryItem>,
    /// Earliest time the engine should re-execute without a new stimulus.
    #[serde(default)]
    pub auto_execution_schedule: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub canceled: bool,
}

impl StepSequence {
    pub fn new(first_step: StepId) -> Self {
        Self {
            first_step,
            current_step: None,
            history: vec![],
            auto_execution_schedule: None,
            completed: false,
            canceled: false,
        }
    }

    pub fn is_started(&self) -> bool {
        self.current_step.is_some() || !self.history.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.completed || self.canceled
    }

    /// Whether the scheduler should re-execute this sequence at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_finished() && self.auto_execution_schedule.is_some_and(|at| at <= now)
    }

    /// Close the item of the step being exited.
    pub(crate) fn close_open_item(&mut self, now: DateTime<Utc>) {
        if let Some(item) = self.history.last_mut() {
            if item.is_open() {
                item.exited_at = Some(now);
            }
        }
    }

    /// Return to the not-yet-started condition. History is kept.
    pub(crate) fn rewind(&mut self) {
        self.current_step = None;
        self.auto_execution_schedule = None;
        self.completed = false;
        self.canceled = false;
    }

    /// Steps entered so far, first occurrence order.
    pub fn visited_steps(&self) -> Vec<&StepId> {
        let mut seen: Vec<&StepId> = Vec::new();
        for item in &self.history {
            if !seen.contains(&&item.step_id) {
                seen.push(&item.step_id);
            }
        }
        seen
    }
}
