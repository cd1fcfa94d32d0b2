//! The drive loop: executes a workflow's current step, follows advances
//! until a step has to wait, and turns button clicks and undo requests
//! into transitions.
//!
//! The engine holds no per-instance state. Every call takes the workflow by
//! `&mut` and leaves it ready to be persisted; suspension is expressed only
//! through `StepSequence::auto_execution_schedule`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use stepwise_core::config::EngineConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::EventBus;
use stepwise_core::traits::BusinessObject;
use stepwise_core::types::{
    ButtonClick, HistoryItem, StepId, StepResult, Trigger, WorkflowEvent, WorkflowId,
};

use crate::graph::{Outcome, Step, StepContext, StepGraph, StepKind, StepSequence};
use crate::routing::{self, OfferedButton};
use crate::undo::{self, UndoButton};
use crate::workflow::Workflow;

/// Side effect attached to a button, run before the transition is taken.
///
/// Returning `StepwiseError::Application` rejects the click with a message
/// for the user; any other error aborts the request.
pub trait ButtonAction: Send + Sync {
    fn on_click(&self, step: &Step, click: &ButtonClick, object: &dyn BusinessObject)
        -> Result<()>;
}

/// Where the top-level sequence stands after a drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriveOutcome {
    Waiting {
        step: StepId,
        retry_at: Option<DateTime<Utc>>,
    },
    Completed,
    Canceled,
}

/// What one engine call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveReport {
    /// Steps entered during the call, in order, branches included.
    pub entered: Vec<StepId>,
    pub outcome: DriveOutcome,
}

/// Result of routing a button click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClickOutcome {
    Handled(DriveReport),
    /// A business rule refused the click; the workflow is unchanged.
    Rejected { message: String },
}

/// Per-call state threaded through the recursive drive.
struct Drive<'a> {
    workflow_id: WorkflowId,
    object: &'a dyn BusinessObject,
    now: DateTime<Utc>,
    entered: Vec<StepId>,
    was_finished: bool,
}

pub struct WorkflowEngine {
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
    actions: HashMap<String, Arc<dyn ButtonAction>>,
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            event_bus: None,
            actions: HashMap::new(),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Attach a side effect to every button with the given id.
    pub fn register_action(&mut self, button_id: impl Into<String>, action: Arc<dyn ButtonAction>) {
        self.actions.insert(button_id.into(), action);
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    /// Enter the first step and drive until something has to wait.
    pub fn start(
        &self,
        workflow: &mut Workflow,
        object: &dyn BusinessObject,
        now: DateTime<Utc>,
    ) -> Result<DriveReport> {
        if workflow.is_started() {
            return Err(StepwiseError::Workflow(format!(
                "workflow {} was already started",
                workflow.id
            )));
        }
        let first = workflow.sequence.first_step.clone();
        info!(workflow_id = %workflow.id, first_step = %first, "Starting workflow");
        self.publish(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow.id.clone(),
            first_step: first.clone(),
        });

        let mut drive = Drive::new(workflow, object, now);
        self.enter(&mut drive, &mut workflow.graph, &mut workflow.sequence, first, Trigger::Start)?;
        self.drive_sequence(
            &mut drive,
            &mut workflow.graph,
            &mut workflow.sequence,
            Trigger::Auto,
        )?;
        Ok(self.finish(workflow, drive))
    }

    /// Re-execute the current step on a scheduler tick.
    ///
    /// A finished workflow is left alone and reported as such.
    pub fn tick(
        &self,
        workflow: &mut Workflow,
        object: &dyn BusinessObject,
        now: DateTime<Utc>,
    ) -> Result<DriveReport> {
        if !workflow.is_started() {
            return Err(StepwiseError::Workflow(format!(
                "workflow {} has not been started",
                workflow.id
            )));
        }
        let mut drive = Drive::new(workflow, object, now);
        if workflow.is_finished() {
            return Ok(self.finish(workflow, drive));
        }
        debug!(workflow_id = %workflow.id, "Executing scheduled tick");
        self.drive_sequence(
            &mut drive,
            &mut workflow.graph,
            &mut workflow.sequence,
            Trigger::Schedule,
        )?;
        Ok(self.finish(workflow, drive))
    }

    /// Route a click to the step owning the button and take the transition
    /// it yields.
    ///
    /// The object is checked the same way as for `offered_buttons`: a dirty
    /// or deleted object is a `Workflow` error, and a click on a button
    /// hidden for a missing required field is rejected. Business-rule
    /// failures become `ClickOutcome::Rejected` and leave the workflow
    /// untouched.
    pub fn click(
        &self,
        workflow: &mut Workflow,
        object: &dyn BusinessObject,
        click: ButtonClick,
        now: DateTime<Utc>,
    ) -> Result<ClickOutcome> {
        self.ensure_active(workflow)?;
        let location = routing::locate_button(&workflow.graph, &workflow.sequence, &click.sender)
            .ok_or_else(|| StepwiseError::ButtonNotFound(click.sender.clone()))?;
        debug!(
            workflow_id = %workflow.id,
            button = %click.sender,
            step_id = %location.step,
            "Routing button click"
        );

        routing::check_object(object)?;
        let step = workflow.graph.step(&location.step)?;
        if let Some(key) = routing::missing_required_field(step, object) {
            let error = StepwiseError::Application(format!(
                "'{}' needs field '{}' before it can be clicked",
                click.sender, key
            ));
            return Ok(self.reject(workflow, &click, error));
        }
        let attempt = match self.actions.get(&click.sender) {
            Some(action) => action
                .on_click(step, &click, object)
                .and_then(|()| step.click(&click.sender)),
            None => step.click(&click.sender),
        };
        let result = match attempt {
            Ok(result) => result,
            Err(e) if e.is_recoverable() => return Ok(self.reject(workflow, &click, e)),
            Err(e) => return Err(e),
        };

        let mut drive = Drive::new(workflow, object, now);
        let trigger = Trigger::Button(click);
        workflow
            .graph
            .with_sequence(&mut workflow.sequence, &location.path, |graph, seq| {
                self.apply(&mut drive, graph, seq, result, trigger)?;
                self.drive_sequence(&mut drive, graph, seq, Trigger::Auto)
            })?;
        if !location.path.is_empty() {
            self.drive_sequence(
                &mut drive,
                &mut workflow.graph,
                &mut workflow.sequence,
                Trigger::Auto,
            )?;
        }
        Ok(ClickOutcome::Handled(self.finish(workflow, drive)))
    }

    fn reject(
        &self,
        workflow: &Workflow,
        click: &ButtonClick,
        error: StepwiseError,
    ) -> ClickOutcome {
        let message = error.to_string();
        warn!(
            workflow_id = %workflow.id,
            button = %click.sender,
            error = %message,
            "Button click rejected"
        );
        self.publish(WorkflowEvent::ButtonRejected {
            workflow_id: workflow.id.clone(),
            button: click.sender.clone(),
            message: message.clone(),
        });
        ClickOutcome::Rejected { message }
    }

    /// Buttons the presentation layer may offer right now.
    pub fn offered_buttons(
        &self,
        workflow: &Workflow,
        object: &dyn BusinessObject,
    ) -> Result<Vec<OfferedButton>> {
        routing::offered_buttons(&workflow.graph, &workflow.sequence, object)
    }

    pub fn undo_buttons(&self, workflow: &Workflow) -> Vec<UndoButton> {
        undo::undo_buttons(&workflow.graph, &workflow.sequence)
    }

    /// Move the sequence owning an undo button back to the button's target.
    ///
    /// Work below the current step is canceled, the target and everything
    /// after it is reset, and the target is entered again. History is kept.
    pub fn undo(
        &self,
        workflow: &mut Workflow,
        object: &dyn BusinessObject,
        button_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DriveReport> {
        self.ensure_active(workflow)?;
        let chosen = self
            .undo_buttons(workflow)
            .into_iter()
            .find(|u| u.button.id == button_id)
            .ok_or_else(|| StepwiseError::ButtonNotFound(button_id.to_string()))?;
        info!(
            workflow_id = %workflow.id,
            button = button_id,
            target = %chosen.target,
            "Applying undo"
        );

        let mut drive = Drive::new(workflow, object, now);
        let target = chosen.target.clone();
        workflow
            .graph
            .with_sequence(&mut workflow.sequence, &chosen.path, |graph, seq| {
                if let Some(current) = seq.current_step.clone() {
                    graph.cancel_step(&current, now)?;
                }
                graph.reset_from(&target)?;
                seq.completed = false;
                seq.canceled = false;
                let trigger = Trigger::Undo {
                    button: button_id.to_string(),
                };
                self.enter(&mut drive, graph, seq, target.clone(), trigger)?;
                self.drive_sequence(&mut drive, graph, seq, Trigger::Auto)
            })?;
        if !chosen.path.is_empty() {
            self.drive_sequence(
                &mut drive,
                &mut workflow.graph,
                &mut workflow.sequence,
                Trigger::Auto,
            )?;
        }

        self.publish(WorkflowEvent::UndoApplied {
            workflow_id: workflow.id.clone(),
            target: chosen.target,
        });
        Ok(self.finish(workflow, drive))
    }

    /// Cancel the workflow: every active branch is canceled and reset, the
    /// open history item is closed and the cancel terminal, if bound, is
    /// recorded.
    pub fn cancel(&self, workflow: &mut Workflow, now: DateTime<Utc>) -> Result<()> {
        self.ensure_active(workflow)?;
        let seq = &mut workflow.sequence;
        if let Some(current) = seq.current_step.clone() {
            workflow.graph.cancel_step(&current, now)?;
        }
        seq.close_open_item(now);

        if let Some(terminal) = &workflow.cancel_step {
            let step = workflow.graph.step(terminal)?;
            let mut item =
                HistoryItem::open(terminal.clone(), step.type_name(), Trigger::Cancel, now);
            item.exited_at = Some(now);
            seq.history.push(item);
        }
        seq.current_step = None;
        seq.auto_execution_schedule = None;
        seq.canceled = true;

        info!(workflow_id = %workflow.id, "Workflow canceled");
        self.publish(WorkflowEvent::WorkflowCanceled {
            workflow_id: workflow.id.clone(),
        });
        Ok(())
    }

    fn ensure_active(&self, workflow: &Workflow) -> Result<()> {
        if !workflow.is_started() {
            return Err(StepwiseError::Workflow(format!(
                "workflow {} has not been started",
                workflow.id
            )));
        }
        if workflow.is_finished() {
            return Err(StepwiseError::Workflow(format!(
                "workflow {} is already finished",
                workflow.id
            )));
        }
        Ok(())
    }

    /// Execute the current step of `seq` and follow advances until a step
    /// waits or the sequence ends. `trigger` is recorded on the first step
    /// entered; later ones were reached automatically.
    fn drive_sequence(
        &self,
        drive: &mut Drive<'_>,
        graph: &mut StepGraph,
        seq: &mut StepSequence,
        trigger: Trigger,
    ) -> Result<()> {
        let mut trigger = Some(trigger);
        let mut chain = 0usize;

        while let Some(current) = seq.current_step.clone() {
            if matches!(graph.step(&current)?.kind, StepKind::Parallelism { .. }) {
                let inner = trigger.clone().unwrap_or(Trigger::Auto);
                self.drive_branches(drive, graph, &current, &inner)?;
                // Recomputed from the branches below; a branch that was
                // scheduled may have finished since.
                seq.auto_execution_schedule = None;
            }

            let ctx = StepContext::new(drive.object, drive.now);
            match graph.step(&current)?.execute(&ctx)? {
                StepResult::Advance { next } => {
                    chain += 1;
                    self.check_chain(drive, &current, chain)?;
                    let entered_by = trigger.take().unwrap_or(Trigger::Auto);
                    self.enter(drive, graph, seq, next, entered_by)?;
                }
                StepResult::WaitUntil { retry_at } => {
                    seq.auto_execution_schedule = Some(retry_at);
                    debug!(
                        workflow_id = %drive.workflow_id,
                        step_id = %current,
                        retry_at = %retry_at,
                        "Execution deferred"
                    );
                    self.publish(WorkflowEvent::ExecutionDeferred {
                        workflow_id: drive.workflow_id.clone(),
                        step_id: current,
                        retry_at: Some(retry_at),
                    });
                    return Ok(());
                }
                StepResult::Wait => {
                    debug!(
                        workflow_id = %drive.workflow_id,
                        step_id = %current,
                        "Waiting for trigger"
                    );
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Drive every unfinished branch of a parallelism step, in declared
    /// order.
    fn drive_branches(
        &self,
        drive: &mut Drive<'_>,
        graph: &mut StepGraph,
        parallel: &StepId,
        trigger: &Trigger,
    ) -> Result<()> {
        graph.for_each_branch(parallel, |graph, branch| {
            if branch.is_finished() || branch.current_step.is_none() {
                return Ok(());
            }
            self.drive_sequence(drive, graph, branch, trigger.clone())
        })
    }

    fn check_chain(&self, drive: &Drive<'_>, step: &StepId, chain: usize) -> Result<()> {
        if let Some(max) = self.config.max_chain_length {
            if chain > max {
                return Err(StepwiseError::configuration(format!(
                    "more than {} immediate advances in one drive, last from step '{}'",
                    max, step
                )));
            }
        }
        if chain == self.config.chain_warn_threshold {
            warn!(
                workflow_id = %drive.workflow_id,
                step_id = %step,
                chain,
                "Long auto-advance chain, check the template for cycles"
            );
        }
        Ok(())
    }

    /// Apply a step result produced outside `execute` (a button click).
    fn apply(
        &self,
        drive: &mut Drive<'_>,
        graph: &mut StepGraph,
        seq: &mut StepSequence,
        result: StepResult,
        trigger: Trigger,
    ) -> Result<()> {
        match result {
            StepResult::Advance { next } => self.enter(drive, graph, seq, next, trigger),
            StepResult::WaitUntil { retry_at } => {
                seq.auto_execution_schedule = Some(retry_at);
                Ok(())
            }
            StepResult::Wait => Ok(()),
        }
    }

    /// Make `next` the current step of `seq`.
    ///
    /// Closes the previous history item and opens one for `next`. Entering
    /// a parallelism step restarts its branches; entering a terminal ends
    /// the sequence.
    fn enter(
        &self,
        drive: &mut Drive<'_>,
        graph: &mut StepGraph,
        seq: &mut StepSequence,
        next: StepId,
        trigger: Trigger,
    ) -> Result<()> {
        let step = graph.step(&next)?;
        let type_name = step.type_name();
        let terminal = match &step.kind {
            StepKind::Last { outcome } => Some(*outcome),
            _ => None,
        };
        let parallel = matches!(step.kind, StepKind::Parallelism { .. });

        seq.close_open_item(drive.now);
        seq.current_step = Some(next.clone());
        seq.auto_execution_schedule = None;
        seq.history
            .push(HistoryItem::open(next.clone(), type_name, trigger.clone(), drive.now));
        drive.entered.push(next.clone());

        info!(
            workflow_id = %drive.workflow_id,
            step_id = %next,
            step_type = type_name,
            trigger = %trigger,
            "Entered step"
        );
        self.publish(WorkflowEvent::StepEntered {
            workflow_id: drive.workflow_id.clone(),
            step_id: next.clone(),
            trigger,
        });

        if parallel {
            graph.for_each_branch(&next, |graph, branch| {
                branch.rewind();
                let head = branch.first_step.clone();
                graph.reset_from(&head)?;
                self.enter(drive, graph, branch, head, Trigger::Start)
            })?;
        }

        if let Some(outcome) = terminal {
            seq.close_open_item(drive.now);
            seq.current_step = None;
            seq.completed = true;
            seq.canceled = outcome == Outcome::Canceled;
        }
        Ok(())
    }

    fn finish(&self, workflow: &Workflow, drive: Drive<'_>) -> DriveReport {
        let seq = &workflow.sequence;
        let outcome = if seq.canceled {
            DriveOutcome::Canceled
        } else if seq.completed {
            DriveOutcome::Completed
        } else {
            match &seq.current_step {
                Some(step) => DriveOutcome::Waiting {
                    step: step.clone(),
                    retry_at: seq.auto_execution_schedule,
                },
                None => DriveOutcome::Completed,
            }
        };

        let ended_now = !drive.was_finished && seq.is_finished();
        if ended_now {
            info!(workflow_id = %workflow.id, outcome = ?outcome, "Workflow finished");
            let event = if seq.canceled {
                WorkflowEvent::WorkflowCanceled {
                    workflow_id: workflow.id.clone(),
                }
            } else {
                WorkflowEvent::WorkflowCompleted {
                    workflow_id: workflow.id.clone(),
                }
            };
            self.publish(event);
        }

        DriveReport {
            entered: drive.entered,
            outcome,
        }
    }
}

impl<'a> Drive<'a> {
    fn new(workflow: &Workflow, object: &'a dyn BusinessObject, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow.id.clone(),
            object,
            now,
            entered: Vec::new(),
            was_finished: workflow.is_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use stepwise_core::FieldObject;

    use crate::graph::{ButtonSpec, FieldCondition, FieldExpectation};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    fn workflow(steps: Vec<Step>, first: &str) -> Workflow {
        Workflow::new("test", StepGraph::from_steps(steps).unwrap(), first)
    }

    fn ids(items: &[HistoryItem]) -> Vec<&str> {
        items.iter().map(|h| h.step_id.as_str()).collect()
    }

    fn approval() -> Workflow {
        workflow(
            vec![
                Step::placeholder("intake", "Intake").then("draft"),
                Step::release("draft", "Draft", ButtonSpec::new("submit", "Submit"))
                    .then("review")
                    .with_undo(ButtonSpec::new("back-to-draft", "Back to draft")),
                Step::true_false(
                    "review",
                    "Review",
                    ButtonSpec::new("approve", "Approve"),
                    ButtonSpec::new("reject", "Reject"),
                )
                .branches("approved", "rejected"),
                Step::last("approved", "Approved"),
                Step::new(
                    "rejected",
                    "Rejected",
                    StepKind::Last {
                        outcome: Outcome::Canceled,
                    },
                ),
            ],
            "intake",
        )
    }

    fn reviews() -> Workflow {
        workflow(
            vec![
                Step::parallel("p", "Reviews", vec!["legal".into(), "finance".into()]).then("end"),
                Step::release("legal", "Legal", ButtonSpec::new("legal-ok", "Legal OK"))
                    .then("legal-end"),
                Step::last("legal-end", "Legal done"),
                Step::release("finance", "Finance", ButtonSpec::new("finance-ok", "Finance OK"))
                    .then("finance-end"),
                Step::last("finance-end", "Finance done"),
                Step::last("end", "End"),
                Step::new(
                    "canceled",
                    "Canceled",
                    StepKind::Last {
                        outcome: Outcome::Canceled,
                    },
                ),
            ],
            "p",
        )
        .with_cancel_step("canceled")
    }

    fn branch(wf: &Workflow, parallel: &str, index: usize) -> StepSequence {
        wf.graph.step(&parallel.into()).unwrap().branches_ref()[index].clone()
    }

    #[test]
    fn test_start_chains_through_placeholders() {
        let engine = WorkflowEngine::default();
        let mut wf = approval();
        let obj = FieldObject::new("doc");

        let report = engine.start(&mut wf, &obj, at(9)).unwrap();
        assert_eq!(report.entered, vec![StepId::from("intake"), StepId::from("draft")]);
        assert_eq!(
            report.outcome,
            DriveOutcome::Waiting {
                step: "draft".into(),
                retry_at: None
            }
        );

        let history = wf.history();
        assert_eq!(ids(history), vec!["intake", "draft"]);
        assert_eq!(history[0].trigger, Trigger::Start);
        assert_eq!(history[0].exited_at, Some(at(9)));
        assert_eq!(history[1].trigger, Trigger::Auto);
        assert!(history[1].is_open());
    }

    #[test]
    fn test_start_twice_rejected() {
        let engine = WorkflowEngine::default();
        let mut wf = approval();
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        assert!(matches!(
            engine.start(&mut wf, &obj, at(9)),
            Err(StepwiseError::Workflow(_))
        ));
    }

    #[test]
    fn test_tick_before_start_rejected() {
        let engine = WorkflowEngine::default();
        let mut wf = approval();
        assert!(engine.tick(&mut wf, &FieldObject::new("doc"), at(9)).is_err());
    }

    #[test]
    fn test_click_through_choice_to_terminal() {
        let engine = WorkflowEngine::default();
        let mut wf = approval();
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();

        engine
            .click(&mut wf, &obj, ButtonClick::new("submit"), at(10))
            .unwrap();
        assert_eq!(wf.sequence.current_step, Some("review".into()));

        let outcome = engine
            .click(
                &mut wf,
                &obj,
                ButtonClick::new("approve").with_input("fine by me"),
                at(11),
            )
            .unwrap();
        match outcome {
            ClickOutcome::Handled(report) => assert_eq!(report.outcome, DriveOutcome::Completed),
            other => panic!("unexpected {:?}", other),
        }
        assert!(wf.is_completed());
        assert!(wf.sequence.current_step.is_none());
        assert!(wf.history().iter().all(|h| !h.is_open()));
        assert_eq!(
            wf.history()[3].trigger,
            Trigger::Button(ButtonClick::new("approve").with_input("fine by me"))
        );
    }

    #[test]
    fn test_canceled_terminal() {
        let engine = WorkflowEngine::default();
        let mut wf = approval();
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        engine.click(&mut wf, &obj, ButtonClick::new("submit"), at(10)).unwrap();

        let outcome = engine.click(&mut wf, &obj, ButtonClick::new("reject"), at(11)).unwrap();
        assert!(matches!(
            outcome,
            ClickOutcome::Handled(DriveReport {
                outcome: DriveOutcome::Canceled,
                ..
            })
        ));
        assert!(wf.is_canceled());
    }

    #[test]
    fn test_unknown_button() {
        let engine = WorkflowEngine::default();
        let mut wf = approval();
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();

        // `approve` belongs to a step that is not active yet.
        assert!(matches!(
            engine.click(&mut wf, &obj, ButtonClick::new("approve"), at(10)),
            Err(StepwiseError::ButtonNotFound(_))
        ));
    }

    #[test]
    fn test_wait_until_defers_and_tick_advances() {
        let engine = WorkflowEngine::default();
        let mut wf = workflow(
            vec![
                Step::wait_until("cool-off", "Cooling-off period", at(12)).then("end"),
                Step::last("end", "End"),
            ],
            "cool-off",
        );
        let obj = FieldObject::new("doc");

        let report = engine.start(&mut wf, &obj, at(9)).unwrap();
        assert_eq!(
            report.outcome,
            DriveOutcome::Waiting {
                step: "cool-off".into(),
                retry_at: Some(at(12))
            }
        );
        assert!(!wf.is_due(at(11)));
        assert!(wf.is_due(at(12)));

        let early = engine.tick(&mut wf, &obj, at(10)).unwrap();
        assert_eq!(early.outcome, report.outcome);
        assert!(early.entered.is_empty());

        let due = engine.tick(&mut wf, &obj, at(12)).unwrap();
        assert_eq!(due.outcome, DriveOutcome::Completed);
        assert_eq!(wf.history()[1].trigger, Trigger::Schedule);
        assert_eq!(wf.history()[0].duration(), Some(chrono::Duration::hours(3)));
    }

    #[test]
    fn test_plain_wait_keeps_schedule() {
        let engine = WorkflowEngine::default();
        let mut wf = workflow(
            vec![
                Step::wait_for_fields(
                    "paid",
                    "Wait for payment",
                    FieldCondition::AllMustMatch,
                    vec![FieldExpectation::new("status", json!("paid"))],
                )
                .then("end"),
                Step::last("end", "End"),
            ],
            "paid",
        );
        let mut obj = FieldObject::new("invoice").with("status", json!("open"));
        engine.start(&mut wf, &obj, at(9)).unwrap();

        wf.sequence.auto_execution_schedule = Some(at(10));
        engine.tick(&mut wf, &obj, at(10)).unwrap();
        assert_eq!(wf.auto_execution_schedule(), Some(at(10)));

        obj.set_str("status", "paid");
        let report = engine.tick(&mut wf, &obj, at(11)).unwrap();
        assert_eq!(report.outcome, DriveOutcome::Completed);
    }

    #[test]
    fn test_missing_field_propagates() {
        let engine = WorkflowEngine::default();
        let mut wf = workflow(
            vec![
                Step::wait_for_fields(
                    "paid",
                    "Wait for payment",
                    FieldCondition::AllMustMatch,
                    vec![FieldExpectation::new("status", json!("paid"))],
                )
                .then("end"),
                Step::last("end", "End"),
            ],
            "paid",
        );
        let err = engine
            .start(&mut wf, &FieldObject::new("invoice"), at(9))
            .unwrap_err();
        assert!(matches!(err, StepwiseError::KeyNotFound { .. }));
    }

    #[test]
    fn test_draft_release_rejected_until_form_submitted() {
        let bus = Arc::new(EventBus::new(32));
        let mut rx = bus.subscribe();
        let engine = WorkflowEngine::default().with_event_bus(bus);
        let mut wf = workflow(
            vec![
                Step::draft_release("memo", "Write memo", ButtonSpec::new("publish", "Publish"))
                    .then("end"),
                Step::last("end", "End"),
            ],
            "memo",
        );
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        let before = wf.clone();

        let outcome = engine.click(&mut wf, &obj, ButtonClick::new("publish"), at(10)).unwrap();
        assert!(matches!(outcome, ClickOutcome::Rejected { .. }));
        assert_eq!(wf, before);

        let mut rejected = false;
        while let Ok(event) = rx.try_recv() {
            rejected |= matches!(event, WorkflowEvent::ButtonRejected { .. });
        }
        assert!(rejected);

        wf.submit_form(&"memo".into(), json!({"text": "hello"})).unwrap();
        let outcome = engine.click(&mut wf, &obj, ButtonClick::new("publish"), at(10)).unwrap();
        assert!(matches!(outcome, ClickOutcome::Handled(_)));
        assert!(wf.is_completed());
    }

    struct Guard {
        fatal: bool,
    }

    impl ButtonAction for Guard {
        fn on_click(
            &self,
            _step: &Step,
            click: &ButtonClick,
            _object: &dyn BusinessObject,
        ) -> Result<()> {
            if self.fatal {
                return Err(StepwiseError::Database("connection lost".into()));
            }
            match click.input.as_deref() {
                Some(reason) if !reason.is_empty() => Ok(()),
                _ => Err(StepwiseError::Application("A reason is required".into())),
            }
        }
    }

    #[test]
    fn test_button_action_failures() {
        let mut engine = WorkflowEngine::default();
        engine.register_action("submit", Arc::new(Guard { fatal: false }));
        let mut wf = approval();
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();

        let outcome = engine.click(&mut wf, &obj, ButtonClick::new("submit"), at(10)).unwrap();
        assert_eq!(
            outcome,
            ClickOutcome::Rejected {
                message: "A reason is required".into()
            }
        );
        assert_eq!(wf.sequence.current_step, Some("draft".into()));

        let click = ButtonClick::new("submit").with_input("ready");
        engine.click(&mut wf, &obj, click, at(10)).unwrap();
        assert_eq!(wf.sequence.current_step, Some("review".into()));

        let mut fatal = WorkflowEngine::default();
        fatal.register_action("approve", Arc::new(Guard { fatal: true }));
        assert!(fatal
            .click(&mut wf, &obj, ButtonClick::new("approve"), at(11))
            .is_err());
    }

    #[test]
    fn test_parallel_branches_complete_independently() {
        let engine = WorkflowEngine::default();
        let mut wf = reviews();
        let obj = FieldObject::new("contract");

        let report = engine.start(&mut wf, &obj, at(9)).unwrap();
        assert_eq!(
            report.entered,
            vec![StepId::from("p"), StepId::from("legal"), StepId::from("finance")]
        );

        engine.click(&mut wf, &obj, ButtonClick::new("legal-ok"), at(10)).unwrap();
        assert!(branch(&wf, "p", 0).completed);
        assert!(!branch(&wf, "p", 1).completed);
        assert_eq!(wf.sequence.current_step, Some("p".into()));

        let outcome = engine
            .click(&mut wf, &obj, ButtonClick::new("finance-ok"), at(11))
            .unwrap();
        match outcome {
            ClickOutcome::Handled(report) => {
                assert_eq!(report.entered, vec![StepId::from("finance-end"), StepId::from("end")]);
                assert_eq!(report.outcome, DriveOutcome::Completed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ids(wf.history()), vec!["p", "end"]);
        assert_eq!(ids(&branch(&wf, "p", 1).history), vec!["finance", "finance-end"]);
    }

    #[test]
    fn test_parallel_retries_at_soonest_branch() {
        let engine = WorkflowEngine::default();
        let mut wf = workflow(
            vec![
                Step::parallel("p", "Waits", vec!["slow".into(), "fast".into()]).then("end"),
                Step::wait_until("slow", "Slow", at(12)).then("slow-end"),
                Step::last("slow-end", "Slow done"),
                Step::wait_until("fast", "Fast", at(11)).then("fast-end"),
                Step::last("fast-end", "Fast done"),
                Step::last("end", "End"),
            ],
            "p",
        );
        let obj = FieldObject::new("doc");

        let report = engine.start(&mut wf, &obj, at(9)).unwrap();
        assert_eq!(
            report.outcome,
            DriveOutcome::Waiting {
                step: "p".into(),
                retry_at: Some(at(11))
            }
        );

        let report = engine.tick(&mut wf, &obj, at(11)).unwrap();
        assert_eq!(report.entered, vec![StepId::from("fast-end")]);
        assert_eq!(wf.auto_execution_schedule(), Some(at(12)));
        assert_eq!(branch(&wf, "p", 1).history[1].trigger, Trigger::Schedule);

        let report = engine.tick(&mut wf, &obj, at(12)).unwrap();
        assert_eq!(report.outcome, DriveOutcome::Completed);
    }

    #[test]
    fn test_parallel_schedule_cleared_when_timer_branch_finishes() {
        let engine = WorkflowEngine::default();
        let mut wf = workflow(
            vec![
                Step::parallel("p", "Mixed", vec!["timer".into(), "btn".into()]).then("end"),
                Step::wait_until("timer", "Timer", at(11)).then("timer-end"),
                Step::last("timer-end", "Timer done"),
                Step::release("btn", "Button", ButtonSpec::new("go", "Go")).then("btn-end"),
                Step::last("btn-end", "Button done"),
                Step::last("end", "End"),
            ],
            "p",
        );
        let obj = FieldObject::new("doc");

        engine.start(&mut wf, &obj, at(9)).unwrap();
        assert_eq!(wf.auto_execution_schedule(), Some(at(11)));

        let report = engine.tick(&mut wf, &obj, at(11)).unwrap();
        assert_eq!(report.entered, vec![StepId::from("timer-end")]);
        assert_eq!(
            report.outcome,
            DriveOutcome::Waiting {
                step: "p".into(),
                retry_at: None
            }
        );
        assert_eq!(wf.auto_execution_schedule(), None);
        assert!(!wf.is_due(at(14)));

        engine.click(&mut wf, &obj, ButtonClick::new("go"), at(12)).unwrap();
        assert!(wf.is_completed());
    }

    #[test]
    fn test_click_checks_release_preconditions() {
        let engine = WorkflowEngine::default();
        let mut gated = Step::release("r", "Release", ButtonSpec::new("go", "Go")).then("end");
        if let StepKind::WaitForRelease { required_fields, .. } = &mut gated.kind {
            required_fields.push("approver".into());
        }
        let mut wf = workflow(vec![gated, Step::last("end", "End")], "r");
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        assert!(engine.offered_buttons(&wf, &obj).unwrap().is_empty());

        let outcome = engine.click(&mut wf, &obj, ButtonClick::new("go"), at(10)).unwrap();
        assert!(matches!(
            outcome,
            ClickOutcome::Rejected { ref message } if message.contains("approver")
        ));
        assert_eq!(wf.current_step().map(|s| s.id.as_str()), Some("r"));

        let mut dirty = FieldObject::new("doc").with("approver", json!("kim"));
        dirty.mark_pending_changes(true);
        assert!(matches!(
            engine.click(&mut wf, &dirty, ButtonClick::new("go"), at(10)),
            Err(StepwiseError::Workflow(_))
        ));
        let mut gone = FieldObject::new("doc").with("approver", json!("kim"));
        gone.mark_deleted();
        assert!(engine.click(&mut wf, &gone, ButtonClick::new("go"), at(10)).is_err());
        assert!(!wf.is_finished());

        let ready = FieldObject::new("doc").with("approver", json!("kim"));
        let outcome = engine.click(&mut wf, &ready, ButtonClick::new("go"), at(11)).unwrap();
        assert!(matches!(outcome, ClickOutcome::Handled(_)));
        assert!(wf.is_completed());
    }

    #[test]
    fn test_undo_appends_history() {
        let engine = WorkflowEngine::default();
        let mut wf = approval();
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        engine.click(&mut wf, &obj, ButtonClick::new("submit"), at(10)).unwrap();

        let offered: Vec<String> = engine
            .undo_buttons(&wf)
            .into_iter()
            .map(|u| u.button.id)
            .collect();
        assert_eq!(offered, vec!["back-to-draft"]);

        let before = wf.history().len();
        let report = engine.undo(&mut wf, &obj, "back-to-draft", at(11)).unwrap();
        assert_eq!(
            report.outcome,
            DriveOutcome::Waiting {
                step: "draft".into(),
                retry_at: None
            }
        );
        assert!(wf.history().len() > before);
        assert_eq!(ids(wf.history()), vec!["intake", "draft", "review", "draft"]);
        assert_eq!(wf.history()[1].exited_at, Some(at(10)));
        assert_eq!(wf.history()[2].exited_at, Some(at(11)));
        assert_eq!(
            wf.history()[3].trigger,
            Trigger::Undo {
                button: "back-to-draft".into()
            }
        );

        // Back on the target: its own undo button is no longer offered.
        assert!(engine.undo_buttons(&wf).is_empty());
        assert!(engine.undo(&mut wf, &obj, "back-to-draft", at(12)).is_err());
    }

    #[test]
    fn test_undo_resets_draft_form() {
        let engine = WorkflowEngine::default();
        let mut wf = workflow(
            vec![
                Step::draft_release("memo", "Memo", ButtonSpec::new("publish", "Publish"))
                    .then("sign")
                    .with_undo(ButtonSpec::new("rewrite", "Rewrite memo")),
                Step::release("sign", "Sign", ButtonSpec::new("sign", "Sign")).then("end"),
                Step::last("end", "End"),
            ],
            "memo",
        );
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        wf.submit_form(&"memo".into(), json!({"text": "v1"})).unwrap();
        engine.click(&mut wf, &obj, ButtonClick::new("publish"), at(10)).unwrap();

        engine.undo(&mut wf, &obj, "rewrite", at(11)).unwrap();
        let outcome = engine.click(&mut wf, &obj, ButtonClick::new("publish"), at(12)).unwrap();
        assert!(matches!(outcome, ClickOutcome::Rejected { .. }));
    }

    #[test]
    fn test_undo_inside_branch() {
        let engine = WorkflowEngine::default();
        let mut wf = workflow(
            vec![
                Step::parallel("p", "Reviews", vec!["check".into(), "other".into()]).then("end"),
                Step::release("check", "Check", ButtonSpec::new("checked", "Checked"))
                    .then("confirm")
                    .with_undo(ButtonSpec::new("recheck", "Check again")),
                Step::release("confirm", "Confirm", ButtonSpec::new("confirmed", "Confirmed"))
                    .then("check-end"),
                Step::last("check-end", "Done"),
                Step::release("other", "Other", ButtonSpec::new("other-ok", "OK")).then("other-end"),
                Step::last("other-end", "Done"),
                Step::last("end", "End"),
            ],
            "p",
        );
        let obj = FieldObject::new("doc");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        engine.click(&mut wf, &obj, ButtonClick::new("checked"), at(10)).unwrap();

        let undo = engine.undo_buttons(&wf);
        assert_eq!(undo.len(), 1);
        assert_eq!(undo[0].path.len(), 1);

        engine.undo(&mut wf, &obj, "recheck", at(11)).unwrap();
        let b = branch(&wf, "p", 0);
        assert_eq!(b.current_step, Some("check".into()));
        assert_eq!(ids(&b.history), vec!["check", "confirm", "check"]);
        assert_eq!(wf.sequence.current_step, Some("p".into()));
    }

    #[test]
    fn test_cancel_resets_branches() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let engine = WorkflowEngine::default().with_event_bus(bus);
        let mut wf = reviews();
        let obj = FieldObject::new("contract");
        engine.start(&mut wf, &obj, at(9)).unwrap();
        engine.click(&mut wf, &obj, ButtonClick::new("legal-ok"), at(10)).unwrap();

        engine.cancel(&mut wf, at(11)).unwrap();
        assert!(wf.is_canceled());
        assert!(wf.sequence.current_step.is_none());
        assert_eq!(ids(wf.history()), vec!["p", "canceled"]);
        assert!(wf.all_history().iter().all(|h| !h.is_open()));
        for index in 0..2 {
            let b = branch(&wf, "p", index);
            assert!(b.current_step.is_none());
            assert!(!b.completed);
            assert!(!b.history.is_empty());
        }

        assert!(matches!(
            engine.click(&mut wf, &obj, ButtonClick::new("finance-ok"), at(12)),
            Err(StepwiseError::Workflow(_))
        ));
        assert!(engine.cancel(&mut wf, at(12)).is_err());

        let mut canceled = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkflowEvent::WorkflowCanceled { .. }) {
                canceled += 1;
            }
        }
        assert_eq!(canceled, 1);
    }

    #[test]
    fn test_chain_cap() {
        let steps = vec![
            Step::placeholder("a", "A").then("b"),
            Step::placeholder("b", "B").then("a"),
        ];
        let engine = WorkflowEngine::new(EngineConfig {
            max_chain_length: Some(10),
            chain_warn_threshold: 5,
        });
        let mut wf = workflow(steps, "a");
        let err = engine
            .start(&mut wf, &FieldObject::new("doc"), at(9))
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Configuration(_)));
        assert_eq!(wf.history().len(), 11);
    }

    #[test]
    fn test_events_in_order() {
        let bus = Arc::new(EventBus::new(32));
        let mut rx = bus.subscribe();
        let engine = WorkflowEngine::default().with_event_bus(bus);
        let mut wf = workflow(
            vec![
                Step::placeholder("a", "A").then("end"),
                Step::last("end", "End"),
            ],
            "a",
        );
        engine.start(&mut wf, &FieldObject::new("doc"), at(9)).unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                WorkflowEvent::WorkflowStarted { .. } => "started",
                WorkflowEvent::StepEntered { .. } => "entered",
                WorkflowEvent::WorkflowCompleted { .. } => "completed",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["started", "entered", "entered", "completed"]);

        // Ticking a finished workflow is a no-op and publishes nothing.
        let report = engine.tick(&mut wf, &FieldObject::new("doc"), at(10)).unwrap();
        assert_eq!(report.outcome, DriveOutcome::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_terminal_reachable_from_every_step() {
        let wf = approval();
        crate::graph::validate(&wf.graph, wf.first_step(), Default::default()).unwrap();
        for step in wf.graph.iter() {
            let mut current = step.id.clone();
            let mut hops = 0;
            while let Some(next) = wf.graph.step(&current).unwrap().next_step_ids().first() {
                current = next.clone();
                hops += 1;
                assert!(hops <= wf.graph.len());
            }
            assert!(wf.graph.step(&current).unwrap().is_terminal());
        }
    }
}
