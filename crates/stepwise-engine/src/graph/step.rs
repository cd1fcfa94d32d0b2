use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{BusinessObject, DurationStats};
use stepwise_core::types::{StepId, StepResult};

use super::condition::{evaluate_fields, FieldCondition, FieldExpectation};
use super::sequence::StepSequence;

/// A button a step exposes to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonSpec {
    /// Sender identity reported back on click.
    pub id: String,
    pub label: String,
    /// Prompt asking for free-text input when clicked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl ButtonSpec {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// One labelled exit of a `ButtonChoice`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub button: ButtonSpec,
    #[serde(default)]
    pub next: Option<StepId>,
}

/// How a terminal step ends its sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Completed,
    Canceled,
}

/// Closed set of step kinds and their typed outgoing edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Advances immediately.
    Placeholder {
        #[serde(default)]
        next: Option<StepId>,
    },
    /// Waits until its release button is clicked.
    WaitForRelease {
        #[serde(default)]
        next: Option<StepId>,
        button: ButtonSpec,
        /// Fields the object must carry before the button is offered.
        #[serde(default)]
        required_fields: Vec<String>,
    },
    /// Like `WaitForRelease`, but the click only counts once the attached
    /// form was submitted.
    WaitForDraftRelease {
        #[serde(default)]
        next: Option<StepId>,
        button: ButtonSpec,
        #[serde(default)]
        required_fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_form_data: Option<serde_json::Value>,
    },
    /// Advances once the configured time is reached.
    WaitUntil {
        #[serde(default)]
        next: Option<StepId>,
        at: DateTime<Utc>,
    },
    /// Advances once the object's field values satisfy the condition.
    WaitForFieldValues {
        #[serde(default)]
        next: Option<StepId>,
        condition: FieldCondition,
        fields: Vec<FieldExpectation>,
        #[serde(default)]
        ignore_missing: bool,
    },
    /// Branches on one of its option buttons. Exactly two options are
    /// supported; other arities are rejected by validation.
    ButtonChoice { options: Vec<ChoiceOption> },
    /// Two-way branch selected by an externally supplied boolean.
    TrueFalseChoice {
        #[serde(default)]
        if_true: Option<StepId>,
        #[serde(default)]
        if_false: Option<StepId>,
        true_button: ButtonSpec,
        false_button: ButtonSpec,
    },
    /// Runs independent sub-sequences and continues once all completed.
    Parallelism {
        #[serde(default)]
        next: Option<StepId>,
        branches: Vec<StepSequence>,
    },
    /// Terminal step: no outgoing edges.
    Last {
        #[serde(default)]
        outcome: Outcome,
    },
}

/// Inputs available to a step while executing.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub object: &'a dyn BusinessObject,
    pub now: DateTime<Utc>,
}

impl<'a> StepContext<'a> {
    pub fn new(object: &'a dyn BusinessObject, now: DateTime<Utc>) -> Self {
        Self { object, now }
    }
}

/// A node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    /// Undo buttons this step offers once the workflow has moved past it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub undo_buttons: Vec<ButtonSpec>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn new(id: impl Into<StepId>, title: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            icon_url: None,
            undo_buttons: vec![],
            kind,
        }
    }

    pub fn placeholder(id: impl Into<StepId>, title: impl Into<String>) -> Self {
        Self::new(id, title, StepKind::Placeholder { next: None })
    }

    pub fn release(id: impl Into<StepId>, title: impl Into<String>, button: ButtonSpec) -> Self {
        Self::new(
            id,
            title,
            StepKind::WaitForRelease {
                next: None,
                button,
                required_fields: vec![],
            },
        )
    }

    pub fn draft_release(
        id: impl Into<StepId>,
        title: impl Into<String>,
        button: ButtonSpec,
    ) -> Self {
        Self::new(
            id,
            title,
            StepKind::WaitForDraftRelease {
                next: None,
                button,
                required_fields: vec![],
                updated_form_data: None,
            },
        )
    }

    pub fn wait_until(id: impl Into<StepId>, title: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(id, title, StepKind::WaitUntil { next: None, at })
    }

    pub fn wait_for_fields(
        id: impl Into<StepId>,
        title: impl Into<String>,
        condition: FieldCondition,
        fields: Vec<FieldExpectation>,
    ) -> Self {
        Self::new(
            id,
            title,
            StepKind::WaitForFieldValues {
                next: None,
                condition,
                fields,
                ignore_missing: false,
            },
        )
    }

    pub fn true_false(
        id: impl Into<StepId>,
        title: impl Into<String>,
        true_button: ButtonSpec,
        false_button: ButtonSpec,
    ) -> Self {
        Self::new(
            id,
            title,
            StepKind::TrueFalseChoice {
                if_true: None,
                if_false: None,
                true_button,
                false_button,
            },
        )
    }

    pub fn parallel(
        id: impl Into<StepId>,
        title: impl Into<String>,
        branch_heads: Vec<StepId>,
    ) -> Self {
        Self::new(
            id,
            title,
            StepKind::Parallelism {
                next: None,
                branches: branch_heads.into_iter().map(StepSequence::new).collect(),
            },
        )
    }

    pub fn last(id: impl Into<StepId>, title: impl Into<String>) -> Self {
        Self::new(
            id,
            title,
            StepKind::Last {
                outcome: Outcome::Completed,
            },
        )
    }

    /// Point the single outgoing edge at `next`. Branching and terminal
    /// steps are returned unchanged.
    pub fn then(mut self, next: impl Into<StepId>) -> Self {
        if let Some(slot) = self.next_slot_mut() {
            *slot = Some(next.into());
        }
        self
    }

    /// Set both edges of a two-way choice, in option order.
    pub fn branches(mut self, first: impl Into<StepId>, second: impl Into<StepId>) -> Self {
        match &mut self.kind {
            StepKind::TrueFalseChoice {
                if_true, if_false, ..
            } => {
                *if_true = Some(first.into());
                *if_false = Some(second.into());
            }
            StepKind::ButtonChoice { options } => {
                if let Some(o) = options.get_mut(0) {
                    o.next = Some(first.into());
                }
                if let Some(o) = options.get_mut(1) {
                    o.next = Some(second.into());
                }
            }
            _ => {}
        }
        self
    }

    pub fn with_undo(mut self, button: ButtonSpec) -> Self {
        self.undo_buttons.push(button);
        self
    }

    pub fn with_icon(mut self, url: impl Into<String>) -> Self {
        self.icon_url = Some(url.into());
        self
    }

    /// Type tag used for analytics and rendering.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            StepKind::Placeholder { .. } => "placeholder",
            StepKind::WaitForRelease { .. } => "wait_for_release",
            StepKind::WaitForDraftRelease { .. } => "wait_for_draft_release",
            StepKind::WaitUntil { .. } => "wait_until",
            StepKind::WaitForFieldValues { .. } => "wait_for_field_values",
            StepKind::ButtonChoice { .. } => "button_choice",
            StepKind::TrueFalseChoice { .. } => "true_false_choice",
            StepKind::Parallelism { .. } => "parallelism",
            StepKind::Last { .. } => "last",
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Icon shown next to the step; falls back to one icon per kind.
    pub fn icon_url(&self) -> String {
        self.icon_url
            .clone()
            .unwrap_or_else(|| format!("icons/{}.svg", self.type_name()))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StepKind::Last { .. })
    }

    pub fn is_choice(&self) -> bool {
        matches!(
            self.kind,
            StepKind::ButtonChoice { .. } | StepKind::TrueFalseChoice { .. }
        )
    }

    /// Full out-edge set, in edge order. Unset edges appear as `None`.
    pub fn possible_next_steps(&self) -> Vec<Option<StepId>> {
        match &self.kind {
            StepKind::Placeholder { next }
            | StepKind::WaitForRelease { next, .. }
            | StepKind::WaitForDraftRelease { next, .. }
            | StepKind::WaitUntil { next, .. }
            | StepKind::WaitForFieldValues { next, .. }
            | StepKind::Parallelism { next, .. } => vec![next.clone()],
            StepKind::ButtonChoice { options } => options.iter().map(|o| o.next.clone()).collect(),
            StepKind::TrueFalseChoice {
                if_true, if_false, ..
            } => vec![if_true.clone(), if_false.clone()],
            StepKind::Last { .. } => vec![],
        }
    }

    /// Set edges only, in edge order.
    pub fn next_step_ids(&self) -> Vec<StepId> {
        self.possible_next_steps().into_iter().flatten().collect()
    }

    /// Rewire every edge equal to `old`. Returns whether any edge matched.
    pub fn replace_possible_next_step(&mut self, old: &StepId, new: &StepId) -> bool {
        let mut replaced = false;
        let mut swap = |slot: &mut Option<StepId>| {
            if slot.as_ref() == Some(old) {
                *slot = Some(new.clone());
                replaced = true;
            }
        };
        match &mut self.kind {
            StepKind::Placeholder { next }
            | StepKind::WaitForRelease { next, .. }
            | StepKind::WaitForDraftRelease { next, .. }
            | StepKind::WaitUntil { next, .. }
            | StepKind::WaitForFieldValues { next, .. }
            | StepKind::Parallelism { next, .. } => swap(next),
            StepKind::ButtonChoice { options } => {
                for option in options.iter_mut() {
                    swap(&mut option.next);
                }
            }
            StepKind::TrueFalseChoice {
                if_true, if_false, ..
            } => {
                swap(if_true);
                swap(if_false);
            }
            StepKind::Last { .. } => {}
        }
        replaced
    }

    /// Clear every edge pointing at `target`. Returns whether any matched.
    pub(crate) fn detach_edges_to(&mut self, target: &StepId) -> bool {
        let mut detached = false;
        let mut clear = |slot: &mut Option<StepId>| {
            if slot.as_ref() == Some(target) {
                *slot = None;
                detached = true;
            }
        };
        match &mut self.kind {
            StepKind::Placeholder { next }
            | StepKind::WaitForRelease { next, .. }
            | StepKind::WaitForDraftRelease { next, .. }
            | StepKind::WaitUntil { next, .. }
            | StepKind::WaitForFieldValues { next, .. }
            | StepKind::Parallelism { next, .. } => clear(next),
            StepKind::ButtonChoice { options } => {
                for option in options.iter_mut() {
                    clear(&mut option.next);
                }
            }
            StepKind::TrueFalseChoice {
                if_true, if_false, ..
            } => {
                clear(if_true);
                clear(if_false);
            }
            StepKind::Last { .. } => {}
        }
        detached
    }

    /// The single outgoing edge of non-branching steps.
    pub fn next_slot_mut(&mut self) -> Option<&mut Option<StepId>> {
        match &mut self.kind {
            StepKind::Placeholder { next }
            | StepKind::WaitForRelease { next, .. }
            | StepKind::WaitForDraftRelease { next, .. }
            | StepKind::WaitUntil { next, .. }
            | StepKind::WaitForFieldValues { next, .. }
            | StepKind::Parallelism { next, .. } => Some(next),
            StepKind::ButtonChoice { .. }
            | StepKind::TrueFalseChoice { .. }
            | StepKind::Last { .. } => None,
        }
    }

    /// Branch sequences of a parallelism step.
    pub fn branches_ref(&self) -> &[StepSequence] {
        match &self.kind {
            StepKind::Parallelism { branches, .. } => branches,
            _ => &[],
        }
    }

    /// Execute the step against the associated object.
    ///
    /// For `Parallelism` the branches must have been driven by the engine
    /// already; this only evaluates their completion.
    pub fn execute(&self, ctx: &StepContext<'_>) -> Result<StepResult> {
        match &self.kind {
            StepKind::Placeholder { next } => self.advance_to(next),
            StepKind::WaitForRelease { .. }
            | StepKind::WaitForDraftRelease { .. }
            | StepKind::ButtonChoice { .. }
            | StepKind::TrueFalseChoice { .. }
            | StepKind::Last { .. } => Ok(StepResult::Wait),
            StepKind::WaitUntil { next, at } => {
                if ctx.now >= *at {
                    self.advance_to(next)
                } else {
                    Ok(StepResult::wait_until(*at))
                }
            }
            StepKind::WaitForFieldValues {
                next,
                condition,
                fields,
                ignore_missing,
            } => {
                if evaluate_fields(*condition, fields, ctx.object, *ignore_missing)? {
                    self.advance_to(next)
                } else {
                    Ok(StepResult::Wait)
                }
            }
            StepKind::Parallelism { next, branches } => {
                if branches.iter().all(|b| b.completed) {
                    return self.advance_to(next);
                }
                let soonest = branches
                    .iter()
                    .filter(|b| !b.completed)
                    .filter_map(|b| b.auto_execution_schedule)
                    .min();
                Ok(match soonest {
                    Some(retry_at) => StepResult::wait_until(retry_at),
                    None => StepResult::Wait,
                })
            }
        }
    }

    /// Buttons this step shows itself, excluding undo buttons and anything
    /// owned by nested branches.
    pub fn own_buttons(&self) -> Vec<&ButtonSpec> {
        match &self.kind {
            StepKind::WaitForRelease { button, .. }
            | StepKind::WaitForDraftRelease { button, .. } => vec![button],
            StepKind::ButtonChoice { options } => options.iter().map(|o| &o.button).collect(),
            StepKind::TrueFalseChoice {
                true_button,
                false_button,
                ..
            } => vec![true_button, false_button],
            StepKind::Placeholder { .. }
            | StepKind::WaitUntil { .. }
            | StepKind::WaitForFieldValues { .. }
            | StepKind::Parallelism { .. }
            | StepKind::Last { .. } => vec![],
        }
    }

    /// Result of clicking one of this step's own buttons.
    ///
    /// A draft release clicked before its form was submitted fails with an
    /// `Application` error, which the router reports back to the user.
    pub fn click(&self, button_id: &str) -> Result<StepResult> {
        match &self.kind {
            StepKind::WaitForRelease { next, button, .. } if button.id == button_id => {
                self.advance_to(next)
            }
            StepKind::WaitForDraftRelease {
                next,
                button,
                updated_form_data,
                ..
            } if button.id == button_id => {
                if updated_form_data.is_none() {
                    return Err(StepwiseError::Application(format!(
                        "Submit the form of '{}' before releasing it",
                        self.title
                    )));
                }
                self.advance_to(next)
            }
            StepKind::ButtonChoice { options } => {
                match options.iter().find(|o| o.button.id == button_id) {
                    Some(option) => self.advance_to(&option.next),
                    None => Err(StepwiseError::ButtonNotFound(button_id.to_string())),
                }
            }
            StepKind::TrueFalseChoice {
                if_true,
                if_false,
                true_button,
                false_button,
            } => {
                if true_button.id == button_id {
                    self.advance_to(if_true)
                } else if false_button.id == button_id {
                    self.advance_to(if_false)
                } else {
                    Err(StepwiseError::ButtonNotFound(button_id.to_string()))
                }
            }
            _ => Err(StepwiseError::ButtonNotFound(button_id.to_string())),
        }
    }

    /// Fields that must be present before this step's release button is
    /// offered.
    pub fn required_fields(&self) -> &[String] {
        match &self.kind {
            StepKind::WaitForRelease {
                required_fields, ..
            }
            | StepKind::WaitForDraftRelease {
                required_fields, ..
            } => required_fields,
            _ => &[],
        }
    }

    /// Record a submitted form on a draft release step.
    pub fn submit_form(&mut self, data: serde_json::Value) -> Result<()> {
        match &mut self.kind {
            StepKind::WaitForDraftRelease {
                updated_form_data, ..
            } => {
                *updated_form_data = Some(data);
                Ok(())
            }
            _ => Err(StepwiseError::Workflow(format!(
                "step '{}' has no form to submit",
                self.id
            ))),
        }
    }

    /// Rewind the step's own state. Parallel branches are reset by the
    /// graph, which owns the steps they point at.
    pub fn reset(&mut self) {
        if let StepKind::WaitForDraftRelease {
            updated_form_data, ..
        } = &mut self.kind
        {
            *updated_form_data = None;
        }
    }

    /// Typical time spent in this kind of step.
    pub fn average_duration(&self, stats: &dyn DurationStats) -> Result<Option<Duration>> {
        stats.average_duration(self.type_name())
    }

    fn advance_to(&self, next: &Option<StepId>) -> Result<StepResult> {
        match next {
            Some(id) => Ok(StepResult::Advance { next: id.clone() }),
            None => Err(StepwiseError::configuration(format!(
                "step '{}' has no next step",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use stepwise_core::FieldObject;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_replace_updates_both_choice_edges() {
        let mut choice = Step::true_false(
            "decide",
            "Decide",
            ButtonSpec::new("yes", "Yes"),
            ButtonSpec::new("no", "No"),
        )
        .branches("x", "x");

        assert!(choice.replace_possible_next_step(&"x".into(), &"y".into()));
        assert_eq!(
            choice.possible_next_steps(),
            vec![Some("y".into()), Some("y".into())]
        );
        assert!(!choice.replace_possible_next_step(&"x".into(), &"z".into()));
    }

    #[test]
    fn test_possible_next_steps_keeps_unset_edges() {
        let step = Step::placeholder("a", "A");
        assert_eq!(step.possible_next_steps(), vec![None]);
        assert!(step.next_step_ids().is_empty());
        assert!(Step::last("end", "End").possible_next_steps().is_empty());
    }

    #[test]
    fn test_wait_until_defers_then_advances() {
        let obj = FieldObject::new("doc");
        let step = Step::wait_until("w", "Cooling-off", at(12)).then("next");

        let early = step.execute(&StepContext::new(&obj, at(9))).unwrap();
        assert_eq!(early, StepResult::wait_until(at(12)));

        let due = step.execute(&StepContext::new(&obj, at(12))).unwrap();
        assert_eq!(due, StepResult::advance("next"));
    }

    #[test]
    fn test_execute_is_repeatable() {
        let obj = FieldObject::new("doc");
        let step = Step::wait_until("w", "Wait", at(12)).then("next");
        let ctx = StepContext::new(&obj, at(10));
        assert_eq!(step.execute(&ctx).unwrap(), step.execute(&ctx).unwrap());
    }

    #[test]
    fn test_placeholder_without_edge_is_configuration_error() {
        let obj = FieldObject::new("doc");
        let err = Step::placeholder("p", "P")
            .execute(&StepContext::new(&obj, at(9)))
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Configuration(_)));
    }

    #[test]
    fn test_release_never_resolves_from_execute() {
        let obj = FieldObject::new("doc");
        let step = Step::release("r", "Release", ButtonSpec::new("go", "Release")).then("n");
        assert_eq!(
            step.execute(&StepContext::new(&obj, at(9))).unwrap(),
            StepResult::Wait
        );
        assert_eq!(step.click("go").unwrap(), StepResult::advance("n"));
    }

    #[test]
    fn test_draft_release_requires_submitted_form() {
        let mut step =
            Step::draft_release("d", "Draft", ButtonSpec::new("publish", "Publish")).then("n");

        let err = step.click("publish").unwrap_err();
        assert!(err.is_recoverable());

        step.submit_form(json!({"summary": "ok"})).unwrap();
        assert_eq!(step.click("publish").unwrap(), StepResult::advance("n"));

        step.reset();
        assert!(step.click("publish").is_err());
    }

    #[test]
    fn test_true_false_click() {
        let step = Step::true_false(
            "c",
            "Approve?",
            ButtonSpec::new("approve", "Approve"),
            ButtonSpec::new("reject", "Reject"),
        )
        .branches("accepted", "rejected");

        assert_eq!(step.click("approve").unwrap(), StepResult::advance("accepted"));
        assert_eq!(step.click("reject").unwrap(), StepResult::advance("rejected"));
        assert!(matches!(
            step.click("other"),
            Err(StepwiseError::ButtonNotFound(_))
        ));
    }

    #[test]
    fn test_parallelism_waits_for_soonest_incomplete_branch() {
        let obj = FieldObject::new("doc");
        let mut step = Step::parallel("p", "Reviews", vec!["a".into(), "b".into(), "c".into()])
            .then("after");
        if let StepKind::Parallelism { branches, .. } = &mut step.kind {
            branches[0].completed = true;
            branches[0].auto_execution_schedule = Some(at(8));
            branches[1].auto_execution_schedule = Some(at(15));
            branches[2].auto_execution_schedule = Some(at(11));
        }

        let ctx = StepContext::new(&obj, at(9));
        assert_eq!(step.execute(&ctx).unwrap(), StepResult::wait_until(at(11)));

        if let StepKind::Parallelism { branches, .. } = &mut step.kind {
            for b in branches.iter_mut() {
                b.completed = true;
            }
        }
        assert_eq!(step.execute(&ctx).unwrap(), StepResult::advance("after"));
    }

    #[test]
    fn test_own_buttons() {
        let step = Step::parallel("p", "P", vec!["a".into()]);
        assert!(step.own_buttons().is_empty());

        let step = Step::true_false(
            "c",
            "C",
            ButtonSpec::new("t", "T"),
            ButtonSpec::new("f", "F"),
        );
        let ids: Vec<&str> = step.own_buttons().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["t", "f"]);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let step = Step::wait_until("w", "Wait", at(10))
            .then("next")
            .with_undo(ButtonSpec::new("undo-w", "Restart wait"));
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains(r#""type":"wait_until""#));

        let parsed: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, step);
        assert_eq!(parsed.icon_url(), "icons/wait_until.svg");
    }
}
