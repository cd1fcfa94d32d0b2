use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a step inside a workflow graph.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique workflow instance identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of executing a step.
///
/// There is deliberately no error state: failures travel as `Err` through
/// the surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    /// Move to the given step.
    Advance { next: StepId },
    /// Stay on the current step, leave the execution schedule untouched.
    Wait,
    /// Stay on the current step, retry no earlier than the given time.
    WaitUntil { retry_at: DateTime<Utc> },
}

impl StepResult {
    pub fn advance(next: impl Into<StepId>) -> Self {
        Self::Advance { next: next.into() }
    }

    pub fn wait_until(retry_at: DateTime<Utc>) -> Self {
        Self::WaitUntil { retry_at }
    }

    pub fn is_advance(&self) -> bool {
        matches!(self, Self::Advance { .. })
    }

    pub fn next_step(&self) -> Option<&StepId> {
        match self {
            Self::Advance { next } => Some(next),
            _ => None,
        }
    }
}

/// A button click raised by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonClick {
    /// Identity of the clicked button.
    pub sender: String,
    /// Free-text input from the button prompt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl ButtonClick {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// What caused a step to be entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// The sequence was started.
    Start,
    /// A scheduler tick re-executed the current step.
    Schedule,
    /// The previous step advanced without waiting for a new stimulus.
    Auto,
    /// A button was clicked.
    Button(ButtonClick),
    /// An undo button moved the sequence back.
    Undo { button: String },
    /// The workflow was canceled.
    Cancel,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Start => write!(f, "start"),
            Trigger::Schedule => write!(f, "schedule"),
            Trigger::Auto => write!(f, "auto"),
            Trigger::Button(click) => write!(f, "button:{}", click.sender),
            Trigger::Undo { button } => write!(f, "undo:{}", button),
            Trigger::Cancel => write!(f, "cancel"),
        }
    }
}

/// One traversal of a step. Closed once the step is exited and never
/// modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub step_id: StepId,
    /// Type tag of the step, used for average-duration analytics.
    pub step_type: String,
    pub trigger: Trigger,
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
}

impl HistoryItem {
    pub fn open(
        step_id: StepId,
        step_type: impl Into<String>,
        trigger: Trigger,
        entered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_id,
            step_type: step_type.into(),
            trigger,
            entered_at,
            exited_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }

    /// Time spent in the step; `None` while it is still active.
    pub fn duration(&self) -> Option<Duration> {
        self.exited_at.map(|exit| exit - self.entered_at)
    }
}

/// Engine events published on the `EventBus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_id: WorkflowId,
        first_step: StepId,
    },
    StepEntered {
        workflow_id: WorkflowId,
        step_id: StepId,
        trigger: Trigger,
    },
    ExecutionDeferred {
        workflow_id: WorkflowId,
        step_id: StepId,
        retry_at: Option<DateTime<Utc>>,
    },
    ButtonRejected {
        workflow_id: WorkflowId,
        button: String,
        message: String,
    },
    UndoApplied {
        workflow_id: WorkflowId,
        target: StepId,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
    },
    WorkflowCanceled {
        workflow_id: WorkflowId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_step_result_serialization() {
        let result = StepResult::advance("review");
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"type":"advance","next":"review"}"#);

        let parsed: StepResult = serde_json::from_str(r#"{"type":"wait"}"#).unwrap();
        assert_eq!(parsed, StepResult::Wait);
    }

    #[test]
    fn test_history_item_duration() {
        let entered = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut item = HistoryItem::open("a".into(), "placeholder", Trigger::Start, entered);
        assert!(item.is_open());
        assert_eq!(item.duration(), None);

        item.exited_at = Some(entered + Duration::minutes(90));
        assert_eq!(item.duration(), Some(Duration::minutes(90)));
    }

    #[test]
    fn test_trigger_display() {
        let t = Trigger::Button(ButtonClick::new("approve").with_input("looks fine"));
        assert_eq!(t.to_string(), "button:approve");
        assert_eq!(Trigger::Auto.to_string(), "auto");
    }
}
