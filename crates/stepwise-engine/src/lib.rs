pub mod diagram;
pub mod engine;
pub mod graph;
pub mod routing;
pub mod template;
pub mod undo;
pub mod workflow;

pub use diagram::{render_mermaid, render_workflow};
pub use engine::{ButtonAction, ClickOutcome, DriveOutcome, DriveReport, WorkflowEngine};
pub use graph::{
    BranchRef, ButtonSpec, ChoiceOption, CommonStep, FieldCondition, FieldExpectation, MergePoint,
    Outcome, Step, StepGraph, StepKind, StepSequence, ValidationOptions,
};
pub use routing::{ButtonLocation, OfferedButton};
pub use template::WorkflowTemplate;
pub use undo::UndoButton;
pub use workflow::Workflow;
