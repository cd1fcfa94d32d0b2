pub mod store;

pub use store::{SqliteWorkflowStore, StoredWorkflow, WorkflowSummary};
