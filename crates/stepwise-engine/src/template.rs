use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::types::StepId;

use crate::graph::{validate, Step, StepGraph, ValidationOptions};
use crate::workflow::Workflow;

/// Authored description of a workflow, instantiated once per business
/// object.
///
/// Loaded from TOML or JSON. Step kinds are flattened into the step table,
/// so TOML datetimes must be written as quoted RFC 3339 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    pub first_step: StepId,
    /// Terminal that diverging choice lanes merge into when drawn.
    #[serde(default)]
    pub last_step: Option<StepId>,
    /// Terminal recorded when an instance is canceled.
    #[serde(default)]
    pub cancel_step: Option<StepId>,
    /// Only diagram demonstrations should set this.
    #[serde(default)]
    pub allow_back_edges: bool,
    pub steps: Vec<Step>,
}

impl WorkflowTemplate {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StepwiseError::Config(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a template file; `.json` files are read as JSON, anything else
    /// as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        debug!(path = %path.display(), json = is_json, "Loading workflow template");
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn options(&self) -> ValidationOptions {
        ValidationOptions {
            allow_back_edges: self.allow_back_edges,
        }
    }

    /// Step arena of the template. Duplicate ids are rejected.
    pub fn graph(&self) -> Result<StepGraph> {
        StepGraph::from_steps(self.steps.clone())
    }

    pub fn validate(&self) -> Result<()> {
        let graph = self.graph()?;
        validate(&graph, &self.first_step, self.options())?;
        let workflow = self.bind(Workflow::new(&self.name, graph, self.first_step.clone()));
        workflow.check_bound_terminal(workflow.last_step.as_ref())?;
        workflow.check_bound_terminal(workflow.cancel_step.as_ref())
    }

    /// A fresh, not yet started instance with a new id.
    pub fn instantiate(&self) -> Result<Workflow> {
        self.validate()?;
        let workflow = self.bind(Workflow::new(
            &self.name,
            self.graph()?,
            self.first_step.clone(),
        ));
        debug!(workflow_id = %workflow.id, template = %self.name, "Instantiated workflow");
        Ok(workflow)
    }

    fn bind(&self, mut workflow: Workflow) -> Workflow {
        workflow.last_step = self.last_step.clone();
        workflow.cancel_step = self.cancel_step.clone();
        workflow
    }
}
