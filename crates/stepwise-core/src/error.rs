use thiserror::Error;

use crate::types::StepId;

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Modeling errors (invalid template, never retried)
    #[error("Workflow configuration error: {0}")]
    Configuration(String),

    // Missing business-object data
    #[error("Field not found on associated object: {key}")]
    KeyNotFound { key: String },

    // Precondition errors
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Button not found: {0}")]
    ButtonNotFound(String),

    // Business-rule failure raised by a button action
    #[error("{0}")]
    Application(String),

    // Storage errors
    #[error("Concurrent modification: expected version {expected}, found {found}")]
    Conflict { expected: i64, found: i64 },

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepwiseError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn key_not_found(key: impl Into<String>) -> Self {
        Self::KeyNotFound { key: key.into() }
    }

    /// Whether a button click failing with this error should be reported back
    /// to the user instead of aborting the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Application(_))
    }
}

pub type Result<T> = std::result::Result<T, StepwiseError>;
