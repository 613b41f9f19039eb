//! Errors that end an agent run.

use thiserror::Error;

use crate::error::{EnvironmentError, LlmError};

/// Fatal errors inside the agent loop.
///
/// Recoverable conditions (format errors, command timeouts) never surface
/// here; they become conversation messages instead.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] LlmError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("Failed to render {template}: {reason}")]
    Template { template: String, reason: String },
}

impl AgentError {
    /// Stable type name recorded as the run's exit status.
    pub fn status_name(&self) -> &'static str {
        match self {
            AgentError::Model(e) => e.status_name(),
            AgentError::Environment(e) => e.status_name(),
            AgentError::Template { .. } => "TemplateError",
        }
    }

    /// Message recorded as the run's result.
    pub fn message(&self) -> String {
        match self {
            AgentError::Model(e) => e.message(),
            AgentError::Environment(e) => e.to_string(),
            AgentError::Template { .. } => self.to_string(),
        }
    }
}
