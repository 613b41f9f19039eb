//! Error types for swe-harness operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions and cost accounting
//! - Command execution inside environments
//! - Trajectory and predictions persistence
//! - Configuration loading
//!
//! Every error that can end an agent run exposes a stable `status_name()`.
//! That name becomes the run's `exit_status`, and `message()` its `result`.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Missing API key: {0}")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Cost tracking error: {0}")]
    CostTracking(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
}

impl LlmError {
    /// Stable type name recorded as the exit status of a failed run.
    pub fn status_name(&self) -> &'static str {
        match self {
            LlmError::Authentication(_) | LlmError::MissingApiKey(_) => "AuthenticationError",
            LlmError::RequestFailed(_) => "APIConnectionError",
            LlmError::ParseError(_) => "ParseError",
            LlmError::RateLimited(_) => "RateLimitError",
            LlmError::ApiError { .. } => "APIError",
            LlmError::CostTracking(_) => "CostTrackingError",
            LlmError::Runtime(_) => "RuntimeError",
            LlmError::InvalidConfig(_) => "ValueError",
        }
    }

    /// The human-readable message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            LlmError::Authentication(m)
            | LlmError::MissingApiKey(m)
            | LlmError::RequestFailed(m)
            | LlmError::ParseError(m)
            | LlmError::RateLimited(m)
            | LlmError::CostTracking(m)
            | LlmError::Runtime(m)
            | LlmError::InvalidConfig(m) => m.clone(),
            LlmError::ApiError { code, message } => format!("HTTP {}: {}", code, message),
        }
    }
}

/// Errors that can occur while creating or using an environment.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// The command exceeded its timeout. `output` holds what was captured
    /// before the process was killed.
    #[error("Command timed out after {} seconds", .timeout.as_secs())]
    Timeout { timeout: Duration, output: String },

    #[error("Failed to launch '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Container failed to start: {0}")]
    StartFailed(String),

    #[error("Container '{0}' is no longer running")]
    ContainerUnavailable(String),

    #[error("Sandbox build failed after {attempts} attempts: {reason}")]
    BuildFailed { attempts: u32, reason: String },

    #[error("Environment has already been disposed")]
    Disposed,

    #[error("Startup command failed: {0}")]
    StartupCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvironmentError {
    /// Stable type name recorded as the exit status of a failed run.
    pub fn status_name(&self) -> &'static str {
        match self {
            EnvironmentError::Timeout { .. } => "TimeoutError",
            EnvironmentError::SpawnFailed { .. } => "FileNotFoundError",
            EnvironmentError::StartFailed(_) | EnvironmentError::BuildFailed { .. } => {
                "CalledProcessError"
            }
            EnvironmentError::ContainerUnavailable(_) | EnvironmentError::Disposed => {
                "EnvironmentUnavailable"
            }
            EnvironmentError::StartupCommand(_) => "RuntimeError",
            EnvironmentError::Io(_) => "OSError",
        }
    }

    /// Whether this is the recoverable timeout signal.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EnvironmentError::Timeout { .. })
    }
}

/// Errors that can occur while persisting trajectories and predictions.
#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid predictions file '{path}': {reason}")]
    InvalidPredictions { path: String, reason: String },
}

/// Errors that can occur while preparing or running a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Invalid filter pattern '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid slice specification '{0}': expected 'start:stop'")]
    InvalidSlice(String),

    #[error("Failed to load instances from '{path}': {reason}")]
    InstanceLoad { path: String, reason: String },

    #[error("Invalid instance id '{0}': must be a single path component")]
    InvalidInstanceId(String),

    #[error("Worker count must be at least 1")]
    NoWorkers,

    #[error("Persistence error: {0}")]
    Persistence(#[from] TrajectoryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_status_names() {
        assert_eq!(
            LlmError::Authentication("x".to_string()).status_name(),
            "AuthenticationError"
        );
        assert_eq!(LlmError::Runtime("x".to_string()).status_name(), "RuntimeError");
        assert_eq!(
            LlmError::ApiError {
                code: 503,
                message: "down".to_string()
            }
            .status_name(),
            "APIError"
        );
    }

    #[test]
    fn test_llm_message_strips_prefix() {
        let err = LlmError::Runtime("x".to_string());
        assert_eq!(err.message(), "x");
        assert_eq!(err.to_string(), "Runtime error: x");
    }

    #[test]
    fn test_environment_timeout_is_distinct() {
        let err = EnvironmentError::Timeout {
            timeout: Duration::from_secs(2),
            output: "partial".to_string(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Command timed out after 2 seconds");
        assert!(!EnvironmentError::Disposed.is_timeout());
    }
}
