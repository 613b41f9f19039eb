//! swe-harness: an execution harness for language-model software agents.
//!
//! An agent converses with a model, runs exactly one bash command per turn
//! in a sandboxed environment, and feeds the output back until the model
//! submits or a limit is hit. The batch runner drives many such runs
//! concurrently and records trajectories and predictions.

pub mod agent;
pub mod batch;
pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod llm;
pub mod trajectory;

// Re-export commonly used types
pub use agent::{AgentConfig, AgentOutcome, DefaultAgent};
pub use config::HarnessConfig;
pub use error::{BatchError, ConfigError, EnvironmentError, LlmError, TrajectoryError};
