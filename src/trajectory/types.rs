//! Persisted record of one agent run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{AgentOutcome, DefaultAgent};
use crate::llm::Message;

/// Format tag written into every trajectory file.
pub const TRAJECTORY_FORMAT: &str = "swe-harness-1";

/// Model usage of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub instance_cost: f64,
    pub api_calls: u64,
}

/// Configuration the run was made with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub agent: Value,
    pub model: Value,
    pub environment: Value,
    pub agent_type: String,
    pub model_type: String,
    pub environment_type: String,
}

/// Outcome and context of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryInfo {
    pub exit_status: String,
    pub submission: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_stats: Option<ModelStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Full trajectory: conversation plus outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub info: TrajectoryInfo,
    pub messages: Vec<Message>,
    pub trajectory_format: String,
    pub instance_id: String,
}

impl TrajectoryRecord {
    /// Record of a run whose agent was constructed.
    pub fn from_agent(
        instance_id: impl Into<String>,
        agent: &DefaultAgent,
        outcome: &AgentOutcome,
    ) -> Self {
        let model = agent.model();
        let environment = agent.environment();
        Self {
            info: TrajectoryInfo {
                exit_status: outcome.exit_status.clone(),
                submission: outcome.result.clone(),
                model_stats: Some(ModelStats {
                    instance_cost: model.cost(),
                    api_calls: model.n_calls(),
                }),
                config: Some(RunConfig {
                    agent: serde_json::to_value(agent.config()).unwrap_or_default(),
                    model: model.template_vars(),
                    environment: environment.template_vars(),
                    agent_type: "DefaultAgent".to_string(),
                    model_type: model.kind().to_string(),
                    environment_type: environment.kind().to_string(),
                }),
                traceback: outcome.traceback.clone(),
            },
            messages: agent.messages().to_vec(),
            trajectory_format: TRAJECTORY_FORMAT.to_string(),
            instance_id: instance_id.into(),
        }
    }

    /// Record of a run that failed before an agent existed.
    pub fn without_agent(instance_id: impl Into<String>, outcome: &AgentOutcome) -> Self {
        Self {
            info: TrajectoryInfo {
                exit_status: outcome.exit_status.clone(),
                submission: outcome.result.clone(),
                model_stats: None,
                config: None,
                traceback: outcome.traceback.clone(),
            },
            messages: Vec::new(),
            trajectory_format: TRAJECTORY_FORMAT.to_string(),
            instance_id: instance_id.into(),
        }
    }
}
