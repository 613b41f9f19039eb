//! Agent configuration.

use serde::{Deserialize, Serialize};

use super::templates::{
    DEFAULT_ACTION_OBSERVATION_TEMPLATE, DEFAULT_FORMAT_ERROR_TEMPLATE, DEFAULT_INSTANCE_TEMPLATE,
    DEFAULT_SYSTEM_TEMPLATE, DEFAULT_TIMEOUT_TEMPLATE,
};

/// Default cost limit per run, in dollars.
pub const DEFAULT_COST_LIMIT: f64 = 3.0;

fn default_system_template() -> String {
    DEFAULT_SYSTEM_TEMPLATE.to_string()
}

fn default_instance_template() -> String {
    DEFAULT_INSTANCE_TEMPLATE.to_string()
}

fn default_timeout_template() -> String {
    DEFAULT_TIMEOUT_TEMPLATE.to_string()
}

fn default_format_error_template() -> String {
    DEFAULT_FORMAT_ERROR_TEMPLATE.to_string()
}

fn default_action_observation_template() -> String {
    DEFAULT_ACTION_OBSERVATION_TEMPLATE.to_string()
}

fn default_cost_limit() -> f64 {
    DEFAULT_COST_LIMIT
}

/// Templates and limits for [`DefaultAgent`](super::DefaultAgent).
///
/// `step_limit = 0` and `cost_limit = 0.0` disable the respective limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_template")]
    pub system_template: String,
    #[serde(default = "default_instance_template")]
    pub instance_template: String,
    #[serde(default = "default_timeout_template")]
    pub timeout_template: String,
    #[serde(default = "default_format_error_template")]
    pub format_error_template: String,
    #[serde(default = "default_action_observation_template")]
    pub action_observation_template: String,
    /// Maximum number of model calls.
    #[serde(default)]
    pub step_limit: u64,
    /// Maximum model cost in dollars.
    #[serde(default = "default_cost_limit")]
    pub cost_limit: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_template: default_system_template(),
            instance_template: default_instance_template(),
            timeout_template: default_timeout_template(),
            format_error_template: default_format_error_template(),
            action_observation_template: default_action_observation_template(),
            step_limit: 0,
            cost_limit: DEFAULT_COST_LIMIT,
        }
    }
}

impl AgentConfig {
    pub fn with_step_limit(mut self, step_limit: u64) -> Self {
        self.step_limit = step_limit;
        self
    }

    pub fn with_cost_limit(mut self, cost_limit: f64) -> Self {
        self.cost_limit = cost_limit;
        self
    }

    pub fn with_system_template(mut self, template: impl Into<String>) -> Self {
        self.system_template = template.into();
        self
    }

    pub fn with_instance_template(mut self, template: impl Into<String>) -> Self {
        self.instance_template = template.into();
        self
    }

    /// Whether a run with these totals must stop before the next model call.
    pub fn limits_exceeded(&self, n_calls: u64, cost: f64) -> bool {
        (self.step_limit > 0 && self.step_limit <= n_calls)
            || (self.cost_limit > 0.0 && self.cost_limit <= cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: AgentConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.step_limit, 0);
        assert_eq!(config.cost_limit, DEFAULT_COST_LIMIT);
    }

    #[test]
    fn test_limits() {
        let unlimited = AgentConfig::default().with_cost_limit(0.0);
        assert!(!unlimited.limits_exceeded(1_000, 1_000.0));

        let steps = unlimited.clone().with_step_limit(2);
        assert!(!steps.limits_exceeded(1, 0.0));
        assert!(steps.limits_exceeded(2, 0.0));

        let cost = AgentConfig::default().with_cost_limit(0.5);
        assert!(!cost.limits_exceeded(0, 0.0));
        assert!(cost.limits_exceeded(1, 0.5));
    }
}
