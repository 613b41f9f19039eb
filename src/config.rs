//! YAML configuration for runs and batches.
//!
//! One document configures everything:
//!
//! ```yaml
//! agent:
//!   step_limit: 50
//!   cost_limit: 3.0
//! model:
//!   model_class: openrouter
//!   model_name: anthropic/claude-sonnet-4
//! environment:
//!   environment_class: docker
//!   timeout: 60
//! run:
//!   workers: 4
//!   env_startup_command: "git checkout {{ base_commit }}"
//! ```
//!
//! Every section is optional. A `model` section without `model_class` is an
//! OpenRouter model; an `environment` section without `environment_class`
//! is a local environment.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::agent::AgentConfig;
use crate::batch::BatchSettings;
use crate::environment::EnvironmentConfig;
use crate::error::ConfigError;
use crate::llm::ModelConfig;

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model_name: Option<String>,
    pub model_class: Option<String>,
    pub environment_class: Option<String>,
    pub step_limit: Option<u64>,
    pub cost_limit: Option<f64>,
}

/// Complete configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub run: BatchSettings,
}

impl HarnessConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::load(Some(path), &ConfigOverrides::default())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Self::from_document(serde_yaml::from_str(yaml)?, &ConfigOverrides::default())
    }

    /// Load `path` (or an empty document) and apply `overrides`.
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let document = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_yaml::from_str(&contents)?
            }
            None => Value::Null,
        };
        Self::from_document(document, overrides)
    }

    fn from_document(document: Value, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut root = match document {
            Value::Null => Mapping::new(),
            Value::Mapping(map) => map,
            _ => return Err(ConfigError::Invalid("top level must be a mapping".to_string())),
        };

        let model = section(&mut root, "model")?;
        if let Some(class) = &overrides.model_class {
            model.insert("model_class".into(), class.as_str().into());
        }
        if let Some(name) = &overrides.model_name {
            model.insert("model_name".into(), name.as_str().into());
        }
        if !model.is_empty() && !model.contains_key("model_class") {
            model.insert("model_class".into(), "openrouter".into());
        }

        let environment = section(&mut root, "environment")?;
        if let Some(class) = &overrides.environment_class {
            environment.insert("environment_class".into(), class.as_str().into());
        }
        if !environment.is_empty() && !environment.contains_key("environment_class") {
            environment.insert("environment_class".into(), "local".into());
        }

        let agent = section(&mut root, "agent")?;
        if let Some(step_limit) = overrides.step_limit {
            agent.insert("step_limit".into(), step_limit.into());
        }
        if let Some(cost_limit) = overrides.cost_limit {
            agent.insert("cost_limit".into(), cost_limit.into());
        }

        // Empty sections fall back to the serde defaults.
        for key in ["agent", "model", "environment"] {
            if root.get(key).and_then(Value::as_mapping).is_some_and(Mapping::is_empty) {
                root.remove(key);
            }
        }

        let config: HarnessConfig = serde_yaml::from_value(Value::Mapping(root))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run.workers == 0 {
            return Err(ConfigError::Invalid("run.workers must be at least 1".to_string()));
        }
        if self.agent.cost_limit < 0.0 {
            return Err(ConfigError::Invalid(
                "agent.cost_limit must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// The mapping under `key`, created empty when absent.
fn section<'a>(root: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping, ConfigError> {
    let entry = root
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if entry.is_null() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry
        .as_mapping_mut()
        .ok_or_else(|| ConfigError::Invalid(format!("'{}' must be a mapping", key)))
}
