//! Scripted model for tests and dry runs.
//!
//! Outputs are returned in order, one per call. Two directives are consumed
//! without counting as a call: `/sleep<seconds>` pauses before the next
//! output and `/warning<text>` logs a warning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::llm::stats::{ModelCounters, SharedModelStats};
use crate::llm::{Message, Model, ModelResponse, QueryOptions};

fn default_model_name() -> String {
    "deterministic".to_string()
}

fn default_cost_per_call() -> f64 {
    1.0
}

/// Configuration for [`DeterministicModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeterministicModelConfig {
    /// Replies returned in order.
    pub outputs: Vec<String>,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    /// Cost charged for every call.
    #[serde(default = "default_cost_per_call")]
    pub cost_per_call: f64,
}

impl DeterministicModelConfig {
    pub fn new(outputs: Vec<String>) -> Self {
        Self {
            outputs,
            model_name: default_model_name(),
            cost_per_call: default_cost_per_call(),
        }
    }

    pub fn with_cost_per_call(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }
}

/// Model that replays a fixed list of outputs.
pub struct DeterministicModel {
    config: DeterministicModelConfig,
    next: AtomicUsize,
    counters: ModelCounters,
    global: SharedModelStats,
}

impl DeterministicModel {
    pub fn new(config: DeterministicModelConfig, global: SharedModelStats) -> Self {
        Self {
            config,
            next: AtomicUsize::new(0),
            counters: ModelCounters::new(),
            global,
        }
    }

    fn next_output(&self) -> Result<&str, LlmError> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        self.config
            .outputs
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| {
                LlmError::Runtime(format!(
                    "Deterministic model ran out of outputs after {} replies",
                    self.config.outputs.len()
                ))
            })
    }
}

#[async_trait]
impl Model for DeterministicModel {
    async fn query(
        &self,
        _messages: &[Message],
        _options: &QueryOptions,
    ) -> Result<ModelResponse, LlmError> {
        self.global.check_limits()?;

        let content = loop {
            let output = self.next_output()?;
            if let Some(seconds) = output.strip_prefix("/sleep") {
                let seconds: f64 = seconds.trim().parse().map_err(|_| {
                    LlmError::InvalidConfig(format!("Invalid sleep directive: {}", output))
                })?;
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            } else if let Some(text) = output.strip_prefix("/warning") {
                tracing::warn!(model = %self.config.model_name, "{}", text.trim());
            } else {
                break output.to_string();
            }
        };

        self.counters.record(self.config.cost_per_call);
        self.global.add(self.config.cost_per_call);
        Ok(ModelResponse::new(content))
    }

    fn n_calls(&self) -> u64 {
        self.counters.n_calls()
    }

    fn cost(&self) -> f64 {
        self.counters.cost()
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn kind(&self) -> &'static str {
        "deterministic"
    }

    fn template_vars(&self) -> Value {
        json!({
            "model_name": self.config.model_name,
            "cost_per_call": self.config.cost_per_call,
            "n_model_calls": self.n_calls(),
            "model_cost": self.cost(),
        })
    }
}
