//! Language model integration for the agent harness.
//!
//! Every model implements [`Model`]: a single `query` over the conversation
//! so far, plus per-model call and cost counters. All models also report into
//! a process-wide [`GlobalModelStats`] handed to them by [`create_model`].
//!
//! ```ignore
//! use swe_harness::llm::{create_model, GlobalModelStats, Message, ModelConfig, QueryOptions};
//!
//! let stats = GlobalModelStats::from_env().shared();
//! let model = create_model(&config, stats)?;
//! let response = model.query(&[Message::user("hi")], &QueryOptions::new()).await?;
//! println!("{} (${:.4})", response.content, model.cost());
//! ```

pub mod cache_control;
pub mod deterministic;
pub mod message;
pub mod providers;
pub mod retry;
pub mod router;
pub mod stats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LlmError;

pub use cache_control::{set_cache_control, CacheControlMode};
pub use deterministic::{DeterministicModel, DeterministicModelConfig};
pub use message::{CacheControl, ContentPart, Message, MessageContent, Role};
pub use providers::{OpenRouterModel, OpenRouterModelConfig};
pub use retry::{is_transient_error, RetryPolicy};
pub use router::{InterleavingModel, InterleavingModelConfig, RouletteModel, RouletteModelConfig};
pub use stats::{GlobalModelStats, ModelCounters, SharedModelStats, UsageSnapshot};

/// Extra per-call options merged into the provider payload.
pub type QueryOptions = Map<String, Value>;

/// The reply of one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Assistant text.
    pub content: String,
    /// Provider-specific data (raw response), stored with the assistant message.
    #[serde(default)]
    pub extra: Value,
}

impl ModelResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            extra: Value::Null,
        }
    }
}

/// A language model the agent can query.
#[async_trait]
pub trait Model: Send + Sync {
    /// Send the conversation and return the assistant reply.
    async fn query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
    ) -> Result<ModelResponse, LlmError>;

    /// Number of successful calls made by this model.
    fn n_calls(&self) -> u64;

    /// Accumulated cost of this model in dollars.
    fn cost(&self) -> f64;

    /// Model identifier recorded in predictions.
    fn model_name(&self) -> &str;

    /// Short class name recorded in trajectories (`model_type`).
    fn kind(&self) -> &'static str;

    /// Variables exposed to prompt templates and the trajectory config.
    fn template_vars(&self) -> Value;
}

/// Model selection, tagged by `model_class` in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_class", rename_all = "snake_case")]
pub enum ModelConfig {
    #[serde(rename = "openrouter")]
    OpenRouter(OpenRouterModelConfig),
    Deterministic(DeterministicModelConfig),
    Roulette(RouletteModelConfig),
    Interleaving(InterleavingModelConfig),
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::OpenRouter(OpenRouterModelConfig::new("anthropic/claude-sonnet-4"))
    }
}

impl ModelConfig {
    /// The model name this configuration resolves to.
    pub fn model_name(&self) -> String {
        match self {
            ModelConfig::OpenRouter(c) => c.model_name.clone(),
            ModelConfig::Deterministic(c) => c.model_name.clone(),
            ModelConfig::Roulette(c) => c.model_name(),
            ModelConfig::Interleaving(c) => c.model_name(),
        }
    }

    /// Replace the model name (CLI `--model` override).
    ///
    /// Composite models keep their sub-model names.
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            ModelConfig::OpenRouter(c) => c.model_name = name.into(),
            ModelConfig::Deterministic(c) => c.model_name = name.into(),
            ModelConfig::Roulette(_) | ModelConfig::Interleaving(_) => {}
        }
        self
    }
}

/// Build a model from its configuration.
///
/// Every model created here reports into `stats`.
pub fn create_model(
    config: &ModelConfig,
    stats: SharedModelStats,
) -> Result<Box<dyn Model>, LlmError> {
    let model: Box<dyn Model> = match config {
        ModelConfig::OpenRouter(c) => Box::new(OpenRouterModel::new(c.clone(), stats)?),
        ModelConfig::Deterministic(c) => Box::new(DeterministicModel::new(c.clone(), stats)),
        ModelConfig::Roulette(c) => Box::new(RouletteModel::new(c.clone(), stats)?),
        ModelConfig::Interleaving(c) => Box::new(InterleavingModel::new(c.clone(), stats)?),
    };
    tracing::debug!(model = model.model_name(), kind = model.kind(), "Created model");
    Ok(model)
}
