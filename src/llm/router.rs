//! Composite models that dispatch each call to one of several sub-models.
//!
//! [`RouletteModel`] picks a sub-model at random; [`InterleavingModel`]
//! follows a repeating sequence. Costs and call counts are the sums over the
//! sub-models, which all report into the same global stats.

use async_trait::async_trait;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::LlmError;
use crate::llm::stats::SharedModelStats;
use crate::llm::{create_model, Message, Model, ModelConfig, ModelResponse, QueryOptions};

/// Configuration for [`RouletteModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouletteModelConfig {
    /// The models to choose from.
    pub model_kwargs: Vec<ModelConfig>,
    #[serde(default)]
    pub model_name: Option<String>,
}

impl RouletteModelConfig {
    pub fn model_name(&self) -> String {
        self.model_name.clone().unwrap_or_else(|| "roulette".to_string())
    }
}

/// Configuration for [`InterleavingModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterleavingModelConfig {
    /// The models to alternate between.
    pub model_kwargs: Vec<ModelConfig>,
    /// Sub-model indices to cycle through; `[0, 0, 1]` uses the first model
    /// twice, then the second once, and repeats. Round-robin when absent.
    #[serde(default)]
    pub sequence: Option<Vec<usize>>,
    #[serde(default)]
    pub model_name: Option<String>,
}

impl InterleavingModelConfig {
    pub fn model_name(&self) -> String {
        self.model_name
            .clone()
            .unwrap_or_else(|| "interleaving".to_string())
    }
}

/// Sub-models plus the aggregate accessors both composites share.
struct ModelPool {
    models: Vec<Box<dyn Model>>,
}

impl ModelPool {
    fn build(configs: &[ModelConfig], stats: SharedModelStats) -> Result<Self, LlmError> {
        if configs.is_empty() {
            return Err(LlmError::InvalidConfig(
                "Composite model requires at least one sub-model".to_string(),
            ));
        }
        let models = configs
            .iter()
            .map(|config| create_model(config, stats.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { models })
    }

    fn n_calls(&self) -> u64 {
        self.models.iter().map(|m| m.n_calls()).sum()
    }

    fn cost(&self) -> f64 {
        self.models.iter().map(|m| m.cost()).sum()
    }

    async fn query_with(
        &self,
        index: usize,
        messages: &[Message],
        options: &QueryOptions,
    ) -> Result<ModelResponse, LlmError> {
        let model = &self.models[index];
        let mut response = model.query(messages, options).await?;
        let extra = std::mem::take(&mut response.extra);
        response.extra = json!({ "model_name": model.model_name(), "response": extra });
        Ok(response)
    }
}

/// Model that picks a random sub-model for every call.
pub struct RouletteModel {
    config: RouletteModelConfig,
    name: String,
    pool: ModelPool,
}

impl RouletteModel {
    pub fn new(config: RouletteModelConfig, stats: SharedModelStats) -> Result<Self, LlmError> {
        let pool = ModelPool::build(&config.model_kwargs, stats)?;
        Ok(Self {
            name: config.model_name(),
            config,
            pool,
        })
    }

    fn select(&self) -> usize {
        rand::rng().random_range(0..self.pool.models.len())
    }
}

#[async_trait]
impl Model for RouletteModel {
    async fn query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
    ) -> Result<ModelResponse, LlmError> {
        let index = self.select();
        self.pool.query_with(index, messages, options).await
    }

    fn n_calls(&self) -> u64 {
        self.pool.n_calls()
    }

    fn cost(&self) -> f64 {
        self.pool.cost()
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "roulette"
    }

    fn template_vars(&self) -> Value {
        let mut vars = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut vars {
            map.insert("n_model_calls".to_string(), json!(self.n_calls()));
            map.insert("model_cost".to_string(), json!(self.cost()));
        }
        vars
    }
}

/// Model that alternates between sub-models in a fixed pattern.
pub struct InterleavingModel {
    config: InterleavingModelConfig,
    name: String,
    pool: ModelPool,
}

impl InterleavingModel {
    pub fn new(
        config: InterleavingModelConfig,
        stats: SharedModelStats,
    ) -> Result<Self, LlmError> {
        let pool = ModelPool::build(&config.model_kwargs, stats)?;
        if let Some(sequence) = &config.sequence {
            if sequence.is_empty() {
                return Err(LlmError::InvalidConfig(
                    "Interleaving sequence must not be empty".to_string(),
                ));
            }
            if let Some(bad) = sequence.iter().find(|&&i| i >= pool.models.len()) {
                return Err(LlmError::InvalidConfig(format!(
                    "Interleaving sequence refers to model {} but only {} are configured",
                    bad,
                    pool.models.len()
                )));
            }
        }
        Ok(Self {
            name: config.model_name(),
            config,
            pool,
        })
    }

    fn select(&self) -> usize {
        let n_calls = self.pool.n_calls() as usize;
        match &self.config.sequence {
            Some(sequence) => sequence[n_calls % sequence.len()],
            None => n_calls % self.pool.models.len(),
        }
    }
}

#[async_trait]
impl Model for InterleavingModel {
    async fn query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
    ) -> Result<ModelResponse, LlmError> {
        let index = self.select();
        self.pool.query_with(index, messages, options).await
    }

    fn n_calls(&self) -> u64 {
        self.pool.n_calls()
    }

    fn cost(&self) -> f64 {
        self.pool.cost()
    }

    fn model_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "interleaving"
    }

    fn template_vars(&self) -> Value {
        let mut vars = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut vars {
            map.insert("n_model_calls".to_string(), json!(self.n_calls()));
            map.insert("model_cost".to_string(), json!(self.cost()));
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::deterministic::DeterministicModelConfig;
    use crate::llm::stats::GlobalModelStats;

    fn scripted(name: &str, n: usize, cost: f64) -> ModelConfig {
        ModelConfig::Deterministic(
            DeterministicModelConfig::new(vec![name.to_string(); n])
                .with_model_name(name)
                .with_cost_per_call(cost),
        )
    }

    async fn ask(model: &dyn Model) -> ModelResponse {
        model
            .query(&[Message::user("q")], &QueryOptions::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_roulette_sums_sub_models() {
        let stats = GlobalModelStats::new().shared();
        let model = RouletteModel::new(
            RouletteModelConfig {
                model_kwargs: vec![scripted("a", 10, 1.0), scripted("b", 10, 2.0)],
                model_name: None,
            },
            stats.clone(),
        )
        .unwrap();

        for _ in 0..5 {
            let reply = ask(&model).await;
            assert!(reply.content == "a" || reply.content == "b");
            assert_eq!(reply.extra["model_name"], reply.content.as_str());
        }
        assert_eq!(model.n_calls(), 5);
        assert!((model.cost() - stats.cost()).abs() < 1e-9);
        assert_eq!(model.model_name(), "roulette");
    }

    #[tokio::test]
    async fn test_interleaving_follows_sequence() {
        let model = InterleavingModel::new(
            InterleavingModelConfig {
                model_kwargs: vec![scripted("a", 10, 1.0), scripted("b", 10, 1.0)],
                sequence: Some(vec![0, 0, 1]),
                model_name: None,
            },
            GlobalModelStats::new().shared(),
        )
        .unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(ask(&model).await.content);
        }
        assert_eq!(seen, vec!["a", "a", "b", "a", "a", "b"]);
    }

    #[tokio::test]
    async fn test_interleaving_round_robin_by_default() {
        let model = InterleavingModel::new(
            InterleavingModelConfig {
                model_kwargs: vec![scripted("a", 5, 1.0), scripted("b", 5, 1.0)],
                sequence: None,
                model_name: Some("mix".to_string()),
            },
            GlobalModelStats::new().shared(),
        )
        .unwrap();
        assert_eq!(ask(&model).await.content, "a");
        assert_eq!(ask(&model).await.content, "b");
        assert_eq!(ask(&model).await.content, "a");
        assert_eq!(model.model_name(), "mix");
    }

    #[test]
    fn test_invalid_compositions_are_rejected() {
        let stats = GlobalModelStats::new().shared();
        assert!(RouletteModel::new(
            RouletteModelConfig {
                model_kwargs: vec![],
                model_name: None
            },
            stats.clone()
        )
        .is_err());
        assert!(InterleavingModel::new(
            InterleavingModelConfig {
                model_kwargs: vec![scripted("a", 1, 1.0)],
                sequence: Some(vec![0, 3]),
                model_name: None,
            },
            stats
        )
        .is_err());
    }
}
