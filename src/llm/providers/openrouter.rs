//! OpenRouter-backed model.
//!
//! OpenRouter exposes an OpenAI-compatible chat completions endpoint and
//! reports the dollar cost of each call when asked to (`usage.include`).
//! Cost reporting is mandatory here: downstream cost limits depend on it.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::LlmError;
use crate::llm::cache_control::{set_cache_control, CacheControlMode};
use crate::llm::retry::{is_transient_error, RetryPolicy};
use crate::llm::stats::{ModelCounters, SharedModelStats};
use crate::llm::{Message, MessageContent, Model, ModelResponse, QueryOptions};

/// Default OpenRouter API endpoint.
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Environment variable holding the API key.
pub const OPENROUTER_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Default request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 60;

const AUTHENTICATION_HELP: &str = "Authentication failed. Set your API key with the \
OPENROUTER_API_KEY environment variable (or `api_key` in the model config).";

fn default_base_url() -> String {
    OPENROUTER_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    REQUEST_TIMEOUT_SECS
}

/// Configuration for [`OpenRouterModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRouterModelConfig {
    /// Model identifier, e.g. `anthropic/claude-sonnet-4`.
    pub model_name: String,
    /// Extra payload fields merged into every request.
    #[serde(default)]
    pub model_kwargs: Map<String, Value>,
    /// Attach prompt cache markers before each call.
    #[serde(default)]
    pub set_cache_control: Option<CacheControlMode>,
    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key; falls back to `OPENROUTER_API_KEY`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum attempts per query, first call included.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl OpenRouterModelConfig {
    /// Create a configuration for the given model with defaults.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            model_kwargs: Map::new(),
            set_cache_control: None,
            base_url: default_base_url(),
            api_key: None,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            max_attempts: None,
        }
    }

    /// Set a custom base URL (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set an explicit API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Enable cache markers.
    pub fn with_cache_control(mut self, mode: CacheControlMode) -> Self {
        self.set_cache_control = Some(mode);
        self
    }
}

/// Model that queries OpenRouter with retries and strict cost tracking.
pub struct OpenRouterModel {
    config: OpenRouterModelConfig,
    client: Client,
    api_key: String,
    retry: RetryPolicy,
    counters: ModelCounters,
    global: SharedModelStats,
}

impl OpenRouterModel {
    /// Create a new model from its configuration.
    pub fn new(config: OpenRouterModelConfig, global: SharedModelStats) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;
        let api_key = config
            .api_key
            .clone()
            .or_else(|| env::var(OPENROUTER_API_KEY_ENV).ok())
            .unwrap_or_default();
        let retry = config
            .max_attempts
            .map(RetryPolicy::new)
            .unwrap_or_default();

        Ok(Self {
            config,
            client,
            api_key,
            retry,
            counters: ModelCounters::new(),
            global,
        })
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The model configuration.
    pub fn config(&self) -> &OpenRouterModelConfig {
        &self.config
    }

    fn build_payload(&self, messages: &[Message], options: &QueryOptions) -> Value {
        let messages = match self.config.set_cache_control {
            Some(mode) => set_cache_control(messages, mode),
            None => messages.to_vec(),
        };
        let api_messages: Vec<ApiMessage> = messages
            .into_iter()
            .map(|m| ApiMessage {
                role: m.role.to_string(),
                content: m.content,
            })
            .collect();

        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(self.config.model_name));
        payload.insert("messages".to_string(), json!(api_messages));
        payload.insert("usage".to_string(), json!({ "include": true }));
        for (key, value) in self.config.model_kwargs.iter().chain(options.iter()) {
            payload.insert(key.clone(), value.clone());
        }
        Value::Object(payload)
    }

    /// Execute a single request (no retry logic).
    async fn execute_request(&self, payload: &Value) -> Result<Value, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let http_response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "swe-harness")
            .json(payload)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = http_response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|r| r.error.message)
                .unwrap_or(error_text);

            return Err(match status_code {
                401 => LlmError::Authentication(AUTHENTICATION_HELP.to_string()),
                429 => LlmError::RateLimited(message),
                code => LlmError::ApiError { code, message },
            });
        }

        http_response
            .json::<Value>()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))
    }
}

/// Extract the reported cost, rejecting missing, zero or negative values.
fn extract_cost(response: &Value, model_name: &str) -> Result<f64, LlmError> {
    let cost = response
        .pointer("/usage/cost")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    if cost < 0.0 {
        return Err(LlmError::CostTracking(format!(
            "Negative cost {} reported for model {}",
            cost, model_name
        )));
    }
    if cost == 0.0 {
        return Err(LlmError::CostTracking(format!(
            "No cost information available from OpenRouter API for model {}. \
             Cost tracking is required but not provided by the API response.",
            model_name
        )));
    }
    Ok(cost)
}

fn extract_content(response: &Value) -> Result<String, LlmError> {
    let choice = response
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::ParseError("Response contains no choices".to_string()))?;
    Ok(choice
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

#[async_trait]
impl Model for OpenRouterModel {
    async fn query(
        &self,
        messages: &[Message],
        options: &QueryOptions,
    ) -> Result<ModelResponse, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::Authentication(AUTHENTICATION_HELP.to_string()));
        }
        self.global.check_limits()?;

        let payload = self.build_payload(messages, options);
        let response = self
            .retry
            .run(
                "openrouter_query",
                || self.execute_request(&payload),
                is_transient_error,
            )
            .await?;

        let cost = extract_cost(&response, &self.config.model_name)?;
        let content = extract_content(&response)?;

        self.counters.record(cost);
        self.global.add(cost);
        tracing::debug!(
            model = %self.config.model_name,
            cost = cost,
            n_calls = self.counters.n_calls(),
            "OpenRouter query completed"
        );

        Ok(ModelResponse {
            content,
            extra: json!({ "response": response }),
        })
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
        "openrouter"
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

/// Message shape sent to the API (no provider extras).
#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: MessageContent,
}

/// Error response from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

/// Error detail from the API.
#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::stats::GlobalModelStats;

    fn model_with(config: OpenRouterModelConfig) -> OpenRouterModel {
        OpenRouterModel::new(config, GlobalModelStats::new().shared())
            .expect("client should build")
    }

    #[test]
    fn test_config_defaults_from_yaml() {
        let config: OpenRouterModelConfig =
            serde_yaml::from_str("model_name: test/model").unwrap();
        assert_eq!(config.base_url, OPENROUTER_BASE_URL);
        assert_eq!(config.request_timeout_secs, REQUEST_TIMEOUT_SECS);
        assert!(config.set_cache_control.is_none());
        assert!(config.model_kwargs.is_empty());
    }

    #[test]
    fn test_payload_merges_kwargs_and_options() {
        let mut config = OpenRouterModelConfig::new("test/model").with_api_key("k");
        config.model_kwargs.insert("temperature".to_string(), json!(0.0));
        let model = model_with(config);

        let mut options = QueryOptions::new();
        options.insert("max_tokens".to_string(), json!(128));
        let payload = model.build_payload(&[Message::user("hi")], &options);

        assert_eq!(payload["model"], "test/model");
        assert_eq!(payload["usage"]["include"], true);
        assert_eq!(payload["temperature"], 0.0);
        assert_eq!(payload["max_tokens"], 128);
        assert_eq!(payload["messages"][0], json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_payload_applies_cache_control_to_last_message() {
        let model = model_with(
            OpenRouterModelConfig::new("m")
                .with_api_key("k")
                .with_cache_control(CacheControlMode::DefaultEnd),
        );
        let payload = model.build_payload(
            &[Message::system("s"), Message::user("u")],
            &QueryOptions::new(),
        );
        assert_eq!(payload["messages"][0]["content"], "s");
        assert_eq!(
            payload["messages"][1]["content"][0]["cache_control"]["type"],
            "ephemeral"
        );
    }

    #[test]
    fn test_extract_cost_requires_positive_cost() {
        assert!((extract_cost(&json!({"usage": {"cost": 0.25}}), "m").unwrap() - 0.25).abs() < 1e-9);

        let missing = extract_cost(&json!({"usage": {}}), "m").unwrap_err();
        assert!(matches!(missing, LlmError::CostTracking(_)));
        assert!(missing.message().contains("Cost tracking is required"));

        assert!(extract_cost(&json!({"usage": {"cost": -1.0}}), "m").is_err());
    }

    #[test]
    fn test_extract_content_handles_null() {
        let response = json!({"choices": [{"message": {"content": null}}]});
        assert_eq!(extract_content(&response).unwrap(), "");
        assert!(extract_content(&json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn test_missing_api_key_is_fatal() {
        let model = model_with(OpenRouterModelConfig::new("m").with_api_key(""));
        let err = model
            .query(&[Message::user("hi")], &QueryOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_name(), "AuthenticationError");
        assert!(err.message().contains("OPENROUTER_API_KEY"));
        assert_eq!(model.n_calls(), 0);
    }

    #[tokio::test]
    async fn test_connection_error_after_retries() {
        let model = model_with(
            OpenRouterModelConfig::new("m")
                .with_api_key("k")
                .with_base_url("http://localhost:65535"),
        )
        .with_retry_policy(RetryPolicy::immediate(2));

        let err = model
            .query(&[Message::user("hi")], &QueryOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed(_)));
        assert_eq!(model.cost(), 0.0);
    }
}
