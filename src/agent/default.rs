//! The query → parse → execute → observe loop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::config::AgentConfig;
use super::error::AgentError;
use super::parser::{detect_submission, parse_action, FormatError, ParsedAction};
use super::templates::{context_from, render, ObservationView};
use crate::environment::{Environment, Observation};
use crate::error::EnvironmentError;
use crate::llm::{Message, Model, QueryOptions};

/// Exit status of a run that submitted.
pub const SUBMITTED: &str = "Submitted";

/// Exit status of a run stopped by its step or cost limit.
pub const LIMITS_EXCEEDED: &str = "LimitsExceeded";

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    /// `Submitted`, `LimitsExceeded`, or the error type name.
    pub exit_status: String,
    /// Submission text, or the error message.
    pub result: String,
    /// Error detail for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl AgentOutcome {
    pub fn new(exit_status: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            exit_status: exit_status.into(),
            result: result.into(),
            traceback: None,
        }
    }

    /// Outcome of a run that ended with a fatal error.
    pub fn from_error(error: &AgentError) -> Self {
        Self {
            exit_status: error.status_name().to_string(),
            result: error.message(),
            traceback: Some(format!("{:?}", error)),
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.exit_status == SUBMITTED
    }
}

/// Callback receiving a short status line before every step.
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

enum StepResult {
    Continue,
    Finished(AgentOutcome),
}

/// Owns one conversation and drives it to a terminal state.
pub struct DefaultAgent {
    config: AgentConfig,
    model: Box<dyn Model>,
    env: Arc<dyn Environment>,
    messages: Vec<Message>,
    extra_vars: Map<String, Value>,
    on_status: Option<StatusCallback>,
}

impl DefaultAgent {
    pub fn new(config: AgentConfig, model: Box<dyn Model>, env: Arc<dyn Environment>) -> Self {
        Self {
            config,
            model,
            env,
            messages: Vec::new(),
            extra_vars: Map::new(),
            on_status: None,
        }
    }

    /// Report a status line before every model call.
    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    /// Extra variables available to every template.
    pub fn with_template_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_vars.insert(key.into(), value);
        self
    }

    /// The conversation so far.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn environment(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    /// Run `task` to completion.
    ///
    /// Fatal errors do not escape; they become an outcome named after the
    /// error type.
    pub async fn run(&mut self, task: &str) -> AgentOutcome {
        self.messages.clear();
        self.extra_vars.insert("task".to_string(), json!(task));

        if let Err(e) = self.start() {
            return self.fail(e);
        }
        loop {
            match self.step().await {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Finished(outcome)) => {
                    info!(
                        exit_status = %outcome.exit_status,
                        n_calls = self.model.n_calls(),
                        cost = self.model.cost(),
                        "Agent run finished"
                    );
                    return outcome;
                }
                Err(e) => return self.fail(e),
            }
        }
    }

    fn start(&mut self) -> Result<(), AgentError> {
        let system = self.render("system_template", &self.config.system_template, json!({}))?;
        let instance =
            self.render("instance_template", &self.config.instance_template, json!({}))?;
        self.messages.push(Message::system(system));
        self.messages.push(Message::user(instance));
        Ok(())
    }

    async fn step(&mut self) -> Result<StepResult, AgentError> {
        let n_calls = self.model.n_calls();
        let cost = self.model.cost();
        if self.config.limits_exceeded(n_calls, cost) {
            self.messages.push(Message::user(""));
            return Ok(StepResult::Finished(AgentOutcome::new(LIMITS_EXCEEDED, "")));
        }
        if let Some(callback) = &self.on_status {
            callback(&format!("Step {:3} (${:.2})", n_calls + 1, cost));
        }

        let response = self.model.query(&self.messages, &QueryOptions::new()).await?;
        self.messages
            .push(Message::assistant(response.content.clone()).with_extra(response.extra));

        let action = match parse_action(&response.content) {
            Ok(action) => action,
            Err(format_error) => {
                let text = self.render_format_error(&format_error)?;
                self.messages.push(Message::user(text));
                return Ok(StepResult::Continue);
            }
        };

        debug!(command = %action.command, "Executing action");
        match self.env.execute(&action.command, None, None).await {
            Ok(observation) => {
                if let Some(submission) = detect_submission(&observation.output) {
                    self.messages.push(Message::user(submission.clone()));
                    return Ok(StepResult::Finished(AgentOutcome::new(SUBMITTED, submission)));
                }
                let text = self.render_observation(&action, &observation)?;
                self.messages.push(Message::user(text));
                Ok(StepResult::Continue)
            }
            Err(EnvironmentError::Timeout { output, .. }) => {
                let view = ObservationView::new(&Observation::timed_out(output));
                let text = self.render(
                    "timeout_template",
                    &self.config.timeout_template,
                    json!({ "action": action, "output": &view.output, "observation": &view }),
                )?;
                self.messages.push(Message::user(text));
                Ok(StepResult::Continue)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn render_format_error(&self, error: &FormatError) -> Result<String, AgentError> {
        self.render(
            "format_error_template",
            &self.config.format_error_template,
            json!({ "actions": error.actions }),
        )
    }

    fn render_observation(
        &self,
        action: &ParsedAction,
        observation: &Observation,
    ) -> Result<String, AgentError> {
        self.render(
            "action_observation_template",
            &self.config.action_observation_template,
            json!({ "action": action, "output": ObservationView::new(observation) }),
        )
    }

    /// Render with config, environment, model and extra variables, then
    /// `extra` on top.
    fn render(&self, name: &str, template: &str, extra: Value) -> Result<String, AgentError> {
        let mut vars = Map::new();
        for layer in [
            serde_json::to_value(&self.config).unwrap_or_default(),
            self.env.template_vars(),
            self.model.template_vars(),
            Value::Object(self.extra_vars.clone()),
            extra,
        ] {
            if let Value::Object(map) = layer {
                vars.extend(map);
            }
        }
        render(name, template, &context_from(&Value::Object(vars)))
    }

    fn fail(&self, error: AgentError) -> AgentOutcome {
        tracing::warn!(
            exit_status = error.status_name(),
            error = %error,
            "Agent run failed"
        );
        AgentOutcome::from_error(&error)
    }
}
