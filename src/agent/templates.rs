//! Prompt templates and observation rendering.
//!
//! Templates use Tera (Jinja2-like) syntax and are rendered one-off with
//! autoescaping disabled. Large command outputs are cut into a head and a
//! tail before they reach the template, so templates only decide layout.

use serde::Serialize;
use serde_json::Value;
use tera::{Context, Tera};

use super::error::AgentError;
use crate::environment::Observation;

/// Outputs of at least this many characters are truncated.
pub const MAX_OBSERVATION_CHARS: usize = 10_000;

/// Characters kept from the start of a truncated output.
pub const OBSERVATION_HEAD_CHARS: usize = 5_000;

/// Characters kept from the end of a truncated output.
pub const OBSERVATION_TAIL_CHARS: usize = 5_000;

pub const DEFAULT_SYSTEM_TEMPLATE: &str = r#"You are a helpful assistant that can interact with a computer shell to solve programming tasks.

Your response must contain exactly ONE bash code block with ONE command (or commands connected with && or ||).
Include a THOUGHT section before your command where you explain your reasoning process.
Format your response as shown in <format_example>.

<format_example>
THOUGHT: Your reasoning and analysis here. Explain why you want to perform the action.

```bash
your_command_here
```
</format_example>

Failure to follow these rules will cause your response to be rejected."#;

pub const DEFAULT_INSTANCE_TEMPLATE: &str = r#"<task_description>
{{task}}
</task_description>

<instructions>
Work step by step: explore the code, reproduce the problem, make the change, and verify it.
Every response must contain exactly one bash code block. Each command runs in a new subshell,
so directory changes and environment variables do not persist between commands.

When you are done, submit your work by issuing exactly this command on its own:

```bash
echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT && git add -A && git diff --cached
```

You cannot continue working after submitting.
</instructions>"#;

pub const DEFAULT_TIMEOUT_TEMPLATE: &str = r#"The last command <command>{{action.command}}</command> timed out and has been killed.
The output of the command was:
<output>
{{output}}
</output>
Please try another command and make sure to avoid those requiring interactive input."#;

pub const DEFAULT_FORMAT_ERROR_TEMPLATE: &str = r#"Please always provide EXACTLY ONE action in triple backticks, found {{actions | length}} actions.

Please format your action in triple backticks as shown in <response_example>.

<response_example>
Here are some thoughts about why you want to perform the action.

```bash
<action>
```
</response_example>

If you have completed your assignment, please consult the first message about how to
submit your solution (you will not be able to continue working on this task after that)."#;

pub const DEFAULT_ACTION_OBSERVATION_TEMPLATE: &str = r#"<returncode>{{output.returncode}}</returncode>
{% if output.truncated -%}
<warning>
The output of your last command was too long.
Please try a different command that produces less output.
If you're looking at a file you can try use head, tail or sed to view a smaller number of lines selectively.
If you're using grep or find and it produced too much output, you can use a more selective search pattern.
</warning>
<output_head>
{{output.head}}
</output_head>
<elided_chars>
{{output.elided_chars}} characters elided
</elided_chars>
<output_tail>
{{output.tail}}
</output_tail>
{%- else -%}
<output>
{{output.output}}
</output>
{%- endif %}"#;

/// Template view of an [`Observation`], with the truncation precomputed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationView {
    pub returncode: i32,
    pub output: String,
    pub timed_out: bool,
    pub truncated: bool,
    pub head: String,
    pub tail: String,
    pub elided_chars: usize,
}

impl ObservationView {
    pub fn new(observation: &Observation) -> Self {
        let output = &observation.output;
        let total = output.chars().count();
        let (truncated, head, tail, elided_chars) = if total >= MAX_OBSERVATION_CHARS {
            let head: String = output.chars().take(OBSERVATION_HEAD_CHARS).collect();
            let tail_start = total.saturating_sub(OBSERVATION_TAIL_CHARS).max(OBSERVATION_HEAD_CHARS);
            let tail: String = output.chars().skip(tail_start).collect();
            (true, head, tail, tail_start - OBSERVATION_HEAD_CHARS)
        } else {
            (false, String::new(), String::new(), 0)
        };
        Self {
            returncode: observation.returncode,
            output: output.clone(),
            timed_out: observation.timed_out,
            truncated,
            head,
            tail,
            elided_chars,
        }
    }
}

/// Build a render context from a JSON object; non-object values are ignored.
pub fn context_from(vars: &Value) -> Context {
    match vars {
        Value::Object(_) => Context::from_value(vars.clone()).unwrap_or_default(),
        _ => Context::new(),
    }
}

/// Render `template` with `context`.
pub fn render(name: &str, template: &str, context: &Context) -> Result<String, AgentError> {
    Tera::one_off(template, context, false).map_err(|e| AgentError::Template {
        template: name.to_string(),
        reason: tera_error_chain(&e),
    })
}

fn tera_error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render_observation(observation: &Observation) -> String {
        let mut context = Context::new();
        context.insert("output", &ObservationView::new(observation));
        render("action_observation_template", DEFAULT_ACTION_OBSERVATION_TEMPLATE, &context)
            .unwrap()
    }

    #[test]
    fn test_short_output_is_shown_in_full() {
        let result = render_observation(&Observation::new(
            0,
            "Success! Operation completed.\nWarning: minor issue",
        ));
        assert!(result.contains("<returncode>0</returncode>"));
        assert!(result.contains("<output>\nSuccess! Operation completed.\nWarning: minor issue\n</output>"));
        assert!(!result.contains("<output_head>"));
        assert!(!result.contains("<elided_chars>"));
        assert!(!result.contains("<warning>"));
    }

    #[test]
    fn test_long_output_is_truncated() {
        let long = format!("{}{}", "A".repeat(8000), "B".repeat(3000));
        let result = render_observation(&Observation::new(1, long));
        assert!(result.contains("<returncode>1</returncode>"));
        assert!(result.contains("The output of your last command was too long"));
        assert!(result.contains("1000 characters elided"));

        let head = &result[result.find("<output_head>").unwrap()..result.find("</output_head>").unwrap()];
        assert!(head.contains("AAAA"));
        assert!(!head.contains('B'));
        let tail = &result[result.find("<output_tail>").unwrap()..result.find("</output_tail>").unwrap()];
        assert!(tail.contains("BBBB"));
    }

    #[test]
    fn test_truncation_boundary() {
        let at_limit = ObservationView::new(&Observation::new(0, "X".repeat(MAX_OBSERVATION_CHARS)));
        assert!(at_limit.truncated);
        assert_eq!(at_limit.elided_chars, 0);
        assert_eq!(at_limit.head.len() + at_limit.tail.len(), MAX_OBSERVATION_CHARS);

        let below = ObservationView::new(&Observation::new(0, "X".repeat(MAX_OBSERVATION_CHARS - 1)));
        assert!(!below.truncated);
    }

    #[test]
    fn test_truncation_is_char_boundary_safe() {
        let view = ObservationView::new(&Observation::new(0, "é".repeat(12_000)));
        assert_eq!(view.head.chars().count(), OBSERVATION_HEAD_CHARS);
        assert_eq!(view.tail.chars().count(), OBSERVATION_TAIL_CHARS);
        assert_eq!(view.elided_chars, 2_000);
    }

    #[test]
    fn test_format_error_counts_actions() {
        let mut context = Context::new();
        context.insert("actions", &vec!["a", "b"]);
        let text = render("format_error_template", DEFAULT_FORMAT_ERROR_TEMPLATE, &context).unwrap();
        assert!(text.contains("Please always provide EXACTLY ONE action in triple backticks, found 2 actions."));
    }

    #[test]
    fn test_timeout_template() {
        let context = context_from(&json!({
            "action": {"command": "sleep 10"},
            "output": "999\n",
        }));
        let text = render("timeout_template", DEFAULT_TIMEOUT_TEMPLATE, &context).unwrap();
        assert!(text.contains("<command>sleep 10</command> timed out"));
        assert!(text.contains("999"));
    }

    #[test]
    fn test_no_html_escaping() {
        let context = context_from(&json!({"task": "fix a < b && c > d"}));
        let text = render("instance_template", DEFAULT_INSTANCE_TEMPLATE, &context).unwrap();
        assert!(text.contains("fix a < b && c > d"));
    }

    #[test]
    fn test_unknown_variable_is_template_error() {
        let err = render("custom", "{{ missing }}", &Context::new()).unwrap_err();
        assert!(matches!(err, AgentError::Template { .. }));
    }
}
