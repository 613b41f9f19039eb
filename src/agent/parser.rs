//! Action extraction and submission detection.
//!
//! A reply is valid when it contains exactly one fenced ```` ```bash ```` block.
//! A run is submitted when a command's output starts with a completion
//! sentinel; everything after the sentinel line is the submission.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Sentinel that ends a run successfully.
pub const COMPLETION_SENTINEL: &str = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT";

/// Older sentinel, still honoured.
pub const LEGACY_COMPLETION_SENTINEL: &str = "MINI_SWE_AGENT_FINAL_OUTPUT";

static ACTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```bash\s*\n(.*?)\n```").expect("Invalid regex for bash actions")
});

/// The single action extracted from a model reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAction {
    /// The shell command, trimmed.
    pub command: String,
    /// The full reply it came from.
    pub raw_content: String,
}

/// A reply that did not contain exactly one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    /// Every action that was found (possibly none).
    pub actions: Vec<String>,
}

/// Extract exactly one bash action from `content`.
pub fn parse_action(content: &str) -> Result<ParsedAction, FormatError> {
    let actions: Vec<String> = ACTION_REGEX
        .captures_iter(content)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect();

    match <[String; 1]>::try_from(actions) {
        Ok([command]) => Ok(ParsedAction {
            command,
            raw_content: content.to_string(),
        }),
        Err(actions) => Err(FormatError { actions }),
    }
}

/// If `output` begins with a completion sentinel, return the submission.
///
/// Leading whitespace is ignored; the sentinel must be the whole first line.
pub fn detect_submission(output: &str) -> Option<String> {
    let trimmed = output.trim_start();
    let first_line = trimmed.split_inclusive('\n').next()?;
    let marker = first_line.trim();
    if marker == COMPLETION_SENTINEL || marker == LEGACY_COMPLETION_SENTINEL {
        Some(trimmed[first_line.len()..].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_action() {
        let action = parse_action("```bash\necho 'test'\n```").unwrap();
        assert_eq!(action.command, "echo 'test'");
        assert_eq!(action.raw_content, "```bash\necho 'test'\n```");

        let content = "Some text\n```bash\necho 'hello'\n```\nMore text";
        let action = parse_action(content).unwrap();
        assert_eq!(action.command, "echo 'hello'");
        assert_eq!(action.raw_content, content);
    }

    #[test]
    fn test_parse_multiline_action() {
        let action = parse_action("```bash\ncd /repo\nls -la\n```").unwrap();
        assert_eq!(action.command, "cd /repo\nls -la");
    }

    #[test]
    fn test_parse_rejects_no_action() {
        let err = parse_action("No code blocks here").unwrap_err();
        assert!(err.actions.is_empty());
    }

    #[test]
    fn test_parse_rejects_multiple_actions() {
        let err = parse_action("```bash\necho 'first'\n```\n```bash\necho 'second'\n```")
            .unwrap_err();
        assert_eq!(err.actions, vec!["echo 'first'", "echo 'second'"]);
    }

    #[test]
    fn test_parse_ignores_untagged_blocks() {
        assert!(parse_action("```\nls -la\n```").is_err());
        assert!(parse_action("```python\nprint(1)\n```").is_err());
    }

    #[test]
    fn test_detect_submission() {
        assert_eq!(
            detect_submission("COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\nTask completed successfully\n"),
            Some("Task completed successfully\n".to_string())
        );
        assert_eq!(
            detect_submission("\n  MINI_SWE_AGENT_FINAL_OUTPUT\ndiff --git a b\n"),
            Some("diff --git a b\n".to_string())
        );
        assert_eq!(
            detect_submission("COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT"),
            Some(String::new())
        );
    }

    #[test]
    fn test_sentinel_must_be_first_line() {
        assert_eq!(detect_submission("hello\nCOMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\n"), None);
        assert_eq!(detect_submission("echo COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\n"), None);
        assert_eq!(detect_submission(""), None);
    }
}
