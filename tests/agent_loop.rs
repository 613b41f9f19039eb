//! End-to-end agent runs on a local environment with scripted models.

use std::sync::Arc;

use swe_harness::agent::{AgentConfig, DefaultAgent, LIMITS_EXCEEDED, SUBMITTED};
use swe_harness::environment::{LocalEnvironment, LocalEnvironmentConfig};
use swe_harness::llm::{DeterministicModel, DeterministicModelConfig, GlobalModelStats, Role};
use swe_harness::trajectory::{TrajectoryRecord, TrajectoryStore};
use tempfile::TempDir;

fn agent(outputs: &[&str], config: AgentConfig, env: LocalEnvironmentConfig) -> DefaultAgent {
    let model = DeterministicModel::new(
        DeterministicModelConfig::new(outputs.iter().map(|s| s.to_string()).collect()),
        GlobalModelStats::new().shared(),
    );
    DefaultAgent::new(config, Box::new(model), Arc::new(LocalEnvironment::new(env)))
}

fn roles(agent: &DefaultAgent) -> Vec<Role> {
    agent.messages().iter().map(|m| m.role).collect()
}

#[tokio::test]
async fn test_hello_world_submits() {
    let mut agent = agent(
        &[
            "```bash\necho 'hello world'\n```",
            "```bash\necho 'COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT'\necho 'Task completed successfully'\n```",
        ],
        AgentConfig::default(),
        LocalEnvironmentConfig::default(),
    );

    let outcome = agent.run("Say hello").await;
    assert_eq!(outcome.exit_status, SUBMITTED);
    assert_eq!(outcome.result, "Task completed successfully\n");
    assert_eq!(agent.model().n_calls(), 2);
    assert_eq!(agent.messages().len(), 6);
    assert_eq!(
        roles(&agent),
        vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
    );
}

#[tokio::test]
async fn test_two_actions_are_a_format_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut agent_in_dir = agent(
        &[
            "```bash\ntouch should-not-exist\n```\nand\n```bash\necho two\n```",
            "```bash\necho COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\n```",
        ],
        AgentConfig::default(),
        LocalEnvironmentConfig::default().with_cwd(dir.path().display().to_string()),
    );

    let outcome = agent_in_dir.run("Do one thing").await;
    assert_eq!(outcome.exit_status, SUBMITTED);
    assert_eq!(agent_in_dir.model().n_calls(), 2);
    let feedback = agent_in_dir.messages()[3].text();
    assert!(feedback.contains("provide EXACTLY ONE action"), "got: {}", feedback);
    assert!(!dir.path().join("should-not-exist").exists());
}

#[tokio::test]
async fn test_step_limit_stops_after_k_calls() {
    let outputs: Vec<String> = (0..10).map(|i| format!("```bash\necho step{}\n```", i)).collect();
    let outputs: Vec<&str> = outputs.iter().map(String::as_str).collect();
    let mut agent = agent(
        &outputs,
        AgentConfig::default().with_step_limit(3),
        LocalEnvironmentConfig::default(),
    );

    let outcome = agent.run("Loop").await;
    assert_eq!(outcome.exit_status, LIMITS_EXCEEDED);
    assert_eq!(agent.model().n_calls(), 3);
}

#[tokio::test]
async fn test_cost_limit_stops_at_ceiling() {
    let outputs: Vec<String> = (0..10).map(|i| format!("```bash\necho step{}\n```", i)).collect();
    let outputs: Vec<&str> = outputs.iter().map(String::as_str).collect();
    let mut agent = agent(
        &outputs,
        AgentConfig::default().with_cost_limit(2.5),
        LocalEnvironmentConfig::default(),
    );

    let outcome = agent.run("Loop").await;
    assert_eq!(outcome.exit_status, LIMITS_EXCEEDED);
    // Each call costs 1.0, so the limit is reached on call ceil(2.5 / 1.0).
    assert_eq!(agent.model().n_calls(), 3);
}

#[tokio::test]
async fn test_timeout_keeps_partial_output() {
    let mut agent = agent(
        &[
            "```bash\necho \"111*9=$((111*9))\"; sleep 10\n```",
            "```bash\necho COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\n```",
        ],
        AgentConfig::default(),
        LocalEnvironmentConfig::default().with_timeout(1),
    );

    let outcome = agent.run("Multiply").await;
    assert_eq!(outcome.exit_status, SUBMITTED);
    let observation = agent.messages()[3].text();
    assert!(observation.contains("timed out"), "got: {}", observation);
    assert!(observation.contains("999"), "got: {}", observation);
}

#[tokio::test]
async fn test_trajectory_of_finished_run() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut agent = agent(
        &["```bash\necho COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\necho diff\n```"],
        AgentConfig::default(),
        LocalEnvironmentConfig::default(),
    );
    let outcome = agent.run("Submit").await;

    let store = TrajectoryStore::new(dir.path());
    let path = store
        .save(&TrajectoryRecord::from_agent("repo__issue-3", &agent, &outcome))
        .await
        .unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(json["info"]["exit_status"], "Submitted");
    assert_eq!(json["info"]["submission"], "diff\n");
    assert_eq!(json["info"]["model_stats"]["api_calls"], 1);
    assert_eq!(json["info"]["config"]["agent_type"], "DefaultAgent");
    assert_eq!(json["info"]["config"]["model_type"], "deterministic");
    assert_eq!(json["info"]["config"]["environment_type"], "local");
    assert_eq!(json["trajectory_format"], "swe-harness-1");
    assert_eq!(json["messages"].as_array().map(Vec::len), Some(4));
}
