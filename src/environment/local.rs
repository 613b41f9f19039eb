//! Direct execution on the host.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::environment::process::run_with_timeout;
use crate::environment::{default_timeout_secs, Environment, Observation};
use crate::error::EnvironmentError;

/// Configuration for [`LocalEnvironment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEnvironmentConfig {
    /// Working directory; empty means the process's current directory.
    #[serde(default)]
    pub cwd: String,
    /// Variables set on top of the inherited host environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Default command timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
}

impl Default for LocalEnvironmentConfig {
    fn default() -> Self {
        Self {
            cwd: String::new(),
            env: BTreeMap::new(),
            timeout: default_timeout_secs(),
        }
    }
}

impl LocalEnvironmentConfig {
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }
}

/// Runs commands with `bash -c` on the host.
#[derive(Debug, Clone, Default)]
pub struct LocalEnvironment {
    config: LocalEnvironmentConfig,
}

impl LocalEnvironment {
    pub fn new(config: LocalEnvironmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalEnvironmentConfig {
        &self.config
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError> {
        let mut process = Command::new("bash");
        process.arg("-c").arg(command).envs(&self.config.env);

        let work_dir = cwd
            .filter(|dir| !dir.is_empty())
            .unwrap_or(self.config.cwd.as_str());
        if !work_dir.is_empty() {
            process.current_dir(work_dir);
        }

        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.timeout));
        let out = run_with_timeout(process, timeout).await?;
        Ok(Observation::new(out.returncode, out.output))
    }

    async fn dispose(&self) {}

    fn template_vars(&self) -> Value {
        let mut vars = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut vars {
            map.insert("system".to_string(), json!(std::env::consts::OS));
            map.insert("machine".to_string(), json!(std::env::consts::ARCH));
        }
        vars
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_execute_returns_output_and_code() {
        let env = LocalEnvironment::default();
        let obs = env.execute("echo hello; exit 2", None, None).await.unwrap();
        assert_eq!(obs.output, "hello\n");
        assert_eq!(obs.returncode, 2);
        assert!(!obs.timed_out);
    }

    #[tokio::test]
    async fn test_env_overrides_inherit_host_environment() {
        let env = LocalEnvironment::new(LocalEnvironmentConfig::default().with_env("SWE_HARNESS_TEST_VAR", "set"));
        let obs = env
            .execute("echo $SWE_HARNESS_TEST_VAR; test -n \"$PATH\" && echo has-path", None, None)
            .await
            .unwrap();
        assert_eq!(obs.output, "set\nhas-path\n");
    }

    #[tokio::test]
    async fn test_cwd_per_call_overrides_config() {
        let configured = TempDir::new().unwrap();
        let per_call = TempDir::new().unwrap();
        let config_dir = configured.path().to_string_lossy().into_owned();
        let call_dir = per_call.path().to_string_lossy().into_owned();
        let env = LocalEnvironment::new(LocalEnvironmentConfig::default().with_cwd(config_dir.clone()));

        let obs = env.execute("pwd", None, None).await.unwrap();
        assert_eq!(obs.output.trim(), std::fs::canonicalize(&config_dir).unwrap().to_string_lossy());

        let obs = env.execute("pwd", Some(&call_dir), None).await.unwrap();
        assert_eq!(obs.output.trim(), std::fs::canonicalize(&call_dir).unwrap().to_string_lossy());
    }

    #[tokio::test]
    async fn test_timeout_preserves_partial_output() {
        let env = LocalEnvironment::default();
        let err = env
            .execute("echo $((111*9)); sleep 10", None, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        match err {
            EnvironmentError::Timeout { output, .. } => assert!(output.contains("999")),
            other => panic!("unexpected error: {:?}", other),
        }
        // The environment stays usable after a timeout.
        let obs = env.execute("echo again", None, None).await.unwrap();
        assert_eq!(obs.output, "again\n");
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let env = LocalEnvironment::default();
        env.dispose().await;
        env.dispose().await;
        assert_eq!(env.kind(), "local");
    }
}
