//! Execution inside an unprivileged bubblewrap sandbox (Linux only).
//!
//! Each environment owns one working directory under the system temp dir.
//! Commands see a read-only view of the core system directories, a private
//! `/tmp`, and the working directory bound read-write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::environment::process::run_with_timeout;
use crate::environment::{
    default_timeout_secs, executable_from_env, unique_suffix, Environment, Observation,
};
use crate::error::EnvironmentError;

/// Environment variable overriding the bwrap executable.
pub const BUBBLEWRAP_EXECUTABLE_ENV: &str = "SWE_HARNESS_BUBBLEWRAP_EXECUTABLE";

fn default_executable() -> String {
    executable_from_env(BUBBLEWRAP_EXECUTABLE_ENV, "bwrap")
}

fn default_wrapper_args() -> Vec<String> {
    [
        "--unshare-user-try",
        "--ro-bind", "/usr", "/usr",
        "--ro-bind", "/bin", "/bin",
        "--ro-bind", "/lib", "/lib",
        "--ro-bind", "/lib64", "/lib64",
        "--ro-bind", "/etc", "/etc",
        "--tmpfs", "/tmp",
        "--proc", "/proc",
        "--dev", "/dev",
        "--new-session",
        "--setenv", "PATH", "/usr/local/bin:/usr/sbin:/usr/bin:/bin",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Configuration for [`BubblewrapEnvironment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BubblewrapEnvironmentConfig {
    /// Working directory; empty means the environment's own directory.
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments placed before the per-call binds.
    #[serde(default = "default_wrapper_args")]
    pub wrapper_args: Vec<String>,
}

impl Default for BubblewrapEnvironmentConfig {
    fn default() -> Self {
        Self {
            cwd: String::new(),
            env: BTreeMap::new(),
            timeout: default_timeout_secs(),
            executable: default_executable(),
            wrapper_args: default_wrapper_args(),
        }
    }
}

impl BubblewrapEnvironmentConfig {
    fn command_args(&self, cwd: &str, command: &str) -> Vec<String> {
        let mut args = self.wrapper_args.clone();
        args.extend([
            "--bind".to_string(),
            cwd.to_string(),
            cwd.to_string(),
            "--chdir".to_string(),
            cwd.to_string(),
        ]);
        for (key, value) in &self.env {
            args.extend(["--setenv".to_string(), key.clone(), value.clone()]);
        }
        args.extend(["bash".to_string(), "-c".to_string(), command.to_string()]);
        args
    }
}

/// A namespace sandbox with its own working directory.
pub struct BubblewrapEnvironment {
    config: BubblewrapEnvironmentConfig,
    working_dir: PathBuf,
    disposed: AtomicBool,
}

impl BubblewrapEnvironment {
    /// Create the working directory.
    pub fn new(config: BubblewrapEnvironmentConfig) -> Result<Self, EnvironmentError> {
        let working_dir = std::env::temp_dir().join(format!("swe-harness-{}", unique_suffix()));
        std::fs::create_dir_all(&working_dir)?;
        tracing::debug!(working_dir = %working_dir.display(), "Bubblewrap working directory created");
        Ok(Self {
            config,
            working_dir,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn cleanup(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.working_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    working_dir = %self.working_dir.display(),
                    error = %e,
                    "Failed to remove working directory"
                );
            }
        }
    }
}

#[async_trait]
impl Environment for BubblewrapEnvironment {
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EnvironmentError::Disposed);
        }
        let own_dir = self.working_dir.to_string_lossy();
        let work_dir = cwd
            .filter(|dir| !dir.is_empty())
            .or(Some(self.config.cwd.as_str()).filter(|dir| !dir.is_empty()))
            .unwrap_or(own_dir.as_ref());

        let mut process = Command::new(&self.config.executable);
        process.args(self.config.command_args(work_dir, command));

        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.timeout));
        let out = run_with_timeout(process, timeout).await?;
        Ok(Observation::new(out.returncode, out.output))
    }

    async fn dispose(&self) {
        self.cleanup();
    }

    fn template_vars(&self) -> Value {
        let mut vars = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut vars {
            map.insert("working_dir".to_string(), json!(self.working_dir));
            map.insert("system".to_string(), json!(std::env::consts::OS));
            map.insert("machine".to_string(), json!(std::env::consts::ARCH));
        }
        vars
    }

    fn kind(&self) -> &'static str {
        "bubblewrap"
    }
}

impl Drop for BubblewrapEnvironment {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args_layout() {
        let mut config = BubblewrapEnvironmentConfig::default();
        config.env.insert("FOO".to_string(), "bar".to_string());
        let args = config.command_args("/work", "ls");
        let n = config.wrapper_args.len();
        assert_eq!(args[0], "--unshare-user-try");
        assert_eq!(
            &args[n..],
            &["--bind", "/work", "/work", "--chdir", "/work", "--setenv", "FOO", "bar", "bash", "-c", "ls"]
        );
    }

    #[test]
    fn test_working_dir_lifecycle() {
        let env = BubblewrapEnvironment::new(BubblewrapEnvironmentConfig::default()).unwrap();
        let dir = env.working_dir().to_path_buf();
        assert!(dir.is_dir());
        env.cleanup();
        env.cleanup();
        assert!(!dir.exists());
    }

    #[test]
    fn test_drop_removes_working_dir() {
        let env = BubblewrapEnvironment::new(BubblewrapEnvironmentConfig::default()).unwrap();
        let dir = env.working_dir().to_path_buf();
        drop(env);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_execute_after_dispose_fails() {
        let env = BubblewrapEnvironment::new(BubblewrapEnvironmentConfig::default()).unwrap();
        env.dispose().await;
        env.dispose().await;
        assert!(matches!(
            env.execute("true", None, None).await,
            Err(EnvironmentError::Disposed)
        ));
    }

    #[tokio::test]
    #[ignore = "requires bwrap"]
    async fn test_live_execute_in_working_dir() {
        let env = BubblewrapEnvironment::new(BubblewrapEnvironmentConfig::default()).unwrap();
        let obs = env.execute("touch marker && pwd", None, None).await.unwrap();
        assert_eq!(obs.returncode, 0);
        assert_eq!(obs.output.trim(), env.working_dir().to_string_lossy());
        assert!(env.working_dir().join("marker").exists());
        env.dispose().await;
    }
}
