//! Execution inside a writable Singularity/Apptainer sandbox.
//!
//! The sandbox is built once from the source image into a fresh directory
//! under the system temp dir. A failed build is retried into a brand-new
//! directory each time; the half-built one is removed first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use crate::environment::process::{run_helper, run_with_timeout};
use crate::environment::{
    container_env, default_timeout_secs, executable_from_env, unique_suffix, Environment,
    Observation,
};
use crate::error::EnvironmentError;

/// Environment variable overriding the singularity executable.
pub const SINGULARITY_EXECUTABLE_ENV: &str = "SWE_HARNESS_SINGULARITY_EXECUTABLE";

fn default_cwd() -> String {
    "/".to_string()
}

fn default_executable() -> String {
    executable_from_env(SINGULARITY_EXECUTABLE_ENV, "singularity")
}

fn default_build_retries() -> u32 {
    3
}

fn default_build_timeout() -> u64 {
    3600
}

/// Configuration for [`SingularityEnvironment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingularityEnvironmentConfig {
    /// Source image, e.g. `docker://python:3.12`.
    pub image: String,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Number of build attempts before giving up.
    #[serde(default = "default_build_retries")]
    pub sandbox_build_retries: u32,
    /// Seconds allowed for a single build attempt.
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,
}

impl SingularityEnvironmentConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cwd: default_cwd(),
            env: BTreeMap::new(),
            forward_env: Vec::new(),
            timeout: default_timeout_secs(),
            executable: default_executable(),
            sandbox_build_retries: default_build_retries(),
            build_timeout: default_build_timeout(),
        }
    }

    fn exec_command(&self, sandbox_dir: &Path, cwd: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--contain".to_string(),
            "--cleanenv".to_string(),
        ];
        if !cwd.is_empty() && cwd != "/" {
            args.push("--pwd".to_string());
            args.push(cwd.to_string());
        }
        for (key, value) in container_env(&self.forward_env, &self.env) {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend([
            "--writable".to_string(),
            sandbox_dir.to_string_lossy().into_owned(),
            "bash".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
        args
    }
}

/// A writable sandbox directory built from an image.
pub struct SingularityEnvironment {
    config: SingularityEnvironmentConfig,
    sandbox_dir: PathBuf,
    disposed: AtomicBool,
}

impl SingularityEnvironment {
    /// Build the sandbox, retrying into fresh directories on failure.
    pub async fn build(config: SingularityEnvironmentConfig) -> Result<Self, EnvironmentError> {
        let attempts = config.sandbox_build_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let sandbox_dir = std::env::temp_dir().join(format!("swe-harness-{}", unique_suffix()));
            let args = vec![
                "build".to_string(),
                "--sandbox".to_string(),
                sandbox_dir.to_string_lossy().into_owned(),
                config.image.clone(),
            ];
            let built = run_helper(
                &config.executable,
                &args,
                Duration::from_secs(config.build_timeout),
            )
            .await;

            match built {
                Ok(out) if out.success() => {
                    tracing::info!(
                        image = %config.image,
                        sandbox = %sandbox_dir.display(),
                        attempt,
                        "Sandbox built"
                    );
                    return Ok(Self {
                        config,
                        sandbox_dir,
                        disposed: AtomicBool::new(false),
                    });
                }
                Ok(out) => last_error = out.output.trim().to_string(),
                Err(EnvironmentError::SpawnFailed { program, reason }) => {
                    return Err(EnvironmentError::SpawnFailed { program, reason });
                }
                Err(e) => last_error = e.to_string(),
            }

            remove_dir(&sandbox_dir);
            tracing::error!(
                image = %config.image,
                attempt,
                max_attempts = attempts,
                error = %last_error,
                "Error building sandbox"
            );
        }

        Err(EnvironmentError::BuildFailed {
            attempts,
            reason: last_error,
        })
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }
}

fn remove_dir(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove sandbox directory");
        }
    }
}

#[async_trait]
impl Environment for SingularityEnvironment {
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EnvironmentError::Disposed);
        }
        let work_dir = cwd
            .filter(|dir| !dir.is_empty())
            .unwrap_or(self.config.cwd.as_str());
        let mut process = Command::new(&self.config.executable);
        process.args(self.config.exec_command(&self.sandbox_dir, work_dir, command));

        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.timeout));
        let out = run_with_timeout(process, timeout).await?;
        Ok(Observation::new(out.returncode, out.output))
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dir = self.sandbox_dir.clone();
        // Sandboxes can hold many files
        let _ = tokio::task::spawn_blocking(move || remove_dir(&dir)).await;
        tracing::debug!(sandbox = %self.sandbox_dir.display(), "Sandbox removed");
    }

    fn template_vars(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}))
    }

    fn kind(&self) -> &'static str {
        "singularity"
    }
}

impl Drop for SingularityEnvironment {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            remove_dir(&self.sandbox_dir);
        }
    }
}
