//! Execution inside a Docker (or Podman) container.
//!
//! One container is started per environment with `sleep <container_timeout>`
//! as its main process, so it stops on its own if the harness dies. Commands
//! run through `docker exec`. Nothing from the host leaks in except the
//! variables listed in `forward_env`.

use std::collections::BTreeMap;
use std::process::Stdio;
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

/// Environment variable overriding the docker executable.
pub const DOCKER_EXECUTABLE_ENV: &str = "SWE_HARNESS_DOCKER_EXECUTABLE";

const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

fn default_cwd() -> String {
    "/".to_string()
}

fn default_executable() -> String {
    executable_from_env(DOCKER_EXECUTABLE_ENV, "docker")
}

fn default_run_args() -> Vec<String> {
    vec!["--rm".to_string()]
}

fn default_container_timeout() -> String {
    "2h".to_string()
}

fn default_pull_timeout() -> u64 {
    120
}

/// Configuration for [`DockerEnvironment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerEnvironmentConfig {
    pub image: String,
    /// Working directory inside the container.
    #[serde(default = "default_cwd")]
    pub cwd: String,
    /// Variables set in the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host variables copied into the container at call time.
    #[serde(default)]
    pub forward_env: Vec<String>,
    /// Default command timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Extra `docker run` arguments.
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,
    /// Lifetime of the container's `sleep` process (e.g. `2h`).
    #[serde(default = "default_container_timeout")]
    pub container_timeout: String,
    /// Seconds allowed for `docker run`, image pull included.
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: u64,
}

impl DockerEnvironmentConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cwd: default_cwd(),
            env: BTreeMap::new(),
            forward_env: Vec::new(),
            timeout: default_timeout_secs(),
            executable: default_executable(),
            run_args: default_run_args(),
            container_timeout: default_container_timeout(),
            pull_timeout: default_pull_timeout(),
        }
    }

    fn run_command(&self, container_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-w".to_string(),
            self.cwd.clone(),
        ];
        args.extend(self.run_args.iter().cloned());
        args.extend([
            self.image.clone(),
            "sleep".to_string(),
            self.container_timeout.clone(),
        ]);
        args
    }

    fn exec_command(&self, container_id: &str, cwd: &str, command: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-w".to_string(), cwd.to_string()];
        for (key, value) in container_env(&self.forward_env, &self.env) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend([
            container_id.to_string(),
            "bash".to_string(),
            "-lc".to_string(),
            command.to_string(),
        ]);
        args
    }
}

/// A running container that executes agent commands.
pub struct DockerEnvironment {
    config: DockerEnvironmentConfig,
    container_name: String,
    container_id: String,
    stopped: AtomicBool,
    disposed: AtomicBool,
}

impl DockerEnvironment {
    /// Start the container. Fails if the image cannot be pulled or run.
    pub async fn start(config: DockerEnvironmentConfig) -> Result<Self, EnvironmentError> {
        let container_name = format!("swe-harness-{}", unique_suffix());
        let args = config.run_command(&container_name);
        tracing::debug!(
            container = %container_name,
            image = %config.image,
            "Starting container"
        );

        let started = match run_helper(
            &config.executable,
            &args,
            Duration::from_secs(config.pull_timeout),
        )
        .await
        {
            Ok(started) => started,
            Err(EnvironmentError::Timeout { timeout, .. }) => {
                // The daemon may still create the container after the client is killed.
                remove_container(&config.executable, &container_name).await;
                return Err(EnvironmentError::StartFailed(format!(
                    "docker run for image '{}' did not finish within {}s",
                    config.image,
                    timeout.as_secs()
                )));
            }
            Err(e) => return Err(e),
        };

        if !started.success() {
            return Err(EnvironmentError::StartFailed(format!(
                "image '{}': {}",
                config.image,
                started.output.trim()
            )));
        }

        let container_id = started
            .output
            .lines()
            .last()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        tracing::info!(
            container = %container_name,
            id = %container_id,
            image = %config.image,
            "Container started"
        );

        Ok(Self {
            config,
            container_name,
            container_id,
            stopped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Container name (useful for logging).
    pub fn name(&self) -> &str {
        &self.container_name
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Whether the container is still running, according to `docker inspect`.
    async fn is_running(&self) -> bool {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            self.container_id.clone(),
        ];
        match run_helper(&self.config.executable, &args, INSPECT_TIMEOUT).await {
            Ok(out) => out.success() && out.output.trim() == "true",
            Err(_) => false,
        }
    }

    fn unavailable(&self) -> EnvironmentError {
        EnvironmentError::ContainerUnavailable(self.container_name.clone())
    }
}

/// `docker rm -f` by name or id, logging failures only.
async fn remove_container(executable: &str, container: &str) {
    let remove = vec!["rm".to_string(), "-f".to_string(), container.to_string()];
    if let Err(e) = run_helper(executable, &remove, STOP_TIMEOUT).await {
        tracing::debug!(container, error = %e, "Failed to remove container");
    }
}

fn looks_like_missing_container(output: &str) -> bool {
    output.contains("No such container") || output.contains("is not running")
}

#[async_trait]
impl Environment for DockerEnvironment {
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(EnvironmentError::Disposed);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }

        let work_dir = cwd
            .filter(|dir| !dir.is_empty())
            .unwrap_or(self.config.cwd.as_str());
        let mut process = Command::new(&self.config.executable);
        process.args(self.config.exec_command(&self.container_id, work_dir, command));

        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.timeout));
        let out = run_with_timeout(process, timeout).await?;

        if out.returncode != 0 && looks_like_missing_container(&out.output) && !self.is_running().await
        {
            tracing::warn!(container = %self.container_name, "Container is no longer running");
            self.stopped.store(true, Ordering::SeqCst);
            return Err(self.unavailable());
        }
        Ok(Observation::new(out.returncode, out.output))
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let stop = vec!["stop".to_string(), self.container_id.clone()];
        let stopped = matches!(
            run_helper(&self.config.executable, &stop, STOP_TIMEOUT).await,
            Ok(out) if out.success()
        );
        if !stopped {
            remove_container(&self.config.executable, &self.container_id).await;
        }
        tracing::debug!(container = %self.container_name, "Container disposed");
    }

    fn template_vars(&self) -> Value {
        let mut vars = serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut vars {
            map.insert("container_name".to_string(), json!(self.container_name));
        }
        vars
    }

    fn kind(&self) -> &'static str {
        "docker"
    }
}

/// Ensure the container is removed when dropped (best-effort sync cleanup).
impl Drop for DockerEnvironment {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let executable = self.config.executable.clone();
        let id = self.container_id.clone();
        // Fire-and-forget: Drop cannot await
        std::thread::spawn(move || {
            let _ = std::process::Command::new(executable)
                .args(["rm", "-f", &id])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        });
    }
}
