//! Execution environments for agent actions.
//!
//! An [`Environment`] runs one shell command at a time and reports its merged
//! output and exit code. Four isolation strategies are available:
//!
//! - [`LocalEnvironment`]: directly on the host
//! - [`DockerEnvironment`]: inside a long-lived container
//! - [`SingularityEnvironment`]: inside a writable sandbox built from an image
//! - [`BubblewrapEnvironment`]: inside an unprivileged namespace sandbox
//!
//! Every variant must be disposed by its owner; `dispose` is idempotent.

pub mod bubblewrap;
pub mod docker;
pub mod local;
pub mod process;
pub mod singularity;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvironmentError;

pub use bubblewrap::{BubblewrapEnvironment, BubblewrapEnvironmentConfig};
pub use docker::{DockerEnvironment, DockerEnvironmentConfig};
pub use local::{LocalEnvironment, LocalEnvironmentConfig};
pub use process::{run_with_timeout, ProcessOutput};
pub use singularity::{SingularityEnvironment, SingularityEnvironmentConfig};

/// Default command timeout in seconds for every variant.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub(crate) fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Result of one executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub returncode: i32,
    /// Merged stdout and stderr.
    pub output: String,
    #[serde(default)]
    pub timed_out: bool,
}

impl Observation {
    pub fn new(returncode: i32, output: impl Into<String>) -> Self {
        Self {
            returncode,
            output: output.into(),
            timed_out: false,
        }
    }

    /// Observation for a command killed at its deadline.
    pub fn timed_out(output: impl Into<String>) -> Self {
        Self {
            returncode: -1,
            output: output.into(),
            timed_out: true,
        }
    }
}

/// A place where agent commands run.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Execute `command` with `bash`.
    ///
    /// `cwd` and `timeout` override the configured defaults. A timeout is
    /// reported as [`EnvironmentError::Timeout`] carrying the partial output.
    async fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Observation, EnvironmentError>;

    /// Release every resource held by the environment. Safe to call twice.
    async fn dispose(&self);

    /// Variables exposed to prompt templates and the trajectory config.
    fn template_vars(&self) -> Value;

    /// Short class name recorded in trajectories (`environment_type`).
    fn kind(&self) -> &'static str;
}

/// Environment selection, tagged by `environment_class` in YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "environment_class", rename_all = "snake_case")]
pub enum EnvironmentConfig {
    Local(LocalEnvironmentConfig),
    Docker(DockerEnvironmentConfig),
    Singularity(SingularityEnvironmentConfig),
    Bubblewrap(BubblewrapEnvironmentConfig),
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig::Local(LocalEnvironmentConfig::default())
    }
}

impl EnvironmentConfig {
    /// The class name, as written in `environment_class`.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvironmentConfig::Local(_) => "local",
            EnvironmentConfig::Docker(_) => "docker",
            EnvironmentConfig::Singularity(_) => "singularity",
            EnvironmentConfig::Bubblewrap(_) => "bubblewrap",
        }
    }

    /// Whether this variant runs a container image.
    pub fn uses_image(&self) -> bool {
        matches!(
            self,
            EnvironmentConfig::Docker(_) | EnvironmentConfig::Singularity(_)
        )
    }

    /// Point an image-based variant at `image`.
    ///
    /// Singularity images without a transport get a `docker://` prefix.
    /// Variants without an image are returned unchanged.
    pub fn with_image(mut self, image: &str) -> Self {
        match &mut self {
            EnvironmentConfig::Docker(c) => c.image = image.to_string(),
            EnvironmentConfig::Singularity(c) => {
                c.image = if image.contains("://") {
                    image.to_string()
                } else {
                    format!("docker://{}", image)
                };
            }
            EnvironmentConfig::Local(_) | EnvironmentConfig::Bubblewrap(_) => {}
        }
        self
    }
}

/// Build an environment from its configuration.
///
/// Container variants start (or build) their sandbox here, so this can take
/// as long as an image pull.
pub async fn create_environment(
    config: &EnvironmentConfig,
) -> Result<Box<dyn Environment>, EnvironmentError> {
    let env: Box<dyn Environment> = match config {
        EnvironmentConfig::Local(c) => Box::new(LocalEnvironment::new(c.clone())),
        EnvironmentConfig::Docker(c) => Box::new(DockerEnvironment::start(c.clone()).await?),
        EnvironmentConfig::Singularity(c) => {
            Box::new(SingularityEnvironment::build(c.clone()).await?)
        }
        EnvironmentConfig::Bubblewrap(c) => Box::new(BubblewrapEnvironment::new(c.clone())?),
    };
    tracing::debug!(kind = env.kind(), "Created environment");
    Ok(env)
}

/// Short random suffix for container names and sandbox directories.
pub(crate) fn unique_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Resolve `forward_env` against the host plus explicit `env` overrides.
///
/// Missing host variables forward as empty strings; `env` wins on conflict.
pub(crate) fn container_env(
    forward_env: &[String],
    env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut resolved: BTreeMap<String, String> = forward_env
        .iter()
        .map(|key| (key.clone(), std::env::var(key).unwrap_or_default()))
        .collect();
    resolved.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
    resolved
}

/// Read an executable override from the environment.
pub(crate) fn executable_from_env(variable: &str, fallback: &str) -> String {
    std::env::var(variable)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
