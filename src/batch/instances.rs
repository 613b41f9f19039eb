//! Batch instances and their selection.
//!
//! Instances come from a JSON array or a JSON Lines file. Selection applies
//! the id filter, then the slice, then the optional seeded shuffle.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BatchError;

/// One task for the batch runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub problem_statement: String,
    /// Container image; derived from the id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    /// Remaining dataset fields, available to the startup command template.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    pub fn new(instance_id: impl Into<String>, problem_statement: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            problem_statement: problem_statement.into(),
            image_name: None,
            extra: Map::new(),
        }
    }

    pub fn with_image_name(mut self, image: impl Into<String>) -> Self {
        self.image_name = Some(image.into());
        self
    }

    /// The configured image, or the SWE-bench evaluation image for this id.
    pub fn image(&self) -> String {
        self.image_name
            .clone()
            .unwrap_or_else(|| default_image_name(&self.instance_id))
    }
}

/// SWE-bench image name for an instance id.
///
/// Docker refuses `__` in repository names, so it is replaced by `_1776_`.
pub fn default_image_name(instance_id: &str) -> String {
    let docker_id = instance_id.replace("__", "_1776_");
    format!("docker.io/swebench/sweb.eval.x86_64.{}:latest", docker_id).to_lowercase()
}

/// Load instances from a JSON array or a JSON Lines file.
pub async fn load_instances(path: &Path) -> Result<Vec<Instance>, BatchError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| BatchError::InstanceLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    parse_instances(&contents).map_err(|reason| BatchError::InstanceLoad {
        path: path.display().to_string(),
        reason,
    })
}

fn parse_instances(contents: &str) -> Result<Vec<Instance>, String> {
    let trimmed = contents.trim_start();
    let instances: Vec<Instance> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| e.to_string())?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| format!("line {}: {}", i + 1, e))
            })
            .collect::<Result<_, _>>()?
    };
    for instance in &instances {
        validate_instance_id(&instance.instance_id).map_err(|e| e.to_string())?;
    }
    Ok(instances)
}

/// Instance ids name output directories, so each must be one plain path
/// component.
pub fn validate_instance_id(instance_id: &str) -> Result<(), BatchError> {
    let invalid = instance_id.is_empty()
        || instance_id == "."
        || instance_id == ".."
        || instance_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BatchError::InvalidInstanceId(instance_id.to_string()));
    }
    Ok(())
}

/// How to narrow and order a list of instances.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceSelection {
    /// Regex matched against the start of each instance id.
    #[serde(default)]
    pub filter: String,
    /// Python-style `start:stop` over the filtered list.
    #[serde(default)]
    pub slice: String,
    /// Seed for a deterministic shuffle of the selected instances.
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
}

impl InstanceSelection {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_slice(mut self, slice: impl Into<String>) -> Self {
        self.slice = slice.into();
        self
    }

    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Filter, slice, then shuffle.
    pub fn apply(&self, instances: Vec<Instance>) -> Result<Vec<Instance>, BatchError> {
        let before = instances.len();
        let mut selected = filter_instances(instances, &self.filter)?;
        if selected.len() != before {
            tracing::info!(before, after = selected.len(), "Instance filter applied");
        }

        if !self.slice.is_empty() {
            let (start, stop) = slice_bounds(&self.slice, selected.len())?;
            let after_filter = selected.len();
            selected = selected.drain(start..stop).collect();
            tracing::info!(before = after_filter, after = selected.len(), "Instance slice applied");
        }

        if let Some(seed) = self.shuffle_seed {
            // Sort first so the order only depends on the seed, not the input.
            selected.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            selected.shuffle(&mut rng);
        }
        Ok(selected)
    }
}

fn filter_instances(instances: Vec<Instance>, pattern: &str) -> Result<Vec<Instance>, BatchError> {
    if pattern.is_empty() {
        return Ok(instances);
    }
    let re = Regex::new(&format!("^(?:{})", pattern)).map_err(|source| {
        BatchError::InvalidFilter {
            pattern: pattern.to_string(),
            source,
        }
    })?;
    Ok(instances
        .into_iter()
        .filter(|instance| re.is_match(&instance.instance_id))
        .collect())
}

/// Resolve `start:stop` (either side optional, negatives count from the
/// end) to clamped bounds over a list of `len` items. A bare `n` means `:n`.
fn slice_bounds(spec: &str, len: usize) -> Result<(usize, usize), BatchError> {
    let invalid = || BatchError::InvalidSlice(spec.to_string());
    let parts: Vec<&str> = spec.split(':').collect();
    let parse = |s: &str| -> Result<Option<i64>, BatchError> {
        let s = s.trim();
        if s.is_empty() {
            Ok(None)
        } else {
            s.parse::<i64>().map(Some).map_err(|_| invalid())
        }
    };
    let (start, stop) = match parts.as_slice() {
        [stop] => (None, parse(stop)?),
        [start, stop] => (parse(start)?, parse(stop)?),
        _ => return Err(invalid()),
    };

    let len_i = len as i64;
    let resolve = |bound: i64| -> usize {
        let idx = if bound < 0 { len_i + bound } else { bound };
        idx.clamp(0, len_i) as usize
    };
    let start = start.map(resolve).unwrap_or(0);
    let stop = stop.map(resolve).unwrap_or(len);
    Ok((start, stop.max(start)))
}
