//! File storage for trajectories.
//!
//! Each instance gets its own directory under the output root:
//! `<output>/<instance_id>/<instance_id>.traj.json`.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::TrajectoryRecord;
use crate::error::TrajectoryError;

/// Trajectory files below one output directory.
#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    /// Base path for storing trajectory files.
    base_path: PathBuf,
}

impl TrajectoryStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Where the trajectory of `instance_id` lives.
    pub fn trajectory_path(&self, instance_id: &str) -> PathBuf {
        self.base_path
            .join(instance_id)
            .join(format!("{}.traj.json", instance_id))
    }

    /// Save a record, replacing any previous one for the same instance.
    pub async fn save(&self, record: &TrajectoryRecord) -> Result<PathBuf, TrajectoryError> {
        let path = self.trajectory_path(&record.instance_id);
        save_trajectory(&path, record).await?;
        Ok(path)
    }

    /// Load the record of `instance_id`.
    pub async fn load(&self, instance_id: &str) -> Result<TrajectoryRecord, TrajectoryError> {
        let contents = fs::read_to_string(self.trajectory_path(instance_id)).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Remove a stale trajectory. Missing files are not an error.
    pub async fn remove(&self, instance_id: &str) -> Result<(), TrajectoryError> {
        match fs::remove_file(self.trajectory_path(instance_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, instance_id: &str) -> bool {
        self.trajectory_path(instance_id).exists()
    }
}

/// Write `record` as pretty JSON to `path`, creating parent directories.
pub async fn save_trajectory(path: &Path, record: &TrajectoryRecord) -> Result<(), TrajectoryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    // Serialize to pretty JSON for readability
    let json = serde_json::to_string_pretty(record)?;

    let mut file = fs::File::create(path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    tracing::debug!(path = %path.display(), "Saved trajectory");
    Ok(())
}
