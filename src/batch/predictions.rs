//! The shared predictions file of a batch run.
//!
//! `<output>/preds.json` maps each instance id to its submission. Every
//! update is a read-modify-write under one lock, so concurrent instance
//! completions never drop each other's entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::TrajectoryError;

/// File name of the predictions file inside the output directory.
pub const PREDICTIONS_FILE: &str = "preds.json";

/// One entry of the predictions file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_name_or_path: String,
    pub instance_id: String,
    pub model_patch: String,
}

pub type Predictions = BTreeMap<String, Prediction>;

/// Serialized access to a predictions file.
#[derive(Debug)]
pub struct PredictionsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PredictionsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The predictions file of an output directory.
    pub fn in_dir(output_dir: &Path) -> Self {
        Self::new(output_dir.join(PREDICTIONS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents; empty when the file does not exist yet.
    pub async fn load(&self) -> Result<Predictions, TrajectoryError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Insert or replace the entry of `instance_id`.
    pub async fn upsert(
        &self,
        instance_id: &str,
        model_name: &str,
        model_patch: &str,
    ) -> Result<(), TrajectoryError> {
        let _guard = self.lock.lock().await;
        let mut predictions = self.read().await?;
        predictions.insert(
            instance_id.to_string(),
            Prediction {
                model_name_or_path: model_name.to_string(),
                instance_id: instance_id.to_string(),
                model_patch: model_patch.to_string(),
            },
        );
        self.write(&predictions).await?;
        tracing::debug!(instance_id, path = %self.path.display(), "Updated predictions");
        Ok(())
    }

    /// Drop the entry of `instance_id` if present.
    pub async fn remove(&self, instance_id: &str) -> Result<(), TrajectoryError> {
        let _guard = self.lock.lock().await;
        if !self.path.exists() {
            return Ok(());
        }
        let mut predictions = self.read().await?;
        if predictions.remove(instance_id).is_some() {
            self.write(&predictions).await?;
        }
        Ok(())
    }

    async fn read(&self) -> Result<Predictions, TrajectoryError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| TrajectoryError::InvalidPredictions {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Predictions::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, predictions: &Predictions) -> Result<(), TrajectoryError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(predictions)?;
        // Replace atomically so readers never see a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let preds = PredictionsFile::in_dir(dir.path());
        assert!(preds.load().await.unwrap().is_empty());
        preds.remove("anything").await.unwrap();
        assert!(!preds.path().exists());
    }

    #[tokio::test]
    async fn test_upsert_replaces_only_its_entry() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let preds = PredictionsFile::in_dir(dir.path());
        preds.upsert("a", "model", "first").await.unwrap();
        preds.upsert("b", "model", "other").await.unwrap();
        preds.upsert("a", "model", "second").await.unwrap();

        let loaded = preds.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["a"].model_patch, "second");
        assert_eq!(loaded["b"].model_patch, "other");

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(preds.path()).unwrap()).unwrap();
        assert_eq!(raw["a"]["instance_id"], "a");
        assert_eq!(raw["a"]["model_name_or_path"], "model");
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let preds = PredictionsFile::in_dir(dir.path());
        preds.upsert("a", "m", "p").await.unwrap();
        preds.upsert("b", "m", "p").await.unwrap();
        preds.remove("a").await.unwrap();
        let loaded = preds.load().await.unwrap();
        assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_not_lost() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let preds = Arc::new(PredictionsFile::in_dir(dir.path()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let preds = preds.clone();
            handles.push(tokio::spawn(async move {
                preds.upsert(&format!("inst-{}", i), "m", "patch").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(preds.load().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let preds = PredictionsFile::in_dir(dir.path());
        std::fs::write(preds.path(), "not json").unwrap();
        assert!(matches!(
            preds.upsert("a", "m", "p").await,
            Err(TrajectoryError::InvalidPredictions { .. })
        ));
    }
}
