//! Batch progress tracking.
//!
//! [`ProgressManager`] records which instances are running, their latest
//! status line and the final exit status of every finished instance. After
//! each finished instance the exit-status report is rewritten as YAML.
//! [`ProgressMonitor`] periodically logs a summary of it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

/// Exit statuses mapped to the instances that ended with them.
pub type ExitStatusMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default)]
struct ProgressState {
    running: BTreeMap<String, String>,
    by_exit_status: ExitStatusMap,
    completed: usize,
}

#[derive(Serialize)]
struct ExitStatusReport<'a> {
    instances_by_exit_status: &'a ExitStatusMap,
}

/// Point-in-time view of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSnapshot {
    pub total: usize,
    pub completed: usize,
    pub running: usize,
    pub exit_status_counts: BTreeMap<String, usize>,
    pub elapsed: Duration,
}

/// Thread-safe progress registry shared by all batch workers.
#[derive(Debug)]
pub struct ProgressManager {
    total: usize,
    report_path: Option<PathBuf>,
    state: Mutex<ProgressState>,
    start: Instant,
}

impl ProgressManager {
    /// Track `total` instances (zero is fine), optionally writing the
    /// exit-status report to `report_path`.
    pub fn new(total: usize, report_path: Option<PathBuf>) -> Self {
        Self {
            total,
            report_path,
            state: Mutex::new(ProgressState::default()),
            start: Instant::now(),
        }
    }

    /// Report path `<output>/exit_statuses_<unix-ts>.yaml`.
    pub fn report_path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(format!(
            "exit_statuses_{}.yaml",
            chrono::Utc::now().timestamp()
        ))
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }

    pub fn on_instance_start(&self, instance_id: &str) {
        self.state()
            .running
            .insert(instance_id.to_string(), "Starting".to_string());
        tracing::debug!(instance_id, "Instance started");
    }

    /// Replace the status line of a running instance.
    pub fn update_instance_status(&self, instance_id: &str, message: &str) {
        let mut state = self.state();
        if let Some(status) = state.running.get_mut(instance_id) {
            *status = message.to_string();
        }
    }

    pub fn on_instance_end(&self, instance_id: &str, exit_status: &str) {
        {
            let mut state = self.state();
            state.running.remove(instance_id);
            state
                .by_exit_status
                .entry(exit_status.to_string())
                .or_default()
                .push(instance_id.to_string());
            state.completed += 1;
            // Written under the lock so an older map never lands last.
            self.write_report(&state.by_exit_status);
        }
        tracing::info!(instance_id, exit_status, "Instance finished");
    }

    /// End an instance whose worker failed outside the agent.
    pub fn on_uncaught_exception(&self, instance_id: &str, error_type: &str, message: &str) {
        tracing::error!(instance_id, error_type, error = %message, "Uncaught error in instance worker");
        self.on_instance_end(instance_id, &format!("Uncaught {}", error_type));
    }

    pub fn instances_by_exit_status(&self) -> ExitStatusMap {
        self.state().by_exit_status.clone()
    }

    /// Running instances with their latest status line.
    pub fn running(&self) -> BTreeMap<String, String> {
        self.state().running.clone()
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let state = self.state();
        BatchSnapshot {
            total: self.total,
            completed: state.completed,
            running: state.running.len(),
            exit_status_counts: state
                .by_exit_status
                .iter()
                .map(|(status, ids)| (status.clone(), ids.len()))
                .collect(),
            elapsed: self.start.elapsed(),
        }
    }

    fn write_report(&self, by_exit_status: &ExitStatusMap) {
        let Some(path) = &self.report_path else {
            return;
        };
        let report = ExitStatusReport {
            instances_by_exit_status: by_exit_status,
        };
        let result = serde_yaml::to_string(&report)
            .map_err(|e| e.to_string())
            .and_then(|yaml| std::fs::write(path, yaml).map_err(|e| e.to_string()));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write exit status report");
        }
    }
}

/// Background task logging a batch summary every `interval`.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn start(progress: Arc<ProgressManager>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = progress.snapshot();
                let pct = if snap.total > 0 {
                    (snap.completed as f64 / snap.total as f64 * 100.0).min(100.0)
                } else {
                    100.0
                };
                let statuses = snap
                    .exit_status_counts
                    .iter()
                    .map(|(status, n)| format!("{}={}", status, n))
                    .collect::<Vec<_>>()
                    .join(", ");

                tracing::info!(
                    completed = snap.completed,
                    total = snap.total,
                    running = snap.running,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    exit_statuses = %statuses,
                    "Batch progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
