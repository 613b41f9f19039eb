//! Concurrent batch runner.
//!
//! Every selected instance runs in its own tokio task behind a semaphore of
//! `workers` permits. A failure inside one instance becomes that instance's
//! outcome and never reaches its siblings; a panic is caught at the task
//! boundary and reported as `Uncaught Panic`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use super::instances::{validate_instance_id, Instance, InstanceSelection};
use super::predictions::PredictionsFile;
use super::progress::{ExitStatusMap, ProgressManager, ProgressMonitor};
use crate::agent::templates::{context_from, render};
use crate::agent::{AgentConfig, AgentError, AgentOutcome, DefaultAgent, StatusCallback};
use crate::environment::{create_environment, Environment, EnvironmentConfig};
use crate::error::{BatchError, EnvironmentError, LlmError};
use crate::llm::{create_model, Model, ModelConfig, SharedModelStats};
use crate::trajectory::{TrajectoryRecord, TrajectoryStore};

/// Exit status of an instance cancelled by an interrupt.
pub const INTERRUPTED: &str = "Interrupted";

fn default_workers() -> usize {
    1
}

fn default_progress_interval_secs() -> u64 {
    30
}

/// Batch options, the `run` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Number of instances processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(flatten)]
    pub selection: InstanceSelection,
    /// Run instances that already have a prediction again.
    #[serde(default)]
    pub redo_existing: bool,
    /// Command run in every fresh environment, rendered over the instance.
    #[serde(default)]
    pub env_startup_command: Option<String>,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            selection: InstanceSelection::default(),
            redo_existing: false,
            env_startup_command: None,
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl BatchSettings {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_selection(mut self, selection: InstanceSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_redo_existing(mut self, redo: bool) -> Self {
        self.redo_existing = redo;
        self
    }

    pub fn with_env_startup_command(mut self, command: impl Into<String>) -> Self {
        self.env_startup_command = Some(command.into());
        self
    }
}

/// Builds the model of one instance.
pub type ModelFactory =
    Arc<dyn Fn(&Instance) -> Result<Box<dyn Model>, LlmError> + Send + Sync>;

/// Result of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    /// Instances that were dispatched.
    pub processed: usize,
    /// Instances skipped because a prediction already existed.
    pub skipped: usize,
    pub instances_by_exit_status: ExitStatusMap,
    /// Whether the run was interrupted.
    pub interrupted: bool,
    pub report_path: Option<PathBuf>,
}

/// Everything a worker needs to process one instance.
struct InstanceContext {
    agent: AgentConfig,
    model: ModelConfig,
    environment: EnvironmentConfig,
    env_startup_command: Option<String>,
    stats: SharedModelStats,
    model_factory: Option<ModelFactory>,
    store: TrajectoryStore,
    predictions: PredictionsFile,
    progress: Arc<ProgressManager>,
}

/// Runs an agent over many instances with bounded concurrency.
pub struct BatchRunner {
    settings: BatchSettings,
    agent: AgentConfig,
    model: ModelConfig,
    environment: EnvironmentConfig,
    output_dir: PathBuf,
    stats: SharedModelStats,
    model_factory: Option<ModelFactory>,
    shutdown_tx: broadcast::Sender<()>,
    interrupted: Arc<AtomicBool>,
}

impl BatchRunner {
    pub fn new(
        settings: BatchSettings,
        agent: AgentConfig,
        model: ModelConfig,
        environment: EnvironmentConfig,
        output_dir: impl Into<PathBuf>,
        stats: SharedModelStats,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            settings,
            agent,
            model,
            environment,
            output_dir: output_dir.into(),
            stats,
            model_factory: None,
            shutdown_tx,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build models with `factory` instead of from the model config.
    pub fn with_model_factory(mut self, factory: ModelFactory) -> Self {
        self.model_factory = Some(factory);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Handle that interrupts the run from another task.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            interrupted: self.interrupted.clone(),
        }
    }

    /// Select, dispatch and await all instances.
    pub async fn run(&self, instances: Vec<Instance>) -> Result<BatchSummary, BatchError> {
        if self.settings.workers == 0 {
            return Err(BatchError::NoWorkers);
        }
        for instance in &instances {
            validate_instance_id(&instance.instance_id)?;
        }
        tokio::fs::create_dir_all(&self.output_dir).await?;
        info!(output = %self.output_dir.display(), "Results will be saved to output directory");

        let selected = self.settings.selection.apply(instances)?;
        let predictions = PredictionsFile::in_dir(&self.output_dir);
        let before_skip = selected.len();
        let pending: Vec<Instance> = if self.settings.redo_existing {
            selected
        } else {
            let existing = predictions.load().await?;
            selected
                .into_iter()
                .filter(|instance| !existing.contains_key(&instance.instance_id))
                .collect()
        };
        let skipped = before_skip - pending.len();
        if skipped > 0 {
            info!(skipped, "Skipping instances with existing predictions");
        }
        info!(
            instances = pending.len(),
            workers = self.settings.workers,
            "Running batch"
        );

        let progress = Arc::new(ProgressManager::new(
            pending.len(),
            Some(ProgressManager::report_path_in(&self.output_dir)),
        ));
        let ctx = Arc::new(InstanceContext {
            agent: self.agent.clone(),
            model: self.model.clone(),
            environment: self.environment.clone(),
            env_startup_command: self.settings.env_startup_command.clone(),
            stats: self.stats.clone(),
            model_factory: self.model_factory.clone(),
            store: TrajectoryStore::new(&self.output_dir),
            predictions,
            progress: progress.clone(),
        });

        let monitor = ProgressMonitor::start(
            progress.clone(),
            Duration::from_secs(self.settings.progress_interval_secs.max(1)),
        );
        let semaphore = Arc::new(Semaphore::new(self.settings.workers));
        let mut tasks = JoinSet::new();
        let processed = pending.len();

        for instance in pending {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let interrupted = self.interrupted.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = shutdown_rx.recv() => return,
                };
                if interrupted.load(Ordering::SeqCst) {
                    return;
                }

                let instance_id = instance.instance_id.clone();
                let worker = tokio::spawn(process_instance(ctx.clone(), instance, shutdown_rx));
                if let Err(e) = worker.await {
                    let (error_type, message) = describe_join_error(e);
                    ctx.progress
                        .on_uncaught_exception(&instance_id, error_type, &message);
                }
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Batch task failed");
            }
        }
        monitor.stop().await;

        let interrupted = self.interrupted.load(Ordering::SeqCst);
        let summary = BatchSummary {
            processed,
            skipped,
            instances_by_exit_status: progress.instances_by_exit_status(),
            interrupted,
            report_path: progress.report_path().map(Path::to_path_buf),
        };
        info!(
            completed = progress.snapshot().completed,
            interrupted,
            "Batch finished"
        );
        Ok(summary)
    }
}

/// Cancels a running batch.
#[derive(Clone)]
pub struct InterruptHandle {
    shutdown_tx: broadcast::Sender<()>,
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    /// Stop dispatching and cancel in-flight instances.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

fn describe_join_error(error: JoinError) -> (&'static str, String) {
    if error.is_panic() {
        let payload = error.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        ("Panic", message)
    } else {
        ("Cancelled", error.to_string())
    }
}

/// Run one instance end to end.
async fn process_instance(
    ctx: Arc<InstanceContext>,
    instance: Instance,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let instance_id = instance.instance_id.as_str();

    // Clear leftovers so a crash below never leaves a stale pairing.
    if let Err(e) = ctx.predictions.remove(instance_id).await {
        warn!(instance_id, error = %e, "Failed to remove stale prediction");
    }
    if let Err(e) = ctx.store.remove(instance_id).await {
        warn!(instance_id, error = %e, "Failed to remove stale trajectory");
    }

    ctx.progress.on_instance_start(instance_id);
    ctx.progress
        .update_instance_status(instance_id, "Pulling/starting environment");

    let mut model_name = ctx.model.model_name();
    let (outcome, record) = match prepare_agent(&ctx, &instance).await {
        Ok(mut agent) => {
            model_name = agent.model().model_name().to_string();
            let outcome = tokio::select! {
                outcome = agent.run(&instance.problem_statement) => outcome,
                _ = shutdown_rx.recv() => {
                    warn!(instance_id, "Instance interrupted");
                    AgentOutcome::new(INTERRUPTED, "Interrupted")
                }
            };
            let record = TrajectoryRecord::from_agent(instance_id, &agent, &outcome);
            agent.environment().dispose().await;
            (outcome, record)
        }
        Err(e) => {
            error!(instance_id, error = %e, "Failed to set up instance");
            let outcome = AgentOutcome::from_error(&e);
            let record = TrajectoryRecord::without_agent(instance_id, &outcome);
            (outcome, record)
        }
    };

    if let Some(traceback) = &outcome.traceback {
        error!(instance_id, exit_status = %outcome.exit_status, traceback = %traceback, "Instance failed");
    }

    match ctx.store.save(&record).await {
        Ok(path) => info!(instance_id, path = %path.display(), "Saved trajectory"),
        Err(e) => error!(instance_id, error = %e, "Failed to save trajectory"),
    }
    if outcome.exit_status != INTERRUPTED {
        if let Err(e) = ctx
            .predictions
            .upsert(instance_id, &model_name, &outcome.result)
            .await
        {
            error!(instance_id, error = %e, "Failed to update predictions");
        }
    }
    ctx.progress.on_instance_end(instance_id, &outcome.exit_status);
}

/// Build model, environment and agent for `instance`.
///
/// The environment is disposed here if anything after its construction
/// fails; otherwise the caller owns its disposal.
async fn prepare_agent(ctx: &InstanceContext, instance: &Instance) -> Result<DefaultAgent, AgentError> {
    let model = match &ctx.model_factory {
        Some(factory) => factory(instance)?,
        None => create_model(&ctx.model, ctx.stats.clone())?,
    };

    let env_config = ctx.environment.clone().with_image(&instance.image());
    let env: Arc<dyn Environment> = Arc::from(create_environment(&env_config).await?);

    if let Some(template) = &ctx.env_startup_command {
        if let Err(e) = run_startup_command(env.as_ref(), template, instance).await {
            env.dispose().await;
            return Err(e);
        }
    }

    let progress = ctx.progress.clone();
    let instance_id = instance.instance_id.clone();
    let on_status: StatusCallback =
        Arc::new(move |status: &str| progress.update_instance_status(&instance_id, status));

    Ok(DefaultAgent::new(ctx.agent.clone(), model, env).with_status_callback(on_status))
}

async fn run_startup_command(
    env: &dyn Environment,
    template: &str,
    instance: &Instance,
) -> Result<(), AgentError> {
    let vars = serde_json::to_value(instance).unwrap_or(Value::Null);
    let command = render("env_startup_command", template, &context_from(&vars))?;
    let observation = env.execute(&command, None, None).await?;
    if observation.returncode != 0 {
        return Err(EnvironmentError::StartupCommand(format!(
            "exit code {}: {}",
            observation.returncode, observation.output
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::LocalEnvironmentConfig;
    use crate::llm::{DeterministicModelConfig, GlobalModelStats};
    use tempfile::TempDir;

    const SUBMIT: &str =
        "Done\n```bash\necho COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT\necho patch-$PWD\n```";

    fn runner(dir: &Path, settings: BatchSettings, outputs: &[&str]) -> BatchRunner {
        BatchRunner::new(
            settings,
            AgentConfig::default(),
            ModelConfig::Deterministic(DeterministicModelConfig::new(
                outputs.iter().map(|s| s.to_string()).collect(),
            )),
            EnvironmentConfig::Local(LocalEnvironmentConfig::default()),
            dir,
            GlobalModelStats::new().shared(),
        )
    }

    fn instances(ids: &[&str]) -> Vec<Instance> {
        ids.iter().map(|id| Instance::new(*id, "do it")).collect()
    }

    #[test]
    fn test_settings_from_yaml() {
        let yaml = r#"
workers: 4
filter: "django"
slice: "0:10"
redo_existing: true
env_startup_command: "git checkout {{ base_commit }}"
"#;
        let settings: BatchSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.selection.filter, "django");
        assert_eq!(settings.selection.slice, "0:10");
        assert!(settings.redo_existing);
        assert_eq!(settings.progress_interval_secs, 30);

        let empty: BatchSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(empty, BatchSettings::default());
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let runner = runner(dir.path(), BatchSettings::default().with_workers(0), &[SUBMIT]);
        assert!(matches!(
            runner.run(instances(&["a"])).await,
            Err(BatchError::NoWorkers)
        ));
    }

    #[tokio::test]
    async fn test_path_like_id_rejected_before_any_write() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let output = dir.path().join("out");
        let runner = runner(&output, BatchSettings::default(), &[SUBMIT]);
        assert!(matches!(
            runner.run(instances(&["ok", "../escape"])).await,
            Err(BatchError::InvalidInstanceId(id)) if id == "../escape"
        ));
        assert!(!output.exists());
        assert!(!dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn test_runs_and_skips_existing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = BatchSettings::default().with_workers(2);

        let summary = runner(dir.path(), settings.clone(), &[SUBMIT])
            .run(instances(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.instances_by_exit_status["Submitted"].len(), 2);
        assert!(summary.report_path.unwrap().exists());

        let preds = PredictionsFile::in_dir(dir.path()).load().await.unwrap();
        assert!(preds["a"].model_patch.starts_with("patch-"));
        assert_eq!(preds["a"].model_name_or_path, "deterministic");

        let again = runner(dir.path(), settings.clone(), &[SUBMIT])
            .run(instances(&["a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(again.processed, 1);
        assert_eq!(again.skipped, 2);

        let redo = runner(dir.path(), settings.with_redo_existing(true), &[SUBMIT])
            .run(instances(&["a"]))
            .await
            .unwrap();
        assert_eq!(redo.processed, 1);
    }

    #[tokio::test]
    async fn test_startup_command_failure_is_runtime_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings =
            BatchSettings::default().with_env_startup_command("echo {{ instance_id }}; exit 3");
        let summary = runner(dir.path(), settings, &[SUBMIT])
            .run(instances(&["inst-1"]))
            .await
            .unwrap();
        assert_eq!(summary.instances_by_exit_status["RuntimeError"], vec!["inst-1"]);

        let record = TrajectoryStore::new(dir.path()).load("inst-1").await.unwrap();
        assert_eq!(record.info.exit_status, "RuntimeError");
        assert!(record.info.submission.contains("inst-1"));
        assert!(record.info.config.is_none());
    }

    #[tokio::test]
    async fn test_panicking_model_factory_is_isolated() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let stats = GlobalModelStats::new().shared();
        let factory_stats = stats.clone();
        let factory: ModelFactory = Arc::new(move |instance: &Instance| {
            if instance.instance_id == "bad" {
                panic!("factory exploded");
            }
            create_model(
                &ModelConfig::Deterministic(DeterministicModelConfig::new(vec![SUBMIT.to_string()])),
                factory_stats.clone(),
            )
        });
        let runner = runner(dir.path(), BatchSettings::default().with_workers(2), &[])
            .with_model_factory(factory);

        let summary = runner.run(instances(&["bad", "good"])).await.unwrap();
        assert_eq!(summary.instances_by_exit_status["Uncaught Panic"], vec!["bad"]);
        assert_eq!(summary.instances_by_exit_status["Submitted"], vec!["good"]);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_running_instance() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let slow = "Wait\n```bash\nsleep 20\n```";
        let agent = AgentConfig::default();
        let runner = BatchRunner::new(
            BatchSettings::default(),
            agent,
            ModelConfig::Deterministic(DeterministicModelConfig::new(vec![slow.to_string()])),
            EnvironmentConfig::Local(LocalEnvironmentConfig::default().with_timeout(60)),
            dir.path(),
            GlobalModelStats::new().shared(),
        );
        let handle = runner.interrupt_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.interrupt();
        });

        let started = std::time::Instant::now();
        let summary = runner.run(instances(&["first", "second"])).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(summary.interrupted);
        // One worker: one instance was cancelled mid-run, the other never started.
        assert_eq!(summary.instances_by_exit_status.len(), 1);
        let cancelled = &summary.instances_by_exit_status[INTERRUPTED];
        assert_eq!(cancelled.len(), 1);

        let preds = PredictionsFile::in_dir(dir.path()).load().await.unwrap();
        assert!(preds.is_empty());
        let record = TrajectoryStore::new(dir.path()).load(&cancelled[0]).await.unwrap();
        assert_eq!(record.info.exit_status, INTERRUPTED);
    }
}
