//! CLI command definitions for swe-harness.
//!
//! `run` drives one agent on one task; `batch` drives many over an
//! instances file with a worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::agent::{AgentOutcome, DefaultAgent};
use crate::batch::{load_instances, BatchRunner, InstanceSelection, INTERRUPTED};
use crate::config::{ConfigOverrides, HarnessConfig};
use crate::environment::{create_environment, Environment};
use crate::llm::{create_model, GlobalModelStats};
use crate::trajectory::{save_trajectory, TrajectoryRecord};

/// Default output directory for batch runs.
const DEFAULT_BATCH_OUTPUT_DIR: &str = "./swe-harness-runs";

/// Default trajectory path for single runs.
const DEFAULT_TRAJECTORY_PATH: &str = "./last_run.traj.json";

/// Seed used by `--shuffle` when no explicit seed is given.
const DEFAULT_SHUFFLE_SEED: u64 = 42;

/// Agent execution harness for software engineering tasks.
#[derive(Parser)]
#[command(name = "swe-harness")]
#[command(about = "Run a language-model agent on software engineering tasks")]
#[command(version)]
#[command(
    long_about = "swe-harness runs a language-model agent that solves tasks by issuing one bash command per turn.\n\nExample usage:\n  swe-harness run --task 'Fix the failing test' --config agent.yaml\n  swe-harness batch --instances lite.jsonl --workers 8 --output ./runs/lite"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// File that receives a copy of the log, if the command writes one.
    pub fn log_file(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Batch(args) => Some(Path::new(&args.output).join("harness.log")),
            Commands::Run(_) => None,
        }
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the agent on a single task.
    Run(RunArgs),

    /// Run the agent on every instance of a dataset file.
    Batch(BatchArgs),
}

/// Options shared by both commands.
#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    /// YAML config file (agent, model, environment and run sections).
    #[arg(short = 'c', long, env = "SWE_HARNESS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Model name, overriding the config file.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Model class (openrouter, deterministic, roulette, interleaving).
    #[arg(long)]
    pub model_class: Option<String>,

    /// Environment class (local, docker, singularity, bubblewrap).
    #[arg(long)]
    pub environment_class: Option<String>,

    /// Maximum number of model calls per run (0 = unlimited).
    #[arg(long)]
    pub step_limit: Option<u64>,

    /// Maximum model cost per run in dollars (0 = unlimited).
    #[arg(long)]
    pub cost_limit: Option<f64>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<HarnessConfig> {
        let overrides = ConfigOverrides {
            model_name: self.model.clone(),
            model_class: self.model_class.clone(),
            environment_class: self.environment_class.clone(),
            step_limit: self.step_limit,
            cost_limit: self.cost_limit,
        };
        if let Some(path) = &self.config {
            info!(path = %path.display(), "Loading config");
        }
        HarnessConfig::load(self.config.as_deref(), &overrides).context("Failed to load config")
    }
}

/// Arguments for `swe-harness run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task description given to the agent.
    #[arg(short = 't', long)]
    pub task: String,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Where to write the trajectory.
    #[arg(short = 'o', long, default_value = DEFAULT_TRAJECTORY_PATH)]
    pub output: PathBuf,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `swe-harness batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// JSON or JSON Lines file of instances.
    #[arg(short = 'i', long)]
    pub instances: PathBuf,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Output directory for trajectories, predictions and reports.
    #[arg(short = 'o', long, default_value = DEFAULT_BATCH_OUTPUT_DIR)]
    pub output: String,

    /// Number of instances processed concurrently.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Regex matched against the start of instance ids.
    #[arg(long)]
    pub filter: Option<String>,

    /// Slice of the filtered instances, e.g. '0:5'.
    #[arg(long)]
    pub slice: Option<String>,

    /// Shuffle the selected instances deterministically.
    #[arg(long)]
    pub shuffle: bool,

    /// Seed for --shuffle.
    #[arg(long, requires = "shuffle")]
    pub seed: Option<u64>,

    /// Run instances that already have a prediction again.
    #[arg(long)]
    pub redo_existing: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    exit_status: &'a str,
    submission: &'a str,
    api_calls: u64,
    cost: f64,
    trajectory: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run an already parsed command line.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_single_command(args).await,
        Commands::Batch(args) => run_batch_command(args).await,
    }
}

async fn run_single_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.config.load()?;
    let stats = GlobalModelStats::from_env().shared();

    let model = create_model(&config.model, stats).context("Failed to create model")?;
    let env: Arc<dyn Environment> = Arc::from(
        create_environment(&config.environment)
            .await
            .context("Failed to create environment")?,
    );
    info!(
        model = model.model_name(),
        environment = env.kind(),
        "Starting agent"
    );

    let mut agent = DefaultAgent::new(config.agent.clone(), model, env.clone());
    let outcome = tokio::select! {
        outcome = agent.run(&args.task) => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, saving trajectory");
            AgentOutcome::new(INTERRUPTED, "Interrupted")
        }
    };
    env.dispose().await;

    let record = TrajectoryRecord::from_agent("", &agent, &outcome);
    save_trajectory(&args.output, &record)
        .await
        .with_context(|| format!("Failed to save trajectory to {}", args.output.display()))?;

    let summary = RunSummary {
        exit_status: &outcome.exit_status,
        submission: &outcome.result,
        api_calls: agent.model().n_calls(),
        cost: agent.model().cost(),
        trajectory: args.output.display().to_string(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n=== Run Result ===");
        println!("Exit status: {}", summary.exit_status);
        println!("API calls:   {}", summary.api_calls);
        println!("Cost:        ${:.4}", summary.cost);
        println!("Trajectory:  {}", summary.trajectory);
        if outcome.is_submitted() {
            if !summary.submission.is_empty() {
                println!("\n{}", summary.submission);
            }
        } else if !summary.submission.is_empty() {
            println!("Message:     {}", summary.submission);
        }
    }
    Ok(())
}

async fn run_batch_command(args: BatchArgs) -> anyhow::Result<()> {
    let mut config = args.config.load()?;
    if let Some(workers) = args.workers {
        config.run.workers = workers;
    }
    config.run.selection = merge_selection(config.run.selection, &args);
    if args.redo_existing {
        config.run.redo_existing = true;
    }

    info!(path = %args.instances.display(), "Loading instances");
    let instances = load_instances(&args.instances)
        .await
        .context("Failed to load instances")?;

    let runner = BatchRunner::new(
        config.run,
        config.agent,
        config.model,
        config.environment,
        &args.output,
        GlobalModelStats::from_env().shared(),
    );

    let interrupt = runner.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancelling all pending jobs. Press ^C again to exit immediately.");
            interrupt.interrupt();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    let summary = runner.run(instances).await.context("Batch run failed")?;

    if args.json {
        let json = serde_json::json!({
            "processed": summary.processed,
            "skipped": summary.skipped,
            "interrupted": summary.interrupted,
            "instances_by_exit_status": summary.instances_by_exit_status,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("\n=== Batch Results ===");
        println!("Processed: {}", summary.processed);
        println!("Skipped:   {}", summary.skipped);
        for (status, ids) in &summary.instances_by_exit_status {
            println!("  {:<24} {}", status, ids.len());
        }
        if summary.interrupted {
            println!("Interrupted: unfinished instances will run on the next invocation.");
        }
        if let Some(report) = &summary.report_path {
            println!("Report:    {}", report.display());
        }
    }
    Ok(())
}

fn merge_selection(mut selection: InstanceSelection, args: &BatchArgs) -> InstanceSelection {
    if let Some(filter) = &args.filter {
        selection.filter = filter.clone();
    }
    if let Some(slice) = &args.slice {
        selection.slice = slice.clone();
    }
    if args.shuffle {
        selection.shuffle_seed = Some(args.seed.unwrap_or(DEFAULT_SHUFFLE_SEED));
    }
    selection
}
