//! Batch execution over many instances.
//!
//! ```rust,ignore
//! use swe_harness::batch::{load_instances, BatchRunner, BatchSettings};
//!
//! let instances = load_instances(Path::new("instances.jsonl")).await?;
//! let runner = BatchRunner::new(settings, agent, model, environment, "runs/lite", stats);
//! let summary = runner.run(instances).await?;
//! ```

pub mod instances;
pub mod predictions;
pub mod progress;
pub mod runner;

pub use instances::{
    default_image_name, load_instances, validate_instance_id, Instance, InstanceSelection,
};
pub use predictions::{Prediction, Predictions, PredictionsFile, PREDICTIONS_FILE};
pub use progress::{BatchSnapshot, ExitStatusMap, ProgressManager, ProgressMonitor};
pub use runner::{
    BatchRunner, BatchSettings, BatchSummary, InterruptHandle, ModelFactory, INTERRUPTED,
};
