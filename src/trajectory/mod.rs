//! Trajectory persistence.
//!
//! A trajectory is the full conversation of one run plus its outcome, model
//! usage and configuration, written as pretty JSON.
//!
//! ```rust,ignore
//! use swe_harness::trajectory::{TrajectoryRecord, TrajectoryStore};
//!
//! let store = TrajectoryStore::new("runs/2024-06-01");
//! let outcome = agent.run(&instance.problem_statement).await;
//! store.save(&TrajectoryRecord::from_agent(&instance.instance_id, &agent, &outcome)).await?;
//! ```

pub mod storage;
pub mod types;

pub use storage::{save_trajectory, TrajectoryStore};
pub use types::{ModelStats, RunConfig, TrajectoryInfo, TrajectoryRecord, TRAJECTORY_FORMAT};
