//! The agent state machine.
//!
//! A [`DefaultAgent`] owns one conversation. Each step queries the model,
//! extracts exactly one bash action, runs it in the environment and appends
//! the observation. Runs end as `Submitted`, `LimitsExceeded`, or with the
//! type name of the fatal error.

pub mod config;
pub mod default;
pub mod error;
pub mod parser;
pub mod templates;

pub use config::AgentConfig;
pub use default::{AgentOutcome, DefaultAgent, StatusCallback, LIMITS_EXCEEDED, SUBMITTED};
pub use error::AgentError;
pub use parser::{
    detect_submission, parse_action, FormatError, ParsedAction, COMPLETION_SENTINEL,
    LEGACY_COMPLETION_SENTINEL,
};
pub use templates::{
    ObservationView, MAX_OBSERVATION_CHARS, OBSERVATION_HEAD_CHARS, OBSERVATION_TAIL_CHARS,
};
