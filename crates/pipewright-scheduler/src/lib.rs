//! Run scheduling for pipewright.
//!
//! Decides whether an event starts a workflow, expands the matrix into runs,
//! and executes each run's steps in order through an executor.

pub mod matrix;
pub mod orchestrator;
mod script;
pub mod trigger;

pub use matrix::expand_matrix;
pub use orchestrator::{PipelineEvent, PipelineOrchestrator};
pub use trigger::TriggerMatcher;
