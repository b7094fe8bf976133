//! KDL configuration parsing for pipewright.
//!
//! This crate handles parsing of:
//! - Workflow definitions (pipewright.kdl)
//! - Runner configuration
//! - Variable interpolation

pub mod error;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use system::{ExecutorKind, RunnerConfig};
pub use variables::{
    EventContext, GitContext, PipelineContext, RunContext, StepContext, VariableContext,
    VariableContextBuilder,
};
