//! Step execution backends for pipewright.
//!
//! Provides executor implementations for running workflow steps:
//! - Local processes (default)
//! - Docker containers, one per run

pub mod docker;
pub mod local;
mod tracker;

pub use docker::DockerExecutor;
pub use local::LocalExecutor;
pub use pipewright_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream, Workspace,
    WorkspaceSpec,
};
