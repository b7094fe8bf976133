//! Executor trait and job types.
//!
//! Executors provision an isolated workspace for each run and execute the
//! run's step commands inside it (local processes, containers).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{RunId, Result};

/// Specification for the workspace of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    /// The run owning the workspace.
    pub run_id: RunId,
    /// Container image, for executors that need one.
    pub image: Option<String>,
    /// Host directory holding the repository under test.
    pub source_dir: Option<PathBuf>,
    /// Host directory under which workspaces are created.
    pub root: Option<PathBuf>,
}

/// A provisioned workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub run_id: RunId,
    /// Workspace path as seen by step commands.
    pub path: String,
    /// Source tree path as seen by step commands.
    pub source_path: Option<String>,
    /// Executor-specific identifier (directory, container ID).
    pub executor_id: String,
    /// Name of the executor owning this workspace.
    pub executor_name: String,
}

/// Specification for a single command executed in a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier for this job.
    pub id: RunId,
    /// Command to execute; first element is the program.
    pub command: Vec<String>,
    /// Working directory (defaults to the workspace path).
    pub working_dir: Option<String>,
    /// Environment variables added to the executor's base environment.
    pub env: HashMap<String, String>,
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: RunId,
    /// Executor-specific identifier (e.g., process ID, exec ID).
    pub executor_id: String,
    pub executor_name: String,
}

/// How a job ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

impl JobResult {
    /// Build a result from a process exit code.
    pub fn from_exit(
        exit_code: Option<i32>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let status = if exit_code == Some(0) {
            JobStatus::Succeeded {
                started_at,
                finished_at,
            }
        } else {
            JobStatus::Failed {
                started_at: Some(started_at),
                finished_at,
                exit_code,
                message: match exit_code {
                    Some(code) => format!("exited with code {}", code),
                    None => "terminated by signal".to_string(),
                },
            }
        };
        Self { status, exit_code }
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for step executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Check if this executor can provision the given workspace.
    async fn can_execute(&self, spec: &WorkspaceSpec) -> bool;

    /// Provision the workspace for a run.
    async fn prepare(&self, spec: WorkspaceSpec) -> Result<Workspace>;

    /// Spawn a job inside a workspace.
    async fn spawn(&self, workspace: &Workspace, spec: JobSpec) -> Result<JobHandle>;

    /// Get a stream of log lines from a job. The stream ends when the job's output closes.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Wait for a job to complete.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Cancel a running job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Destroy a workspace and everything in it.
    async fn teardown(&self, workspace: &Workspace) -> Result<()>;
}
