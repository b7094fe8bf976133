//! Workflow definitions and run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{RunId, TriggerEvent};

/// A workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (e.g., "egret-tests").
    pub name: String,
    /// Rules deciding which events start the pipeline.
    /// An empty list means manual dispatch only.
    pub triggers: Vec<Trigger>,
    /// Matrix of run configurations. `None` runs once with an empty entry.
    pub matrix: Option<MatrixConfig>,
    /// Global environment variables.
    pub env: HashMap<String, String>,
    /// Steps, in execution order.
    pub steps: Vec<Step>,
}

/// What triggers a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trigger {
    /// Triggered on push to branches.
    Push {
        /// Branch globs; `None` matches every branch.
        branches: Option<Vec<String>>,
        /// Path globs; `None` matches every change.
        paths: Option<Vec<String>>,
    },
    /// Triggered on a pull request targeting one of the branches.
    PullRequest { branches: Option<Vec<String>> },
    /// Triggered on tag creation.
    Tag { pattern: Option<String> },
    /// Manual dispatch.
    Manual,
}

/// Matrix configuration: named axes plus include/exclude adjustments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Axes in declaration order.
    pub axes: Vec<MatrixAxis>,
    /// Extra combinations, or extra keys for matching combinations.
    pub include: Vec<Vec<(String, String)>>,
    /// Combinations to drop from the cartesian product.
    pub exclude: Vec<Vec<(String, String)>>,
    /// Maximum number of runs executing at the same time.
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<String>,
}

/// One combination of matrix values. Keys keep axis declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixEntry {
    pub values: Vec<(String, String)>,
}

impl MatrixEntry {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a value, replacing an existing key in place or appending a new one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.values.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.values.push((key, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Display label, e.g. `(ubuntu-latest, 3.9)`.
    pub fn label(&self) -> String {
        let parts: Vec<&str> = self.values.iter().map(|(_, v)| v.as_str()).collect();
        format!("({})", parts.join(", "))
    }
}

/// A step in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name, unique within the pipeline.
    pub name: String,
    /// What this step does.
    pub action: StepAction,
    /// Step-specific environment variables.
    pub env: HashMap<String, String>,
    /// Directory to run in, relative to the workspace.
    pub working_dir: Option<String>,
    /// A failure of this step is recorded but does not stop or fail the run.
    pub continue_on_error: bool,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepAction {
    /// Run shell commands; the first failing command fails the step.
    Run { commands: Vec<String> },
    /// Fetch repository contents into the workspace.
    Checkout(CheckoutSpec),
    /// Create an isolated Python environment used by every later step.
    SetupPython {
        version: String,
        interpreter: Option<String>,
    },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Run { .. } => "run",
            StepAction::Checkout(_) => "checkout",
            StepAction::SetupPython { .. } => "setup-python",
        }
    }
}

/// Specification for a checkout step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSpec {
    /// Repository URL to clone. `None` copies the local source tree.
    pub repository: Option<String>,
    /// Branch or tag to clone.
    pub git_ref: Option<String>,
    /// Depth for shallow clone (None for full clone).
    pub depth: Option<u32>,
    /// Directory inside the workspace (defaults to the workspace itself).
    pub path: Option<String>,
}

/// Overall status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step succeeded.
    Succeeded,
    /// A step failed, or the workspace could not be provisioned (`step` is `None`).
    Failed { step: Option<String> },
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

/// Status of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed {
        message: String,
        exit_code: Option<i32>,
    },
    /// Not attempted because an earlier step failed.
    Skipped { reason: String },
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed { .. })
    }
}

/// Result of a step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    /// The step failed but was marked `continue-on-error`.
    pub tolerated: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            tolerated: false,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Result of one run (one matrix entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub id: RunId,
    pub entry: MatrixEntry,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    /// Infrastructure error that prevented the run from starting its steps.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunResult {
    /// Names of steps that were actually started, in order.
    pub fn attempted_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.started_at.is_some())
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Result of dispatching an event to a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub pipeline: String,
    pub event: TriggerEvent,
    /// Whether the event matched a trigger rule.
    pub triggered: bool,
    pub runs: Vec<RunResult>,
    pub success: bool,
    /// Reason the workflow failed before any run started.
    pub error: Option<String>,
}

impl WorkflowResult {
    pub fn passed_count(&self) -> usize {
        self.runs.iter().filter(|r| r.status.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.runs.len() - self.passed_count()
    }
}
