//! Local workflow execution command.

use super::{EventArgs, load_workflow, repo_context, repo_root};
use anyhow::{Context, Result, bail};
use clap::Args;
use pipewright_config::system::load_runner_config;
use pipewright_config::{ExecutorKind, RunnerConfig};
use pipewright_core::RunId;
use pipewright_core::executor::{Executor, LogStream};
use pipewright_core::pipeline::{RunStatus, StepStatus, WorkflowResult};
use pipewright_executor::{DockerExecutor, LocalExecutor};
use pipewright_scheduler::{PipelineEvent, PipelineOrchestrator};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow file
    #[arg(default_value = "pipewright.kdl")]
    pub path: String,

    #[command(flatten)]
    pub event: EventArgs,

    /// Runner configuration file
    #[arg(long, env = "PIPEWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Executor backend, `local` or `docker` (overrides the runner configuration)
    #[arg(long, value_parser = parse_executor)]
    pub executor: Option<ExecutorKind>,

    /// Repository directory copied in by `checkout` (defaults to the git top level of the workflow)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Maximum number of runs executing at the same time
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Directory under which run workspaces are created
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Leave run workspaces in place after the runs finish
    #[arg(long)]
    pub keep_workspace: bool,

    /// Extra environment variable for every step (KEY=VALUE, repeatable)
    #[arg(long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Write the workflow result as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

fn parse_executor(s: &str) -> Result<ExecutorKind, String> {
    s.parse().map_err(|e: pipewright_config::ConfigError| e.to_string())
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl RunArgs {
    fn runner_config(&self) -> Result<RunnerConfig> {
        let mut runner = match &self.config {
            Some(path) => load_runner_config(path)
                .with_context(|| format!("Failed to load runner config: {}", path.display()))?,
            None => RunnerConfig::default(),
        };

        if let Some(executor) = self.executor {
            runner.executor = executor;
        }
        if let Some(max_parallel) = self.max_parallel {
            if max_parallel == 0 {
                bail!("--max-parallel must be at least 1");
            }
            runner.max_parallel = Some(max_parallel);
        }
        if let Some(root) = &self.workspace_root {
            runner.workspace_root = Some(root.clone());
        }
        if self.keep_workspace {
            runner.keep_workspace = true;
        }
        Ok(runner)
    }
}

fn create_executor(kind: ExecutorKind) -> Result<Arc<dyn Executor>> {
    let executor: Arc<dyn Executor> = match kind {
        ExecutorKind::Local => Arc::new(LocalExecutor::new()),
        ExecutorKind::Docker => {
            Arc::new(DockerExecutor::new().context("Failed to connect to Docker")?)
        }
    };
    Ok(executor)
}

/// Dispatch an event to a workflow and execute the resulting runs.
pub async fn run(args: RunArgs) -> Result<()> {
    let pipeline = load_workflow(&args.path)?;
    let runner = args.runner_config()?;

    let source = match &args.source {
        Some(dir) => dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve source directory: {}", dir.display()))?,
        None => repo_root(&args.path)?,
    };

    let var_ctx = repo_context(&source);
    let event = args.event.to_event(&var_ctx)?;
    let executor = create_executor(runner.executor)?;

    info!(
        pipeline = %pipeline.name,
        event = %event,
        executor = executor.name(),
        source = %source.display(),
        "Dispatching event"
    );

    let orchestrator = PipelineOrchestrator::new(executor, runner).with_source_dir(source);
    let env: HashMap<String, String> = args.env.iter().cloned().collect();

    let (mut rx, result_handle) = orchestrator.execute(&pipeline, event, env, Some(var_ctx));

    // Process events concurrently with execution
    let mut labels: HashMap<RunId, String> = HashMap::new();
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::RunStarted { run_id, entry } => {
                let label = if entry.is_empty() {
                    run_id.short()
                } else {
                    entry.label()
                };
                println!("▶ Run {} started", label);
                labels.insert(run_id, label);
            }
            PipelineEvent::StepStarted { run_id, step } => {
                println!("  {} ▶ {}", label_of(&labels, &run_id), step);
            }
            PipelineEvent::StepLog { run_id, step, line } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!(
                    "  {} [{}]{} {}",
                    label_of(&labels, &run_id),
                    step,
                    stream_marker,
                    line.content
                );
            }
            PipelineEvent::StepCompleted {
                run_id,
                step,
                status,
                tolerated,
            } => {
                println!(
                    "  {} {} {}",
                    label_of(&labels, &run_id),
                    step_marker(&status, tolerated),
                    step
                );
            }
            PipelineEvent::RunCompleted { run_id, status } => {
                let label = label_of(&labels, &run_id);
                match status {
                    RunStatus::Succeeded => println!("✓ Run {} succeeded\n", label),
                    RunStatus::Failed { step: Some(step) } => {
                        println!("✗ Run {} failed at step '{}'\n", label, step)
                    }
                    _ => println!("✗ Run {} failed\n", label),
                }
            }
            PipelineEvent::PipelineCompleted { .. } => {}
        }
    }

    let result = result_handle
        .await
        .context("Workflow execution task failed")?;

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!(path = %path.display(), "Wrote report");
    }

    print!("{}", summary(&result));

    if !result.triggered || result.success {
        Ok(())
    } else {
        bail!("Workflow '{}' failed", result.pipeline);
    }
}

fn label_of(labels: &HashMap<RunId, String>, run_id: &RunId) -> String {
    labels
        .get(run_id)
        .cloned()
        .unwrap_or_else(|| run_id.short())
}

fn step_marker(status: &StepStatus, tolerated: bool) -> &'static str {
    match status {
        StepStatus::Succeeded => "✓",
        StepStatus::Failed { .. } if tolerated => "⚠",
        StepStatus::Failed { .. } => "✗",
        StepStatus::Skipped { .. } => "⊘",
        StepStatus::Pending | StepStatus::Running => "○",
    }
}

/// Per-run summary printed once the workflow is done.
fn summary(result: &WorkflowResult) -> String {
    if !result.triggered {
        return format!(
            "No trigger rule of '{}' matches {}; nothing ran.\n",
            result.pipeline, result.event
        );
    }

    let mut out = String::from("--- Summary ---\n");
    if let Some(error) = &result.error {
        out.push_str(&format!("error: {}\n", error));
    }
    for run in &result.runs {
        let label = if run.entry.is_empty() {
            run.id.short()
        } else {
            run.entry.label()
        };
        let verdict = if run.status.is_success() { "passed" } else { "failed" };
        out.push_str(&format!("{} {}\n", label, verdict));
        if let Some(error) = &run.error {
            out.push_str(&format!("  error: {}\n", error));
        }
        for step in &run.steps {
            let detail = match &step.status {
                StepStatus::Failed { message, .. } => format!(" - {}", message),
                StepStatus::Skipped { reason } => format!(" - {}", reason),
                _ => String::new(),
            };
            out.push_str(&format!(
                "  {} {}{}\n",
                step_marker(&step.status, step.tolerated),
                step.name,
                detail
            ));
        }
    }
    out.push_str(&format!(
        "{} passed, {} failed: workflow {}\n",
        result.passed_count(),
        result.failed_count(),
        if result.success { "succeeded" } else { "failed" }
    ));
    out
}
