//! Pipeline orchestrator - runs every matrix entry's steps in order.

use crate::matrix::expand_matrix;
use crate::script;
use crate::trigger::TriggerMatcher;
use chrono::Utc;
use futures::StreamExt;
use pipewright_config::{RunnerConfig, VariableContext};
use pipewright_core::executor::{Executor, JobSpec, JobStatus, LogLine, Workspace, WorkspaceSpec};
use pipewright_core::pipeline::{
    MatrixEntry, Pipeline, RunResult, RunStatus, Step, StepAction, StepResult, StepStatus,
    WorkflowResult,
};
use pipewright_core::{Error, RunId, TriggerEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long to keep forwarding output after a step's process has exited.
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted {
        run_id: RunId,
        entry: MatrixEntry,
    },
    StepStarted {
        run_id: RunId,
        step: String,
    },
    StepLog {
        run_id: RunId,
        step: String,
        line: LogLine,
    },
    /// Sent for every step, including those skipped after a failure.
    StepCompleted {
        run_id: RunId,
        step: String,
        status: StepStatus,
        tolerated: bool,
    },
    RunCompleted {
        run_id: RunId,
        status: RunStatus,
    },
    PipelineCompleted {
        success: bool,
    },
}

/// State shared by every run of one workflow execution.
struct Shared {
    executor: Arc<dyn Executor>,
    runner: RunnerConfig,
    source_dir: Option<PathBuf>,
    pipeline: Pipeline,
    event: TriggerEvent,
    env: HashMap<String, String>,
    var_ctx: VariableContext,
    tx: mpsc::Sender<PipelineEvent>,
}

impl Shared {
    async fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Orchestrates the execution of a pipeline.
pub struct PipelineOrchestrator {
    executor: Arc<dyn Executor>,
    runner: RunnerConfig,
    /// Repository contents copied in by `checkout` steps without a repository.
    source_dir: Option<PathBuf>,
}

impl PipelineOrchestrator {
    pub fn new(executor: Arc<dyn Executor>, runner: RunnerConfig) -> Self {
        Self {
            executor,
            runner,
            source_dir: None,
        }
    }

    pub fn with_source_dir(mut self, source_dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(source_dir.into());
        self
    }

    /// Dispatch an event to a pipeline, returning a channel of events and a handle to get the final result.
    ///
    /// `env` is added to every step's environment, after the pipeline's own `env`.
    /// The `var_ctx` provides variable interpolation for commands and environment variables;
    /// the matrix, run and step namespaces are filled in per run.
    pub fn execute(
        &self,
        pipeline: &Pipeline,
        event: TriggerEvent,
        env: HashMap<String, String>,
        var_ctx: Option<VariableContext>,
    ) -> (mpsc::Receiver<PipelineEvent>, JoinHandle<WorkflowResult>) {
        let (tx, rx) = mpsc::channel(100);

        let mut var_ctx = var_ctx.unwrap_or_default();
        var_ctx.pipeline.name = pipeline.name.clone();
        var_ctx.set_event(&event);

        let shared = Arc::new(Shared {
            executor: self.executor.clone(),
            runner: self.runner.clone(),
            source_dir: self.source_dir.clone(),
            pipeline: pipeline.clone(),
            event,
            env,
            var_ctx,
            tx,
        });

        let handle = tokio::spawn(Self::execute_inner(shared));
        (rx, handle)
    }

    /// Execute without observing events.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        event: TriggerEvent,
        env: HashMap<String, String>,
        var_ctx: Option<VariableContext>,
    ) -> WorkflowResult {
        let (rx, handle) = self.execute(pipeline, event.clone(), env, var_ctx);
        drop(rx);
        match handle.await {
            Ok(result) => result,
            Err(e) => WorkflowResult {
                pipeline: pipeline.name.clone(),
                event,
                triggered: true,
                runs: Vec::new(),
                success: false,
                error: Some(format!("workflow task failed: {}", e)),
            },
        }
    }

    async fn execute_inner(shared: Arc<Shared>) -> WorkflowResult {
        let pipeline = &shared.pipeline;
        let mut result = WorkflowResult {
            pipeline: pipeline.name.clone(),
            event: shared.event.clone(),
            triggered: false,
            runs: Vec::new(),
            success: true,
            error: None,
        };

        if TriggerMatcher::matching_rule(&pipeline.triggers, &shared.event).is_none() {
            info!(pipeline = %pipeline.name, event = %shared.event, "Event matches no trigger rule; nothing to run");
            shared.emit(PipelineEvent::PipelineCompleted { success: true }).await;
            return result;
        }
        result.triggered = true;

        let entries = expand_matrix(pipeline.matrix.as_ref());
        if entries.is_empty() {
            error!(pipeline = %pipeline.name, "Matrix expands to no entries");
            result.success = false;
            result.error = Some("matrix expands to no entries".to_string());
            shared.emit(PipelineEvent::PipelineCompleted { success: false }).await;
            return result;
        }

        let limit = shared
            .runner
            .max_parallel
            .or_else(|| pipeline.matrix.as_ref().and_then(|m| m.max_parallel))
            .unwrap_or(entries.len())
            .max(1);
        info!(
            pipeline = %pipeline.name,
            event = %shared.event,
            runs = entries.len(),
            max_parallel = limit,
            "Starting workflow"
        );

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut handles = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let run_id = RunId::new();
            let shared = shared.clone();
            let semaphore = semaphore.clone();
            let task_entry = entry.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                Self::execute_run(&shared, run_id, index as u32 + 1, task_entry).await
            });
            handles.push((run_id, entry, handle));
        }

        for (run_id, entry, handle) in handles {
            let run = match handle.await {
                Ok(run) => run,
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Run task failed");
                    RunResult {
                        id: run_id,
                        entry,
                        status: RunStatus::Failed { step: None },
                        steps: pipeline.steps.iter().map(|s| StepResult::pending(&s.name)).collect(),
                        error: Some(format!("run task failed: {}", e)),
                        started_at: None,
                        finished_at: Some(Utc::now()),
                    }
                }
            };
            result.runs.push(run);
        }

        result.success = result.runs.iter().all(|r| r.status.is_success());
        info!(
            pipeline = %pipeline.name,
            passed = result.passed_count(),
            failed = result.failed_count(),
            success = result.success,
            "Workflow finished"
        );
        shared
            .emit(PipelineEvent::PipelineCompleted {
                success: result.success,
            })
            .await;
        result
    }

    /// Execute one matrix entry: provision its workspace, then its steps in order.
    async fn execute_run(shared: &Shared, run_id: RunId, number: u32, entry: MatrixEntry) -> RunResult {
        let pipeline = &shared.pipeline;
        let started_at = Utc::now();
        let mut steps: Vec<StepResult> = pipeline
            .steps
            .iter()
            .map(|s| StepResult::pending(&s.name))
            .collect();

        info!(run_id = %run_id, entry = %entry.label(), "Starting run");
        shared
            .emit(PipelineEvent::RunStarted {
                run_id,
                entry: entry.clone(),
            })
            .await;

        let mut var_ctx = shared.var_ctx.clone();
        var_ctx.set_matrix(&entry);
        var_ctx.run.id = run_id.to_string();
        var_ctx.run.number = number;

        let spec = WorkspaceSpec {
            run_id,
            image: entry.get("os").map(|os| shared.runner.image_for(os)),
            source_dir: shared.source_dir.clone(),
            root: shared.runner.workspace_root.clone(),
        };

        let prepared = if shared.executor.can_execute(&spec).await {
            shared.executor.prepare(spec).await
        } else {
            Err(Error::Provisioning(format!(
                "{} executor cannot provide a workspace for this run",
                shared.executor.name()
            )))
        };

        let workspace = match prepared {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to prepare workspace");
                let status = RunStatus::Failed { step: None };
                for step in &mut steps {
                    step.status = StepStatus::Skipped {
                        reason: "workspace could not be prepared".to_string(),
                    };
                    shared
                        .emit(PipelineEvent::StepCompleted {
                            run_id,
                            step: step.name.clone(),
                            status: step.status.clone(),
                            tolerated: false,
                        })
                        .await;
                }
                shared
                    .emit(PipelineEvent::RunCompleted {
                        run_id,
                        status: status.clone(),
                    })
                    .await;
                return RunResult {
                    id: run_id,
                    entry,
                    status,
                    steps,
                    error: Some(e.to_string()),
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                };
            }
        };
        var_ctx.run.workspace = workspace.path.clone();

        let base_env = run_env(shared, run_id, &entry, &workspace, &var_ctx);
        let mut venv: Option<String> = None;
        let mut failed_step: Option<String> = None;

        for (index, (step, result)) in pipeline.steps.iter().zip(steps.iter_mut()).enumerate() {
            if let Some(failed) = &failed_step {
                result.status = StepStatus::Skipped {
                    reason: format!("step '{}' failed", failed),
                };
                shared
                    .emit(PipelineEvent::StepCompleted {
                        run_id,
                        step: step.name.clone(),
                        status: result.status.clone(),
                        tolerated: false,
                    })
                    .await;
                continue;
            }

            var_ctx.step.name = step.name.clone();
            var_ctx.step.index = index;

            result.status = StepStatus::Running;
            result.started_at = Some(Utc::now());
            info!(run_id = %run_id, step = %step.name, action = step.action.kind(), "Starting step");
            shared
                .emit(PipelineEvent::StepStarted {
                    run_id,
                    step: step.name.clone(),
                })
                .await;

            let status = Self::execute_step(
                shared,
                run_id,
                &workspace,
                step,
                &var_ctx,
                &base_env,
                venv.as_deref(),
            )
            .await;
            result.finished_at = Some(Utc::now());

            match &status {
                StepStatus::Failed { message, .. } if step.continue_on_error => {
                    warn!(run_id = %run_id, step = %step.name, error = %message, "Step failed; continuing");
                    result.tolerated = true;
                }
                StepStatus::Failed { message, .. } => {
                    error!(run_id = %run_id, step = %step.name, error = %message, "Step failed");
                    failed_step = Some(step.name.clone());
                }
                _ => {
                    info!(run_id = %run_id, step = %step.name, "Step succeeded");
                    if matches!(step.action, StepAction::SetupPython { .. }) {
                        venv = Some(script::venv_path(&workspace));
                    }
                }
            }

            result.status = status;
            shared
                .emit(PipelineEvent::StepCompleted {
                    run_id,
                    step: step.name.clone(),
                    status: result.status.clone(),
                    tolerated: result.tolerated,
                })
                .await;
        }

        if shared.runner.keep_workspace {
            info!(run_id = %run_id, path = %workspace.path, "Keeping workspace");
        } else if let Err(e) = shared.executor.teardown(&workspace).await {
            warn!(run_id = %run_id, error = %e, "Failed to tear down workspace");
        }

        let status = match failed_step {
            Some(step) => RunStatus::Failed { step: Some(step) },
            None => RunStatus::Succeeded,
        };
        info!(run_id = %run_id, entry = %entry.label(), success = status.is_success(), "Run finished");
        shared
            .emit(PipelineEvent::RunCompleted {
                run_id,
                status: status.clone(),
            })
            .await;

        RunResult {
            id: run_id,
            entry,
            status,
            steps,
            error: None,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    /// Execute a single step and report how it ended.
    async fn execute_step(
        shared: &Shared,
        run_id: RunId,
        workspace: &Workspace,
        step: &Step,
        var_ctx: &VariableContext,
        base_env: &HashMap<String, String>,
        venv: Option<&str>,
    ) -> StepStatus {
        let executor = &shared.executor;

        let step_inputs = shared
            .pipeline
            .env
            .values()
            .chain(step.env.values())
            .map(String::as_str)
            .chain(step.working_dir.as_deref());
        if let Err(e) = script::check_matrix_refs(var_ctx, step_inputs) {
            return failed(e.to_string());
        }

        let command = match script::step_command(&step.action, var_ctx, workspace, venv) {
            Ok(command) => command,
            Err(e) => return failed(e.to_string()),
        };

        let mut env = base_env.clone();
        env.extend(var_ctx.interpolate_map(&step.env));

        let job_spec = JobSpec {
            id: RunId::new(),
            command,
            working_dir: var_ctx.interpolate_opt(&step.working_dir),
            env,
        };

        let handle = match executor.spawn(workspace, job_spec).await {
            Ok(handle) => handle,
            Err(e) => return failed(format!("failed to start step: {}", e)),
        };

        let mut log_task = match executor.logs(&handle).await {
            Ok(mut stream) => {
                let tx = shared.tx.clone();
                let step_name = step.name.clone();
                Some(tokio::spawn(async move {
                    while let Some(line) = stream.next().await {
                        let _ = tx
                            .send(PipelineEvent::StepLog {
                                run_id,
                                step: step_name.clone(),
                                line,
                            })
                            .await;
                    }
                }))
            }
            Err(e) => {
                warn!(run_id = %run_id, step = %step.name, error = %e, "Failed to follow step output");
                None
            }
        };

        let waited = match step.timeout {
            Some(limit) => match tokio::time::timeout(limit, executor.wait(&handle)).await {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(run_id = %run_id, step = %step.name, timeout = ?limit, "Step timed out; cancelling");
                    if let Err(e) = executor.cancel(&handle).await {
                        warn!(run_id = %run_id, step = %step.name, error = %e, "Failed to cancel step");
                    }
                    let _ = executor.wait(&handle).await;
                    finish_logs(&mut log_task).await;
                    return failed(format!("timed out after {:?}", limit));
                }
            },
            None => executor.wait(&handle).await,
        };
        finish_logs(&mut log_task).await;

        match waited {
            Ok(result) => match result.status {
                JobStatus::Succeeded { .. } => StepStatus::Succeeded,
                JobStatus::Failed {
                    message, exit_code, ..
                } => StepStatus::Failed { message, exit_code },
                JobStatus::Cancelled { .. } => failed("cancelled".to_string()),
            },
            Err(e) => failed(format!("failed to wait for step: {}", e)),
        }
    }
}

fn failed(message: String) -> StepStatus {
    StepStatus::Failed {
        message,
        exit_code: None,
    }
}

/// Let the log forwarder flush remaining output, then stop it.
async fn finish_logs(log_task: &mut Option<JoinHandle<()>>) {
    if let Some(mut task) = log_task.take() {
        // Background processes can keep the output pipes open after the step exits.
        if tokio::time::timeout(LOG_DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

/// Environment shared by every step of a run.
fn run_env(
    shared: &Shared,
    run_id: RunId,
    entry: &MatrixEntry,
    workspace: &Workspace,
    var_ctx: &VariableContext,
) -> HashMap<String, String> {
    let mut env = HashMap::from([
        ("CI".to_string(), "true".to_string()),
        ("PIPEWRIGHT".to_string(), "true".to_string()),
        ("PIPEWRIGHT_RUN_ID".to_string(), run_id.to_string()),
        ("PIPEWRIGHT_EVENT".to_string(), shared.event.name().to_string()),
        (
            "PIPEWRIGHT_REF".to_string(),
            shared.event.git_ref().unwrap_or_default().to_string(),
        ),
        ("PIPEWRIGHT_WORKSPACE".to_string(), workspace.path.clone()),
    ]);

    for (axis, value) in &entry.values {
        env.insert(matrix_env_name(axis), value.clone());
    }

    env.extend(var_ctx.interpolate_map(&shared.pipeline.env));
    env.extend(var_ctx.interpolate_map(&shared.env));
    env
}

/// `python-version` -> `MATRIX_PYTHON_VERSION`.
fn matrix_env_name(axis: &str) -> String {
    let name: String = axis
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("MATRIX_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use pipewright_core::executor::{JobHandle, JobResult};
    use pipewright_core::pipeline::{MatrixAxis, MatrixConfig, Trigger};
    use std::sync::Mutex;

    /// Executor that records the scripts it is asked to run and fails when a
    /// script contains `FAIL`. When `unavailable`, it refuses every workspace.
    #[derive(Default)]
    struct RecordingExecutor {
        scripts: Mutex<Vec<(RunId, String, HashMap<String, String>)>>,
        images: Mutex<Vec<Option<String>>>,
        jobs: Mutex<HashMap<RunId, JobResult>>,
        unavailable: bool,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn can_execute(&self, _spec: &WorkspaceSpec) -> bool {
            !self.unavailable
        }

        async fn prepare(&self, spec: WorkspaceSpec) -> pipewright_core::Result<Workspace> {
            self.images.lock().unwrap().push(spec.image);
            Ok(Workspace {
                run_id: spec.run_id,
                path: format!("/work/{}", spec.run_id.short()),
                source_path: Some("/src".to_string()),
                executor_id: spec.run_id.to_string(),
                executor_name: "recording".to_string(),
            })
        }

        async fn spawn(&self, workspace: &Workspace, spec: JobSpec) -> pipewright_core::Result<JobHandle> {
            let script = spec.command.last().cloned().unwrap_or_default();
            let now = Utc::now();
            let code = if script.contains("FAIL") { 1 } else { 0 };
            self.jobs
                .lock()
                .unwrap()
                .insert(spec.id, JobResult::from_exit(Some(code), now, now));
            self.scripts
                .lock()
                .unwrap()
                .push((workspace.run_id, script, spec.env));
            Ok(JobHandle {
                id: spec.id,
                executor_id: workspace.executor_id.clone(),
                executor_name: "recording".to_string(),
            })
        }

        async fn logs(&self, _handle: &JobHandle) -> pipewright_core::Result<BoxStream<'static, LogLine>> {
            Ok(stream::empty().boxed())
        }

        async fn wait(&self, handle: &JobHandle) -> pipewright_core::Result<JobResult> {
            Ok(self.jobs.lock().unwrap()[&handle.id].clone())
        }

        async fn cancel(&self, _handle: &JobHandle) -> pipewright_core::Result<()> {
            Ok(())
        }

        async fn teardown(&self, _workspace: &Workspace) -> pipewright_core::Result<()> {
            Ok(())
        }
    }

    fn run_step(name: &str, command: &str) -> Step {
        Step {
            name: name.to_string(),
            action: StepAction::Run {
                commands: vec![command.to_string()],
            },
            env: HashMap::new(),
            working_dir: None,
            continue_on_error: false,
            timeout: None,
        }
    }

    fn pipeline(steps: Vec<Step>) -> Pipeline {
        Pipeline {
            name: "test".to_string(),
            triggers: vec![Trigger::Manual],
            matrix: Some(MatrixConfig {
                axes: vec![
                    MatrixAxis {
                        name: "os".to_string(),
                        values: vec!["ubuntu-latest".to_string()],
                    },
                    MatrixAxis {
                        name: "python-version".to_string(),
                        values: vec!["3.9".to_string()],
                    },
                ],
                ..Default::default()
            }),
            env: HashMap::from([("GREETING".to_string(), "hi ${matrix.python-version}".to_string())]),
            steps,
        }
    }

    #[test]
    fn test_matrix_env_name() {
        assert_eq!(matrix_env_name("python-version"), "MATRIX_PYTHON_VERSION");
        assert_eq!(matrix_env_name("os"), "MATRIX_OS");
    }

    #[tokio::test]
    async fn test_run_environment() {
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = PipelineOrchestrator::new(executor.clone(), RunnerConfig::default());
        let pipeline = pipeline(vec![run_step("only", "echo $GREETING")]);

        let result = orchestrator
            .run(
                &pipeline,
                TriggerEvent::manual(),
                HashMap::from([("EXTRA".to_string(), "1".to_string())]),
                None,
            )
            .await;
        assert!(result.success);

        let scripts = executor.scripts.lock().unwrap();
        let (run_id, _, env) = &scripts[0];
        assert_eq!(env["CI"], "true");
        assert_eq!(env["PIPEWRIGHT_EVENT"], "manual");
        assert_eq!(env["PIPEWRIGHT_RUN_ID"], run_id.to_string());
        assert_eq!(env["PIPEWRIGHT_WORKSPACE"], format!("/work/{}", run_id.short()));
        assert_eq!(env["MATRIX_OS"], "ubuntu-latest");
        assert_eq!(env["MATRIX_PYTHON_VERSION"], "3.9");
        assert_eq!(env["GREETING"], "hi 3.9");
        assert_eq!(env["EXTRA"], "1");
    }

    #[tokio::test]
    async fn test_setup_python_activates_venv_for_later_steps() {
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = PipelineOrchestrator::new(executor.clone(), RunnerConfig::default());
        let mut setup = run_step("setup", "");
        setup.action = StepAction::SetupPython {
            version: "${matrix.python-version}".to_string(),
            interpreter: None,
        };
        let pipeline = pipeline(vec![run_step("before", "true"), setup, run_step("after", "pip list")]);

        let result = orchestrator
            .run(&pipeline, TriggerEvent::manual(), HashMap::new(), None)
            .await;
        assert!(result.success);

        let scripts = executor.scripts.lock().unwrap();
        assert!(!scripts[0].1.contains("VIRTUAL_ENV"));
        assert!(scripts[1].1.contains("python3.9"));
        assert!(scripts[2].1.starts_with("export VIRTUAL_ENV="));
        assert!(scripts[2].1.ends_with("pip list"));
    }

    #[tokio::test]
    async fn test_undefined_matrix_value_in_env_or_directory_fails_before_spawn() {
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = PipelineOrchestrator::new(executor.clone(), RunnerConfig::default());

        let mut with_env = run_step("with-env", "echo $ARCH");
        with_env.env.insert("ARCH".to_string(), "${matrix.arch}".to_string());
        let mut with_dir = run_step("with-dir", "pytest");
        with_dir.working_dir = Some("build-${matrix.arch}".to_string());
        with_dir.continue_on_error = true;

        for steps in [vec![with_env], vec![with_dir]] {
            let result = orchestrator
                .run(&pipeline(steps), TriggerEvent::manual(), HashMap::new(), None)
                .await;
            let step = &result.runs[0].steps[0];
            match &step.status {
                StepStatus::Failed { message, .. } => assert!(message.contains("${matrix.arch}")),
                other => panic!("unexpected status: {:?}", other),
            }
        }
        assert!(executor.scripts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_executor_is_not_asked_to_prepare() {
        let executor = Arc::new(RecordingExecutor {
            unavailable: true,
            ..Default::default()
        });
        let orchestrator = PipelineOrchestrator::new(executor.clone(), RunnerConfig::default());
        let pipeline = pipeline(vec![run_step("only", "true")]);

        let result = orchestrator
            .run(&pipeline, TriggerEvent::manual(), HashMap::new(), None)
            .await;

        assert!(!result.success);
        let run = &result.runs[0];
        assert_eq!(run.status, RunStatus::Failed { step: None });
        assert!(run.error.as_deref().unwrap().contains("recording executor cannot provide"));
        assert!(matches!(run.steps[0].status, StepStatus::Skipped { .. }));
        assert!(executor.images.lock().unwrap().is_empty());
        assert!(executor.scripts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tolerated_failure_does_not_fail_run() {
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = PipelineOrchestrator::new(executor.clone(), RunnerConfig::default());
        let mut info = run_step("info", "FAIL");
        info.continue_on_error = true;
        let pipeline = pipeline(vec![info, run_step("next", "true")]);

        let result = orchestrator
            .run(&pipeline, TriggerEvent::manual(), HashMap::new(), None)
            .await;

        assert!(result.success);
        let run = &result.runs[0];
        assert!(run.step("info").unwrap().status.is_failure());
        assert!(run.step("info").unwrap().tolerated);
        assert!(run.step("next").unwrap().status.is_success());
    }

    #[tokio::test]
    async fn test_events_and_image_for_os_axis() {
        let executor = Arc::new(RecordingExecutor::default());
        let orchestrator = PipelineOrchestrator::new(executor.clone(), RunnerConfig::default());
        let pipeline = pipeline(vec![run_step("only", "true")]);

        let (mut rx, handle) =
            orchestrator.execute(&pipeline, TriggerEvent::manual(), HashMap::new(), None);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let result = handle.await.unwrap();

        assert!(result.success);
        assert!(matches!(events.first(), Some(PipelineEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { success: true })
        ));
        assert_eq!(
            *executor.images.lock().unwrap(),
            vec![Some("ubuntu:24.04".to_string())]
        );
    }
}
