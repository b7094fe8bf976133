//! Local process executor.
//!
//! Each run gets a fresh directory on the host; steps run as child processes
//! with that directory as their working directory.

use crate::tracker::{self, JobTracker};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use pipewright_core::executor::*;
use pipewright_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Time a cancelled step gets to exit after SIGTERM before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Executor running steps as processes on the host.
#[derive(Default)]
pub struct LocalExecutor {
    jobs: JobTracker,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn workspace_dir(spec: &WorkspaceSpec) -> PathBuf {
        let root = spec.root.clone().unwrap_or_else(std::env::temp_dir);
        root.join(format!("pipewright-{}", spec.run_id.short()))
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn can_execute(&self, _spec: &WorkspaceSpec) -> bool {
        true
    }

    async fn prepare(&self, spec: WorkspaceSpec) -> Result<Workspace> {
        let dir = Self::workspace_dir(&spec);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Provisioning(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let source_path = match &spec.source_dir {
            Some(src) => Some(
                tokio::fs::canonicalize(src)
                    .await
                    .map_err(|e| {
                        Error::Provisioning(format!("source {}: {}", src.display(), e))
                    })?
                    .to_string_lossy()
                    .to_string(),
            ),
            None => None,
        };

        if spec.image.is_some() {
            debug!(run_id = %spec.run_id, "Local executor ignores container image");
        }

        info!(run_id = %spec.run_id, dir = %dir.display(), "Prepared workspace");

        let path = dir.to_string_lossy().to_string();
        Ok(Workspace {
            run_id: spec.run_id,
            path: path.clone(),
            source_path,
            executor_id: path,
            executor_name: self.name().to_string(),
        })
    }

    async fn spawn(&self, workspace: &Workspace, spec: JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput(format!("job {} has an empty command", spec.id)))?;

        let working_dir = match &spec.working_dir {
            Some(dir) => Path::new(&workspace.path).join(dir),
            None => PathBuf::from(&workspace.path),
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancelling reaches everything the step started.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn {}: {}", program, e)))?;

        let started_at = Utc::now();
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        debug!(job_id = %spec.id, pid = %pid, dir = %working_dir.display(), "Spawned process");

        let channels = self.jobs.register(spec.id, workspace.run_id);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogStream::Stdout, channels.logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogStream::Stderr, channels.logs.clone()));
        }
        drop(channels.logs);

        let job_id = spec.id;
        let kill = channels.kill;
        let done = channels.done;
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = kill => None,
            };

            let result = match exited {
                Some(Ok(status)) => JobResult::from_exit(status.code(), started_at, Utc::now()),
                Some(Err(e)) => tracker::errored(started_at, format!("wait failed: {}", e)),
                None => {
                    terminate_process_group(&mut child, KILL_GRACE).await;
                    debug!(job_id = %job_id, "Terminated process group");
                    tracker::cancelled(started_at)
                }
            };
            let _ = done.send(Some(result));
        });

        Ok(JobHandle {
            id: spec.id,
            executor_id: pid,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        self.jobs.take_logs(&handle.id)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        self.jobs.wait(&handle.id).await
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        if !self.jobs.cancel(&handle.id)? {
            debug!(job_id = %handle.id, "Cancel requested for finished job");
        }
        Ok(())
    }

    async fn teardown(&self, workspace: &Workspace) -> Result<()> {
        self.jobs.forget_workspace(&workspace.run_id);
        match tokio::fs::remove_dir_all(&workspace.path).await {
            Ok(()) => {
                info!(run_id = %workspace.run_id, "Removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stop a step and every process it started: SIGTERM to the group, then
/// SIGKILL once `grace` has passed.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "SIGTERM to process group failed"),
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid, "Process group ignored SIGTERM; killing");
    }

    // The leader may be gone while others in its group are still running.
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "SIGKILL to process group failed"),
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _grace: Duration) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill process");
    }
}

async fn forward_lines<R>(reader: R, stream: LogStream, tx: mpsc::UnboundedSender<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                // Keep draining after the receiver is gone so the child never blocks on a full pipe.
                let _ = tx.send(LogLine::new(stream, line));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Log stream error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pipewright_core::RunId;
    use std::collections::HashMap;

    fn sh(script: &str) -> JobSpec {
        JobSpec {
            id: RunId::new(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            working_dir: None,
            env: HashMap::new(),
        }
    }

    async fn workspace(executor: &LocalExecutor, root: &Path) -> Workspace {
        executor
            .prepare(WorkspaceSpec {
                run_id: RunId::new(),
                image: None,
                source_dir: None,
                root: Some(root.to_path_buf()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_and_capture_output() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ws = workspace(&executor, root.path()).await;

        let mut spec = sh("echo hello; echo oops >&2; echo \"$GREETING\"");
        spec.env.insert("GREETING".to_string(), "hi there".to_string());
        let handle = executor.spawn(&ws, spec).await.unwrap();

        let logs: Vec<LogLine> = executor.logs(&handle).await.unwrap().collect().await;
        let result = executor.wait(&handle).await.unwrap();

        assert!(matches!(result.status, JobStatus::Succeeded { .. }));
        assert_eq!(result.exit_code, Some(0));
        assert!(logs.iter().any(|l| l.stream == LogStream::Stdout && l.content == "hello"));
        assert!(logs.iter().any(|l| l.stream == LogStream::Stderr && l.content == "oops"));
        assert!(logs.iter().any(|l| l.content == "hi there"));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ws = workspace(&executor, root.path()).await;

        let handle = executor.spawn(&ws, sh("exit 3")).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(matches!(result.status, JobStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_steps_share_workspace_files() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ws = workspace(&executor, root.path()).await;

        let first = executor.spawn(&ws, sh("mkdir sub && echo data > sub/file")).await.unwrap();
        executor.wait(&first).await.unwrap();

        let mut second = sh("cat file");
        second.working_dir = Some("sub".to_string());
        let handle = executor.spawn(&ws, second).await.unwrap();
        let logs: Vec<LogLine> = executor.logs(&handle).await.unwrap().collect().await;
        let result = executor.wait(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(logs[0].content, "data");
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ws = workspace(&executor, root.path()).await;

        let handle = executor.spawn(&ws, sh("sleep 30")).await.unwrap();
        executor.cancel(&handle).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert!(matches!(result.status, JobStatus::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancel_reaches_child_processes() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ws = workspace(&executor, root.path()).await;

        let handle = executor
            .spawn(&ws, sh("sh -c 'sleep 2; touch late' & wait"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        executor.cancel(&handle).await.unwrap();
        executor.wait(&handle).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!Path::new(&ws.path).join("late").exists());
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ws = workspace(&executor, root.path()).await;

        let spec = JobSpec {
            id: RunId::new(),
            command: vec!["definitely-not-a-real-program-xyz".to_string()],
            working_dir: None,
            env: HashMap::new(),
        };
        assert!(matches!(
            executor.spawn(&ws, spec).await,
            Err(Error::ExecutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_teardown_removes_workspace() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let ws = workspace(&executor, root.path()).await;
        assert!(Path::new(&ws.path).is_dir());

        executor.teardown(&ws).await.unwrap();
        assert!(!Path::new(&ws.path).exists());
        // A second teardown is a no-op.
        executor.teardown(&ws).await.unwrap();
    }

    #[tokio::test]
    async fn test_prepare_resolves_source_dir() {
        let root = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();

        let ws = executor
            .prepare(WorkspaceSpec {
                run_id: RunId::new(),
                image: None,
                source_dir: Some(source.path().to_path_buf()),
                root: Some(root.path().to_path_buf()),
            })
            .await
            .unwrap();
        assert!(ws.source_path.is_some());

        let missing = executor
            .prepare(WorkspaceSpec {
                run_id: RunId::new(),
                image: None,
                source_dir: Some(source.path().join("missing")),
                root: Some(root.path().to_path_buf()),
            })
            .await;
        assert!(matches!(missing, Err(Error::Provisioning(_))));
    }
}
