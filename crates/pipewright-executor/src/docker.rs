//! Docker executor implementation.
//!
//! A run gets one long-lived container (`sleep infinity`) created from the
//! image mapped to its `os` matrix value. Every step is a `docker exec` in that
//! container, so files written by one step are visible to the next.

use crate::tracker::{self, JobTracker};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use pipewright_core::executor::*;
use pipewright_core::{Error, Result, RunId};
use tracing::{debug, info, warn};

const WORKSPACE_PATH: &str = "/workspace";
const SOURCE_PATH: &str = "/src";

/// Executor running each run in its own Docker container.
pub struct DockerExecutor {
    docker: Docker,
    jobs: JobTracker,
}

impl DockerExecutor {
    /// Create a new DockerExecutor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            jobs: JobTracker::default(),
        }
    }

    fn container_name(run_id: &RunId) -> String {
        format!("pipewright-run-{}", run_id.short())
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    // A locally built image cannot be pulled; container creation reports real problems.
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, spec: &WorkspaceSpec) -> bool {
        spec.image.is_some() && self.docker.ping().await.is_ok()
    }

    async fn prepare(&self, spec: WorkspaceSpec) -> Result<Workspace> {
        let image = spec.image.clone().ok_or_else(|| {
            Error::Provisioning(format!("no container image for run {}", spec.run_id))
        })?;
        let container_name = Self::container_name(&spec.run_id);

        self.pull_image(&image).await;

        let (binds, source_path) = match &spec.source_dir {
            Some(src) => {
                let src = tokio::fs::canonicalize(src).await.map_err(|e| {
                    Error::Provisioning(format!("source {}: {}", src.display(), e))
                })?;
                (
                    Some(vec![format!("{}:{}:ro", src.to_string_lossy(), SOURCE_PATH)]),
                    Some(SOURCE_PATH.to_string()),
                )
            }
            None => (None, None),
        };

        let config = Config {
            image: Some(image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WORKSPACE_PATH.to_string()),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds,
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, image = %image, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::Provisioning(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(remove_err) = self
                .docker
                .remove_container(&container.id, Some(options))
                .await
            {
                warn!(container = %container_name, error = %remove_err, "Failed to remove container after start failure");
            }
            return Err(Error::Provisioning(format!("Failed to start container: {}", e)));
        }

        Ok(Workspace {
            run_id: spec.run_id,
            path: WORKSPACE_PATH.to_string(),
            source_path,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn spawn(&self, workspace: &Workspace, spec: JobSpec) -> Result<JobHandle> {
        if spec.command.is_empty() {
            return Err(Error::InvalidInput(format!(
                "job {} has an empty command",
                spec.id
            )));
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let working_dir = match &spec.working_dir {
            Some(dir) if dir.starts_with('/') => dir.clone(),
            Some(dir) => format!("{}/{}", workspace.path, dir),
            None => workspace.path.clone(),
        };

        let exec = self
            .docker
            .create_exec(
                &workspace.executor_id,
                CreateExecOptions {
                    cmd: Some(spec.command.clone()),
                    env: Some(env),
                    working_dir: Some(working_dir),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create exec: {}", e)))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start exec: {}", e)))?;

        let StartExecResults::Attached { mut output, .. } = started else {
            return Err(Error::ExecutionFailed(
                "exec started detached; no output to follow".to_string(),
            ));
        };

        let started_at = Utc::now();
        let channels = self.jobs.register(spec.id, workspace.run_id);
        debug!(job_id = %spec.id, exec_id = %exec.id, "Started exec");

        let docker = self.docker.clone();
        let exec_id = exec.id.clone();
        let container = workspace.executor_id.clone();
        let logs = channels.logs;
        let done = channels.done;
        let mut kill = channels.kill;

        tokio::spawn(async move {
            let mut killed = false;
            let mut stdout = LineBuffer::default();
            let mut stderr = LineBuffer::default();
            loop {
                tokio::select! {
                    chunk = output.next() => match chunk {
                        Some(Ok(chunk)) => {
                            let (stream, message) = match chunk {
                                LogOutput::StdErr { message } => (LogStream::Stderr, message),
                                LogOutput::StdOut { message }
                                | LogOutput::Console { message }
                                | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                            };
                            let buffer = match stream {
                                LogStream::Stderr => &mut stderr,
                                _ => &mut stdout,
                            };
                            for line in buffer.push(&message) {
                                let _ = logs.send(LogLine::new(stream, line));
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Exec output error");
                            break;
                        }
                        None => break,
                    },
                    Ok(()) = &mut kill => {
                        // Execs cannot be signalled individually; stopping the container ends the run.
                        if let Err(e) = docker
                            .kill_container(&container, None::<KillContainerOptions<String>>)
                            .await
                        {
                            warn!(container = %container, error = %e, "Failed to kill container");
                        }
                        killed = true;
                        break;
                    }
                }
            }
            for (stream, buffer) in [(LogStream::Stdout, &mut stdout), (LogStream::Stderr, &mut stderr)] {
                if let Some(line) = buffer.finish() {
                    let _ = logs.send(LogLine::new(stream, line));
                }
            }
            drop(logs);

            let result = if killed {
                tracker::cancelled(started_at)
            } else {
                match docker.inspect_exec(&exec_id).await {
                    Ok(inspect) => JobResult::from_exit(
                        inspect.exit_code.map(|c| c as i32),
                        started_at,
                        Utc::now(),
                    ),
                    Err(e) => tracker::errored(started_at, format!("Failed to inspect exec: {}", e)),
                }
            };
            let _ = done.send(Some(result));
        });

        Ok(JobHandle {
            id: spec.id,
            executor_id: exec.id,
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
        self.jobs.cancel(&handle.id)?;
        Ok(())
    }

    async fn teardown(&self, workspace: &Workspace) -> Result<()> {
        self.jobs.forget_workspace(&workspace.run_id);

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(&workspace.executor_id, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))?;

        info!(container = %workspace.executor_id, "Removed container");
        Ok(())
    }
}

/// Reassembles output lines that arrive split across exec frames.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Add a frame and return the lines it completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..last].split(|&b| b == b'\n').map(to_line).collect()
    }

    /// Output left over once the stream ends without a final newline.
    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(to_line(&rest))
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
