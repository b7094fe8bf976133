//! Bookkeeping for jobs spawned by an executor.
//!
//! Each job owns a log channel, a completion watch and a kill switch. The task
//! driving the job publishes the final result on the watch, where `wait`
//! picks it up.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use pipewright_core::executor::{JobResult, JobStatus, LogLine};
use pipewright_core::{Error, Result, RunId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sending halves handed to the task that drives a job.
pub(crate) struct JobChannels {
    pub logs: mpsc::UnboundedSender<LogLine>,
    pub done: watch::Sender<Option<JobResult>>,
    pub kill: oneshot::Receiver<()>,
}

struct TrackedJob {
    workspace: RunId,
    logs: Option<mpsc::UnboundedReceiver<LogLine>>,
    done: watch::Receiver<Option<JobResult>>,
    kill: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub(crate) struct JobTracker {
    jobs: Mutex<HashMap<RunId, TrackedJob>>,
}

impl JobTracker {
    /// Register a job and return the channels its driver task should use.
    pub fn register(&self, id: RunId, workspace: RunId) -> JobChannels {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();

        let job = TrackedJob {
            workspace,
            logs: Some(log_rx),
            done: done_rx,
            kill: Some(kill_tx),
        };
        self.lock().insert(id, job);

        JobChannels {
            logs: log_tx,
            done: done_tx,
            kill: kill_rx,
        }
    }

    /// Take the job's log stream. Can only be taken once.
    pub fn take_logs(&self, id: &RunId) -> Result<BoxStream<'static, LogLine>> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        let rx = job
            .logs
            .take()
            .ok_or_else(|| Error::InvalidInput(format!("logs for job {} already taken", id)))?;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    pub async fn wait(&self, id: &RunId) -> Result<JobResult> {
        let mut done = {
            let jobs = self.lock();
            jobs.get(id)
                .ok_or_else(|| Error::NotFound(format!("job {}", id)))?
                .done
                .clone()
        };

        let result = done
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| Error::Internal(format!("job {} driver exited without a result", id)))?;

        result
            .clone()
            .ok_or_else(|| Error::Internal(format!("job {} has no result", id)))
    }

    /// Signal the job's driver to stop it. Returns false if the job already finished.
    pub fn cancel(&self, id: &RunId) -> Result<bool> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        match job.kill.take() {
            Some(kill) => Ok(kill.send(()).is_ok()),
            None => Ok(false),
        }
    }

    /// Drop all bookkeeping for jobs spawned in a workspace.
    pub fn forget_workspace(&self, workspace: &RunId) {
        self.lock().retain(|_, job| job.workspace != *workspace);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Result for a job stopped through `cancel`.
pub(crate) fn cancelled(started_at: DateTime<Utc>) -> JobResult {
    JobResult {
        status: JobStatus::Cancelled {
            started_at: Some(started_at),
            cancelled_at: Utc::now(),
        },
        exit_code: None,
    }
}

/// Result for a job whose driver hit an infrastructure error.
pub(crate) fn errored(started_at: DateTime<Utc>, message: String) -> JobResult {
    JobResult {
        status: JobStatus::Failed {
            started_at: Some(started_at),
            finished_at: Utc::now(),
            exit_code: None,
            message,
        },
        exit_code: None,
    }
}
