//! Asynchronous handles for submitted retrieval and materialization jobs.
//!
//! Every handle follows the same state machine: `Pending`, then `Running`, then `Completed` or
//! `Failed`. States are never revisited. Waiting with a timeout leaves the job untouched;
//! cancellation is a transition to `Failed("cancelled")` where the executor supports it.

pub mod launcher;
mod state;

pub use state::{JobOutput, JobStatus};

use crate::error::{FeastError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use state::JobState;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

pub const CANCELLED: &str = "cancelled";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Status source for jobs running on an external executor.
#[async_trait]
pub trait RemoteJobClient: Send + Sync + 'static {
    async fn status(&self, job_id: &str) -> Result<JobStatus>;

    fn supports_cancellation(&self) -> bool {
        false
    }

    async fn cancel(&self, job_id: &str) -> Result<()> {
        Err(FeastError::CancellationUnsupported {
            job_id: job_id.to_string(),
            reason: "the executor does not support cancellation".to_string(),
        })
    }
}

struct TaskJob {
    state: JobState,
    abort: AbortHandle,
}

struct ProcessJob {
    state: JobState,
    cancel: Arc<Notify>,
}

struct RemoteJob {
    state: JobState,
    client: Arc<dyn RemoteJobClient>,
}

enum JobKind {
    Task(TaskJob),
    Process(ProcessJob),
    Remote(RemoteJob),
}

pub struct RetrievalJobHandle {
    id: String,
    kind: JobKind,
    poll_interval: Duration,
}

impl std::fmt::Debug for RetrievalJobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            JobKind::Task(_) => "task",
            JobKind::Process(_) => "process",
            JobKind::Remote(_) => "remote",
        };
        f.debug_struct("RetrievalJobHandle")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

impl RetrievalJobHandle {
    /// Runs `job` as a tokio task. The job turns `Running` once the task is first polled.
    pub fn spawn<F>(id: impl Into<String>, job: F) -> Self
    where
        F: Future<Output = Result<JobOutput>> + Send + 'static,
    {
        let id = id.into();
        let state = JobState::new();
        let task_state = state.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            task_state.advance(JobStatus::Running);
            let next = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(output)) => JobStatus::Completed(output),
                Ok(Err(err)) => JobStatus::Failed(err.to_string()),
                Err(_) => JobStatus::Failed("job panicked".to_string()),
            };
            if !task_state.advance(next) {
                debug!("Job {} finished after reaching a terminal state", task_id);
            }
        });
        Self {
            id,
            kind: JobKind::Task(TaskJob {
                state,
                abort: handle.abort_handle(),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Starts `command` as a child process (no shell). A zero exit status completes the job
    /// with `output_location`; otherwise it fails with the exit code and captured stderr.
    pub fn from_process(
        id: impl Into<String>,
        mut command: Command,
        output_location: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        let output_location = output_location.into();
        command
            .stdin(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        let mut child = command.spawn().map_err(|e| FeastError::JobExecution {
            job_id: id.clone(),
            cause: format!("failed to start process: {}", e),
        })?;
        let state = JobState::new();
        state.advance(JobStatus::Running);
        let cancel = Arc::new(Notify::new());

        let monitor_state = state.clone();
        let monitor_cancel = cancel.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            let stderr_reader = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut captured = String::new();
                    let _ = stderr.read_to_string(&mut captured).await;
                    captured
                })
            });
            let next = tokio::select! {
                exit = child.wait() => {
                    let stderr = match stderr_reader {
                        Some(reader) => reader.await.unwrap_or_default(),
                        None => String::new(),
                    };
                    match exit {
                        Ok(status) if status.success() => JobStatus::Completed(JobOutput {
                            location: output_location,
                            rows_written: None,
                        }),
                        Ok(status) => JobStatus::Failed(format!(
                            "Non zero return code: {}. stderr: {}",
                            status.code().map_or("signal".to_string(), |c| c.to_string()),
                            stderr.trim_end()
                        )),
                        Err(err) => JobStatus::Failed(format!("failed to wait for process: {}", err)),
                    }
                }
                _ = monitor_cancel.notified() => {
                    if let Err(err) = child.kill().await {
                        warn!("Failed to kill process of job {}: {}", job_id, err);
                    }
                    JobStatus::Failed(CANCELLED.to_string())
                }
            };
            monitor_state.advance(next);
        });

        Ok(Self {
            id,
            kind: JobKind::Process(ProcessJob { state, cancel }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Tracks a job owned by an external executor through polling.
    pub fn remote(id: impl Into<String>, client: Arc<dyn RemoteJobClient>) -> Self {
        Self {
            id: id.into(),
            kind: JobKind::Remote(RemoteJob {
                state: JobState::new(),
                client,
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn supports_cancellation(&self) -> bool {
        match &self.kind {
            JobKind::Task(_) | JobKind::Process(_) => true,
            JobKind::Remote(remote) => remote.client.supports_cancellation(),
        }
    }

    pub async fn status(&self) -> Result<JobStatus> {
        match &self.kind {
            JobKind::Task(TaskJob { state, .. }) | JobKind::Process(ProcessJob { state, .. }) => {
                Ok(state.current())
            }
            JobKind::Remote(remote) => {
                let reported = remote.client.status(&self.id).await?;
                remote.state.advance(reported);
                Ok(remote.state.current())
            }
        }
    }

    fn finish(&self, status: JobStatus) -> Result<JobOutput> {
        match status {
            JobStatus::Completed(output) => Ok(output),
            JobStatus::Failed(cause) => Err(FeastError::JobExecution {
                job_id: self.id.clone(),
                cause,
            }),
            other => Err(FeastError::JobExecution {
                job_id: self.id.clone(),
                cause: format!("job ended in non terminal state {:?}", other),
            }),
        }
    }

    async fn wait_terminal(&self) -> Result<JobStatus> {
        match &self.kind {
            JobKind::Task(TaskJob { state, .. }) | JobKind::Process(ProcessJob { state, .. }) => {
                let mut rx = state.subscribe();
                let status = rx
                    .wait_for(JobStatus::is_terminal)
                    .await
                    .map(|status| status.clone())
                    .map_err(|_| FeastError::JobExecution {
                        job_id: self.id.clone(),
                        cause: "job state was dropped".to_string(),
                    })?;
                Ok(status)
            }
            JobKind::Remote(_) => loop {
                let status = self.status().await?;
                if status.is_terminal() {
                    return Ok(status);
                }
                tokio::time::sleep(self.poll_interval).await;
            },
        }
    }

    /// Blocks until the job is terminal. On timeout the job keeps running and its state is
    /// left unchanged.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<JobOutput> {
        let status = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.wait_terminal())
                .await
                .map_err(|_| FeastError::JobTimeout {
                    job_id: self.id.clone(),
                    timeout,
                })??,
            None => self.wait_terminal().await?,
        };
        self.finish(status)
    }

    /// Cancels a running job. Cancelling a job that already finished leaves it unchanged.
    pub async fn cancel(&self) -> Result<()> {
        match &self.kind {
            JobKind::Task(task) => {
                if task.state.advance(JobStatus::Failed(CANCELLED.to_string())) {
                    task.abort.abort();
                    debug!("Cancelled job {}", self.id);
                }
                Ok(())
            }
            JobKind::Process(process) => {
                if process
                    .state
                    .advance(JobStatus::Failed(CANCELLED.to_string()))
                {
                    process.cancel.notify_one();
                    debug!("Cancelled job {}", self.id);
                }
                Ok(())
            }
            JobKind::Remote(remote) => {
                if !remote.client.supports_cancellation() {
                    return Err(FeastError::CancellationUnsupported {
                        job_id: self.id.clone(),
                        reason: "the executor does not support cancellation".to_string(),
                    });
                }
                if remote.state.current().is_terminal() {
                    return Ok(());
                }
                remote.client.cancel(&self.id).await?;
                remote
                    .state
                    .advance(JobStatus::Failed(CANCELLED.to_string()));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn output() -> JobOutput {
        JobOutput {
            location: "proj_driver_stats".to_string(),
            rows_written: Some(3),
        }
    }

    #[tokio::test]
    async fn task_job_completes() -> anyhow::Result<()> {
        let handle = RetrievalJobHandle::spawn("job-1", async { Ok(output()) });
        assert_eq!(handle.wait(Some(Duration::from_secs(5))).await?, output());
        assert_eq!(handle.status().await?, JobStatus::Completed(output()));
        assert_eq!(handle.id(), "job-1");
        Ok(())
    }

    #[tokio::test]
    async fn task_job_failure_preserves_cause() {
        let handle = RetrievalJobHandle::spawn("job-2", async {
            Err(FeastError::config("source table missing"))
        });
        match handle.wait(None).await {
            Err(FeastError::JobExecution { job_id, cause }) => {
                assert_eq!(job_id, "job-2");
                assert!(cause.contains("source table missing"), "{}", cause);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn timeout_leaves_job_running() -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = RetrievalJobHandle::spawn("job-3", async move {
            let _ = rx.await;
            Ok(output())
        });
        let err = handle
            .wait(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, FeastError::JobTimeout { .. }));
        assert!(!handle.status().await?.is_terminal());
        let _ = tx.send(());
        assert_eq!(handle.wait(Some(Duration::from_secs(5))).await?, output());
        Ok(())
    }

    #[tokio::test]
    async fn cancel_task_job() -> anyhow::Result<()> {
        let handle = RetrievalJobHandle::spawn("job-4", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(output())
        });
        assert!(handle.supports_cancellation());
        handle.cancel().await?;
        assert_eq!(
            handle.status().await?,
            JobStatus::Failed(CANCELLED.to_string())
        );
        let err = handle.wait(Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, FeastError::JobExecution { cause, .. } if cause == CANCELLED));
        Ok(())
    }

    #[tokio::test]
    async fn panicking_job_fails() {
        let handle = RetrievalJobHandle::spawn("job-5", async {
            if true {
                panic!("boom");
            }
            Ok(output())
        });
        assert!(handle.wait(Some(Duration::from_secs(5))).await.is_err());
    }

    struct ScriptedClient {
        statuses: Mutex<Vec<JobStatus>>,
    }

    #[async_trait]
    impl RemoteJobClient for ScriptedClient {
        async fn status(&self, _job_id: &str) -> Result<JobStatus> {
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0].clone())
            }
        }
    }

    #[tokio::test]
    async fn remote_job_polls_until_terminal_and_never_regresses() -> anyhow::Result<()> {
        let client = Arc::new(ScriptedClient {
            statuses: Mutex::new(vec![
                JobStatus::Running,
                JobStatus::Pending,
                JobStatus::Failed("executor lost".to_string()),
            ]),
        });
        let handle = RetrievalJobHandle::remote("remote-1", client)
            .with_poll_interval(Duration::from_millis(1));
        assert_eq!(handle.status().await?, JobStatus::Running);
        // a stale report cannot move the job backwards
        assert_eq!(handle.status().await?, JobStatus::Running);
        let err = handle.wait(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, FeastError::JobExecution { cause, .. } if cause == "executor lost"));
        assert!(!handle.supports_cancellation());
        assert!(matches!(
            handle.cancel().await,
            Err(FeastError::CancellationUnsupported { .. })
        ));
        Ok(())
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn sh(script: &str) -> Command {
            let mut command = Command::new("sh");
            command.arg("-c").arg(script);
            command
        }

        #[tokio::test]
        async fn process_success_completes_with_location() -> anyhow::Result<()> {
            let handle = RetrievalJobHandle::from_process("p-1", sh("exit 0"), "file:///tmp/out")?;
            let out = handle.wait(Some(Duration::from_secs(10))).await?;
            assert_eq!(out.location, "file:///tmp/out");
            Ok(())
        }

        #[tokio::test]
        async fn process_failure_carries_stderr() {
            let handle =
                RetrievalJobHandle::from_process("p-2", sh("echo broken >&2; exit 3"), "out")
                    .unwrap();
            match handle.wait(Some(Duration::from_secs(10))).await {
                Err(FeastError::JobExecution { cause, .. }) => {
                    assert!(cause.contains("Non zero return code: 3"), "{}", cause);
                    assert!(cause.contains("broken"), "{}", cause);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        #[tokio::test]
        async fn process_can_be_cancelled() -> anyhow::Result<()> {
            let handle = RetrievalJobHandle::from_process("p-3", sh("sleep 30"), "out")?;
            assert_eq!(handle.status().await?, JobStatus::Running);
            assert!(matches!(
                handle.wait(Some(Duration::from_millis(50))).await,
                Err(FeastError::JobTimeout { .. })
            ));
            handle.cancel().await?;
            assert_eq!(
                handle.status().await?,
                JobStatus::Failed(CANCELLED.to_string())
            );
            Ok(())
        }

        #[tokio::test]
        async fn missing_program_fails_to_start() {
            let command = Command::new("/nonexistent/spark-submit");
            assert!(RetrievalJobHandle::from_process("p-4", command, "out").is_err());
        }
    }
}
