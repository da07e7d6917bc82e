use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    /// Table or file identifier holding the job result.
    pub location: String,
    pub rows_written: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed(JobOutput),
    Failed(String),
}

impl JobStatus {
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed(_) | JobStatus::Failed(_) => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// Shared job status that only moves forward: pending, running, then one terminal state.
#[derive(Debug, Clone)]
pub(crate) struct JobState {
    tx: Arc<watch::Sender<JobStatus>>,
}

impl JobState {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(JobStatus::Pending);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn current(&self) -> JobStatus {
        self.tx.borrow().clone()
    }

    /// Moves to `next` if it is strictly later than the current status. Returns whether the
    /// status changed.
    pub(crate) fn advance(&self, next: JobStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if next.rank() > current.rank() {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.tx.subscribe()
    }
}
