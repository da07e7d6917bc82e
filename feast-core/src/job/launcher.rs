use crate::error::{FeastError, Result};
use crate::job::RetrievalJobHandle;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

/// Submits historical feature retrieval jobs to an execution backend.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn historical_feature_retrieval(
        &self,
        job_id: &str,
        config: serde_json::Value,
        output_location: &str,
    ) -> Result<RetrievalJobHandle>;
}

/// Runs jobs on a standalone Spark cluster in client mode through `spark-submit`.
#[derive(Debug, Clone)]
pub struct StandaloneClusterLauncher {
    master_url: String,
    submit_program: PathBuf,
    script: PathBuf,
    poll_interval: Duration,
}

impl StandaloneClusterLauncher {
    pub fn new(
        master_url: impl Into<String>,
        spark_home: impl AsRef<Path>,
        script: impl Into<PathBuf>,
    ) -> Self {
        Self {
            master_url: master_url.into(),
            submit_program: spark_home.as_ref().join("bin").join("spark-submit"),
            script: script.into(),
            poll_interval: super::DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_submit_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.submit_program = program.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn submit_program(&self) -> &Path {
        &self.submit_program
    }

    fn command(&self, job_id: &str, config: &serde_json::Value) -> Result<Command> {
        if self.master_url.is_empty() {
            return Err(FeastError::config("spark master url must not be empty"));
        }
        let config = serde_json::to_string(config)
            .map_err(|e| FeastError::config(format!("invalid job config: {}", e)))?;
        let mut command = Command::new(&self.submit_program);
        command
            .arg("--master")
            .arg(&self.master_url)
            .arg("--name")
            .arg(job_id)
            .arg(&self.script)
            .arg(config);
        Ok(command)
    }
}

#[async_trait]
impl JobLauncher for StandaloneClusterLauncher {
    async fn historical_feature_retrieval(
        &self,
        job_id: &str,
        config: serde_json::Value,
        output_location: &str,
    ) -> Result<RetrievalJobHandle> {
        let command = self.command(job_id, &config)?;
        info!(
            "Submitting job {} to {} via {}",
            job_id,
            self.master_url,
            self.submit_program.display()
        );
        Ok(
            RetrievalJobHandle::from_process(job_id, command, output_location)?
                .with_poll_interval(self.poll_interval),
        )
    }
}
