use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeastError>;

#[derive(Debug, Error)]
pub enum FeastError {
    #[error(
        "Could not parse feature reference '{reference}' ({reason}), expecting \"namespace/feature:version\""
    )]
    MalformedReference { reference: String, reason: String },

    #[error("No namespace specified in '{reference}' and no default namespace provided")]
    MissingNamespace { reference: String },

    #[error("Entity key encoding failed: {0}")]
    Encoding(String),

    #[error("Entity {name} does not exist in project {project}")]
    EntityNotFound { name: String, project: String },

    #[error("Feature view {name} does not exist in project {project}")]
    FeatureViewNotFound { name: String, project: String },

    #[error("Feature {feature} does not exist in feature view {view}")]
    FeatureNotFound { feature: String, view: String },

    #[error("Feature {feature} is defined by several feature views: {views:?}, qualify it as view.feature")]
    AmbiguousFeature { feature: String, views: Vec<String> },

    #[error("Invalid time window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Online store '{backend}' is unavailable: {source:#}")]
    BackendUnavailable {
        backend: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Offline store query failed: {0:#}")]
    OfflineStore(#[source] anyhow::Error),

    #[error("Timed out after {timeout:?} waiting for job {job_id}")]
    JobTimeout { job_id: String, timeout: Duration },

    #[error("Job {job_id} failed: {cause}")]
    JobExecution { job_id: String, cause: String },

    #[error("Job {job_id} cannot be cancelled: {reason}")]
    CancellationUnsupported { job_id: String, reason: String },

    #[error("Materialization of '{view}' over [{start}, {end}) failed at {stage}: {source}")]
    Materialization {
        view: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        stage: String,
        batch_index: Option<usize>,
        #[source]
        source: Box<FeastError>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl FeastError {
    pub fn malformed_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    pub fn backend_unavailable(backend: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::BackendUnavailable {
            backend,
            source: source.into(),
        }
    }

    pub fn offline_store(source: impl Into<anyhow::Error>) -> Self {
        Self::OfflineStore(source.into())
    }

    pub fn entity_not_found(name: impl Into<String>, project: impl Into<String>) -> Self {
        Self::EntityNotFound {
            name: name.into(),
            project: project.into(),
        }
    }

    pub fn feature_view_not_found(name: impl Into<String>, project: impl Into<String>) -> Self {
        Self::FeatureViewNotFound {
            name: name.into(),
            project: project.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether resubmitting the same work may succeed. Writes are idempotent under the
    /// conflict-resolution rule, so a whole batch can always be resubmitted.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BackendUnavailable { .. } | Self::OfflineStore(_) => true,
            Self::Materialization { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound { .. }
                | Self::FeatureViewNotFound { .. }
                | Self::FeatureNotFound { .. }
        )
    }

    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::Encoding(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn materialization_error_keeps_retryability_of_cause() {
        let now = Utc::now();
        let err = FeastError::Materialization {
            view: "driver_hourly_stats".to_string(),
            start: now,
            end: now,
            stage: "batch 3".to_string(),
            batch_index: Some(3),
            source: Box::new(FeastError::backend_unavailable(
                "sqlite",
                anyhow!("database is locked"),
            )),
        };
        assert!(err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("batch 3"), "{}", message);
        assert!(message.contains("database is locked"), "{}", message);
    }

    #[test]
    fn user_input_errors_are_not_retryable() {
        assert!(!FeastError::malformed_reference("a/b/c", "more than one '/'").is_retryable());
        assert!(!FeastError::encoding("null entity value").is_retryable());
        assert!(FeastError::feature_view_not_found("fv", "proj").is_not_found());
    }
}
