//! Moves the latest rows of a time window from an offline source into the online store.
//!
//! A single producer drains the offline cursor into a bounded channel. The consumer turns
//! source rows into feature rows, cuts them into batches of `write_batch_size` and hands up to
//! `write_concurrency` batches at a time to the [`ConflictResolvingWriter`]. At most
//! `write_concurrency + 1` batches are held in memory. Batches may land in any order; the
//! writer's conflict rule makes the outcome independent of it.

use crate::error::{FeastError, Result};
use crate::job::{JobOutput, RetrievalJobHandle};
use crate::model::{FeatureRow, FeatureView};
use crate::offline_store::{OfflineStore, PullLatestQueryBuilder, SourceRow};
use crate::writer::{ConflictResolvingWriter, WriteSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_WRITE_BATCH_SIZE: usize = 1000;

pub fn default_write_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// What to do with a source row whose key or values do not fit the feature view schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingErrorPolicy {
    /// Drop the row, count it and keep going.
    Skip,
    #[default]
    Fail,
}

#[derive(Debug, Clone)]
pub struct MaterializationOptions {
    pub write_batch_size: usize,
    pub write_concurrency: usize,
    pub encoding_errors: EncodingErrorPolicy,
    /// Poll interval of the job handle returned by [`MaterializationPipeline::materialize`].
    pub poll_interval: Duration,
}

impl Default for MaterializationOptions {
    fn default() -> Self {
        Self {
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            write_concurrency: default_write_concurrency(),
            encoding_errors: EncodingErrorPolicy::default(),
            poll_interval: crate::job::DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializationReport {
    pub rows_read: u64,
    pub rows_skipped: u64,
    pub rows_written: u64,
    pub rows_discarded: u64,
    pub batches: usize,
}

impl MaterializationReport {
    fn add_batch(&mut self, summary: WriteSummary) {
        self.rows_written += summary.rows_written;
        self.rows_discarded += summary.rows_discarded;
        self.batches += 1;
    }
}

/// Receives the number of rows submitted to the online store as batches get flushed.
pub trait ProgressSink: Send + Sync {
    fn rows_submitted(&self, view: &str, rows: usize);
}

#[derive(Debug, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn rows_submitted(&self, _view: &str, _rows: usize) {}
}

#[derive(Debug, Default)]
pub struct LoggingProgress {
    total: std::sync::atomic::AtomicU64,
}

impl ProgressSink for LoggingProgress {
    fn rows_submitted(&self, view: &str, rows: usize) {
        let total = self
            .total
            .fetch_add(rows as u64, std::sync::atomic::Ordering::Relaxed)
            + rows as u64;
        info!("{}: {} rows submitted ({} total)", view, rows, total);
    }
}

type BatchResult = (usize, Result<WriteSummary>);

pub struct MaterializationPipeline {
    offline_store: Arc<dyn OfflineStore>,
    writer: Arc<ConflictResolvingWriter>,
    progress: Arc<dyn ProgressSink>,
}

impl MaterializationPipeline {
    pub fn new(offline_store: Arc<dyn OfflineStore>, writer: Arc<ConflictResolvingWriter>) -> Self {
        Self {
            offline_store,
            writer,
            progress: Arc::new(NoopProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn writer(&self) -> &Arc<ConflictResolvingWriter> {
        &self.writer
    }

    /// Starts materializing `view` over `[start, end)` in the background. The job completes
    /// with the online table of the view as its location.
    pub fn materialize(
        self: &Arc<Self>,
        project: &str,
        view: Arc<FeatureView>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: MaterializationOptions,
    ) -> Result<RetrievalJobHandle> {
        if start > end {
            return Err(FeastError::InvalidWindow { start, end });
        }
        let location = view.table_id(project);
        let job_id = format!("materialize-{}-{}", view.name, Uuid::new_v4());
        let poll_interval = options.poll_interval;
        let pipeline = Arc::clone(self);
        let handle = RetrievalJobHandle::spawn(job_id, async move {
            let report = pipeline.run(view, start, end, &options).await?;
            Ok(JobOutput {
                location,
                rows_written: Some(report.rows_written),
            })
        });
        Ok(handle.with_poll_interval(poll_interval))
    }

    /// Materializes `view` over `[start, end)` and waits for every batch.
    pub async fn run(
        &self,
        view: Arc<FeatureView>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: &MaterializationOptions,
    ) -> Result<MaterializationReport> {
        let query = PullLatestQueryBuilder::for_view(&view).build(start, end)?;
        if start == end {
            debug!("Empty window for {}, nothing to materialize", view.name);
            return Ok(MaterializationReport::default());
        }
        info!(
            "Materializing {} from {} to {} (batch size {}, concurrency {})",
            view.name, start, end, options.write_batch_size, options.write_concurrency
        );

        let fail = |stage: &str, batch_index: Option<usize>, source: FeastError| {
            FeastError::Materialization {
                view: view.name.clone(),
                start,
                end,
                stage: stage.to_string(),
                batch_index,
                source: Box::new(source),
            }
        };

        let batch_size = options.write_batch_size.max(1);
        let (tx, mut rx) = mpsc::channel::<SourceRow>(batch_size);
        let offline_store = Arc::clone(&self.offline_store);
        let mut producer = tokio::spawn(async move { offline_store.pull_latest(&query, tx).await });

        let permits = Arc::new(Semaphore::new(options.write_concurrency.max(1)));
        let mut batches: JoinSet<BatchResult> = JoinSet::new();
        let mut report = MaterializationReport::default();
        let mut batch: Vec<FeatureRow> = Vec::with_capacity(batch_size);
        let mut next_batch = 0;

        let outcome: Result<()> = async {
            while let Some(row) = rx.recv().await {
                report.rows_read += 1;
                match to_feature_row(&view, row) {
                    Ok(row) => batch.push(row),
                    Err(err)
                        if err.is_encoding()
                            && options.encoding_errors == EncodingErrorPolicy::Skip =>
                    {
                        warn!("Skipping row of {}: {}", view.name, err);
                        report.rows_skipped += 1;
                    }
                    Err(err) => return Err(fail("encode", Some(next_batch), err)),
                }
                while let Some(joined) = batches.try_join_next() {
                    collect(&mut report, joined).map_err(|(i, e)| fail("write", Some(i), e))?;
                }
                if batch.len() == batch_size {
                    let rows = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    self.submit(&mut batches, &permits, &view, next_batch, rows)
                        .await
                        .map_err(|e| fail("write", Some(next_batch), e))?;
                    next_batch += 1;
                }
            }

            // The channel closes once the producer is done, successfully or not.
            let read = match (&mut producer).await {
                Ok(read) => read,
                Err(join_error) if join_error.is_panic() => {
                    std::panic::resume_unwind(join_error.into_panic())
                }
                Err(join_error) => Err(FeastError::offline_store(join_error)),
            };
            read.map_err(|e| fail("read", None, e))?;

            if !batch.is_empty() {
                let rows = std::mem::take(&mut batch);
                self.submit(&mut batches, &permits, &view, next_batch, rows)
                    .await
                    .map_err(|e| fail("write", Some(next_batch), e))?;
            }
            while let Some(joined) = batches.join_next().await {
                collect(&mut report, joined).map_err(|(i, e)| fail("write", Some(i), e))?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            producer.abort();
            batches.abort_all();
            warn!("Materialization of {} failed: {}", view.name, err);
            return Err(err);
        }
        info!(
            "Materialized {}: {} rows read, {} written, {} discarded, {} skipped in {} batches",
            view.name,
            report.rows_read,
            report.rows_written,
            report.rows_discarded,
            report.rows_skipped,
            report.batches
        );
        Ok(report)
    }

    async fn submit(
        &self,
        batches: &mut JoinSet<BatchResult>,
        permits: &Arc<Semaphore>,
        view: &Arc<FeatureView>,
        index: usize,
        rows: Vec<FeatureRow>,
    ) -> Result<()> {
        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|e| FeastError::config(format!("batch permits closed: {}", e)))?;
        let writer = Arc::clone(&self.writer);
        let progress = Arc::clone(&self.progress);
        let view = Arc::clone(view);
        debug!("Submitting batch {} of {} ({} rows)", index, view.name, rows.len());
        batches.spawn(async move {
            let _permit = permit;
            let on_flush = |rows: usize| progress.rows_submitted(&view.name, rows);
            let summary = writer.write_batch(&view, rows, Some(&on_flush)).await;
            (index, summary)
        });
        Ok(())
    }
}

fn collect(
    report: &mut MaterializationReport,
    joined: std::result::Result<BatchResult, tokio::task::JoinError>,
) -> std::result::Result<(), (usize, FeastError)> {
    match joined {
        Ok((_, Ok(summary))) => {
            report.add_batch(summary);
            Ok(())
        }
        Ok((index, Err(err))) => Err((index, err)),
        Err(join_error) if join_error.is_panic() => {
            std::panic::resume_unwind(join_error.into_panic())
        }
        // Batches are only aborted after a failure has been recorded.
        Err(_) => Ok(()),
    }
}

/// Builds the online row of a source row. Values arrive in the view's declared order.
fn to_feature_row(view: &FeatureView, row: SourceRow) -> Result<FeatureRow> {
    let entity_key = view.entity_key(row.join_values)?;
    let mut feature_row = FeatureRow::new(entity_key, row.event_ts);
    if let Some(created_ts) = row.created_ts {
        feature_row = feature_row.with_created_ts(created_ts);
    }
    for (field, value) in view.features.iter().zip(row.feature_values) {
        let value = value.coerce_to(field.value_type)?;
        feature_row = feature_row.with_value(field.name.clone(), value);
    }
    Ok(feature_row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::key_serialization::serialize_key_with_schema;
    use crate::model::{DataSource, Field, StoredRecord, ValueType};
    use crate::offline_store::memory::{InMemoryOfflineStore, TableRow};
    use crate::onlinestore::OnlineStore;
    use crate::onlinestore::memory::InMemoryOnlineStore;
    use crate::types::Value;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const TABLE: &str = "driver_stats";

    fn view() -> Arc<FeatureView> {
        Arc::new(FeatureView {
            name: "driver_hourly_stats".to_string(),
            entity_names: vec!["driver".to_string()],
            entity_columns: vec![Field::new("driver_id", ValueType::Int64)],
            features: vec![
                Field::new("conv_rate", ValueType::Float),
                Field::new("trips", ValueType::Int32),
            ],
            ttl: chrono::Duration::hours(2),
            source: DataSource {
                table: TABLE.to_string(),
                event_timestamp_column: "event_timestamp".to_string(),
                created_timestamp_column: Some("created".to_string()),
                field_mapping: BTreeMap::from([("avg_trips".to_string(), "trips".to_string())]),
            },
        })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 4, 12, 0, 0, 0).unwrap()
    }

    fn source_row(driver: Value, conv_rate: f64, trips: i64, minutes: i64) -> TableRow {
        let ts = t0() + chrono::Duration::minutes(minutes);
        TableRow::new()
            .with_value("driver_id", driver)
            .with_value("conv_rate", Value::double(conv_rate))
            .with_value("avg_trips", Value::int64(trips))
            .with_timestamp("event_timestamp", ts)
            .with_timestamp("created", ts)
    }

    async fn offline(rows: Vec<TableRow>) -> Arc<InMemoryOfflineStore> {
        let store = Arc::new(InMemoryOfflineStore::new());
        store.append(TABLE, rows).await;
        store
    }

    fn options(batch: usize, concurrency: usize, policy: EncodingErrorPolicy) -> MaterializationOptions {
        MaterializationOptions {
            write_batch_size: batch,
            write_concurrency: concurrency,
            encoding_errors: policy,
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn stored(
        writer: &ConflictResolvingWriter,
        view: &FeatureView,
        driver: i64,
    ) -> anyhow::Result<StoredRecord> {
        let key = serialize_key_with_schema(&view.entity_columns, &[Value::int64(driver)])?;
        writer
            .store()
            .get(view, &key)
            .await?
            .ok_or_else(|| anyhow!("driver {} not materialized", driver))
    }

    #[derive(Default)]
    struct RecordingProgress {
        calls: Mutex<Vec<usize>>,
    }

    impl ProgressSink for RecordingProgress {
        fn rows_submitted(&self, _view: &str, rows: usize) {
            self.calls.lock().unwrap().push(rows);
        }
    }

    #[tokio::test]
    async fn test_materialize_latest_rows() -> anyhow::Result<()> {
        let mut rows = Vec::new();
        for driver in 0..25 {
            rows.push(source_row(Value::int64(driver), 0.1, 1, 10));
            rows.push(source_row(Value::int64(driver), 0.5, driver, 20));
        }
        // outside the window
        rows.push(source_row(Value::int64(3), 0.9, 99, 120));
        let progress = Arc::new(RecordingProgress::default());
        let writer = Arc::new(ConflictResolvingWriter::new(Arc::new(
            InMemoryOnlineStore::new("proj".to_string()),
        )));
        let pipeline = MaterializationPipeline::new(offline(rows).await, writer.clone())
            .with_progress(progress.clone());

        let view = view();
        let report = pipeline
            .run(
                view.clone(),
                t0(),
                t0() + chrono::Duration::hours(1),
                &options(10, 3, EncodingErrorPolicy::Fail),
            )
            .await?;
        assert_eq!(report.rows_read, 25);
        assert_eq!(report.rows_written, 25);
        assert_eq!(report.batches, 3);

        let mut calls = progress.calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![5, 10, 10]);

        let record = stored(&writer, &view, 3).await?;
        assert_eq!(record.values["conv_rate"], Value::float(0.5));
        assert_eq!(record.values["trips"], Value::int32(3));
        assert_eq!(record.event_ts, t0() + chrono::Duration::minutes(20));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_window_completes_without_rows() -> anyhow::Result<()> {
        let writer = Arc::new(ConflictResolvingWriter::new(Arc::new(
            InMemoryOnlineStore::new("proj".to_string()),
        )));
        // no source table at all: an empty window never reaches the offline store
        let pipeline = Arc::new(MaterializationPipeline::new(
            Arc::new(InMemoryOfflineStore::new()),
            writer,
        ));
        let handle = pipeline.materialize(
            "proj",
            view(),
            t0(),
            t0(),
            options(10, 2, EncodingErrorPolicy::Fail),
        )?;
        let output = handle.wait(Some(Duration::from_secs(5))).await?;
        assert_eq!(output.location, "proj_driver_hourly_stats");
        assert_eq!(output.rows_written, Some(0));
        assert!(matches!(handle.status().await?, JobStatus::Completed(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_result_set_is_success() -> anyhow::Result<()> {
        let writer = Arc::new(ConflictResolvingWriter::new(Arc::new(
            InMemoryOnlineStore::new("proj".to_string()),
        )));
        let pipeline = MaterializationPipeline::new(offline(vec![]).await, writer);
        let report = pipeline
            .run(
                view(),
                t0(),
                t0() + chrono::Duration::days(1),
                &options(10, 2, EncodingErrorPolicy::Fail),
            )
            .await?;
        assert_eq!(report, MaterializationReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_inverted_window_is_rejected() {
        let pipeline = Arc::new(MaterializationPipeline::new(
            Arc::new(InMemoryOfflineStore::new()),
            Arc::new(ConflictResolvingWriter::new(Arc::new(InMemoryOnlineStore::new(
                "proj".to_string(),
            )))),
        ));
        let result = pipeline.materialize(
            "proj",
            view(),
            t0() + chrono::Duration::hours(1),
            t0(),
            MaterializationOptions::default(),
        );
        assert!(matches!(result, Err(FeastError::InvalidWindow { .. })));
    }

    #[tokio::test]
    async fn test_encoding_errors_skip_or_fail() -> anyhow::Result<()> {
        let rows = vec![
            source_row(Value::int64(1), 0.2, 4, 5),
            source_row(Value::string("not-a-driver"), 0.3, 4, 5),
            source_row(Value::null(), 0.3, 4, 5),
            source_row(Value::int64(2), 0.4, 4, 5),
        ];
        let window = (t0(), t0() + chrono::Duration::hours(1));

        let writer = Arc::new(ConflictResolvingWriter::new(Arc::new(
            InMemoryOnlineStore::new("proj".to_string()),
        )));
        let pipeline = MaterializationPipeline::new(offline(rows.clone()).await, writer);
        let report = pipeline
            .run(view(), window.0, window.1, &options(2, 2, EncodingErrorPolicy::Skip))
            .await?;
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.rows_skipped, 2);
        assert_eq!(report.rows_written, 2);

        let writer = Arc::new(ConflictResolvingWriter::new(Arc::new(
            InMemoryOnlineStore::new("proj".to_string()),
        )));
        let pipeline = MaterializationPipeline::new(offline(rows).await, writer);
        let err = pipeline
            .run(view(), window.0, window.1, &options(2, 2, EncodingErrorPolicy::Fail))
            .await
            .unwrap_err();
        match err {
            FeastError::Materialization { stage, source, .. } => {
                assert_eq!(stage, "encode");
                assert!(source.is_encoding());
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    struct UnreachableStore;

    #[async_trait]
    impl OnlineStore for UnreachableStore {
        fn backend(&self) -> &'static str {
            "unreachable"
        }

        async fn get(&self, _view: &FeatureView, _entity_key: &[u8]) -> Result<Option<StoredRecord>> {
            Err(FeastError::backend_unavailable("unreachable", anyhow!("connection refused")))
        }

        async fn put(
            &self,
            _view: &FeatureView,
            _entity_key: &[u8],
            _record: &StoredRecord,
        ) -> Result<()> {
            Err(FeastError::backend_unavailable("unreachable", anyhow!("connection refused")))
        }

        async fn update(&self, _keep: &[Arc<FeatureView>], _delete: &[Arc<FeatureView>]) -> Result<()> {
            Ok(())
        }

        async fn teardown(&self, _views: &[Arc<FeatureView>]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_backend_failure_fails_job_with_context() -> anyhow::Result<()> {
        let rows = (0..6)
            .map(|driver| source_row(Value::int64(driver), 0.1, 1, 1))
            .collect();
        let pipeline = Arc::new(MaterializationPipeline::new(
            offline(rows).await,
            Arc::new(ConflictResolvingWriter::new(Arc::new(UnreachableStore))),
        ));
        let err = pipeline
            .run(
                view(),
                t0(),
                t0() + chrono::Duration::hours(1),
                &options(2, 2, EncodingErrorPolicy::Fail),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            FeastError::Materialization { ref stage, batch_index: Some(_), .. } if stage == "write"
        ));

        let handle = pipeline.materialize(
            "proj",
            view(),
            t0(),
            t0() + chrono::Duration::hours(1),
            options(2, 2, EncodingErrorPolicy::Fail),
        )?;
        match handle.wait(Some(Duration::from_secs(5))).await {
            Err(FeastError::JobExecution { cause, .. }) => {
                assert!(cause.contains("connection refused"), "{}", cause)
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_table_fails_read_stage() {
        let pipeline = MaterializationPipeline::new(
            Arc::new(InMemoryOfflineStore::new()),
            Arc::new(ConflictResolvingWriter::new(Arc::new(InMemoryOnlineStore::new(
                "proj".to_string(),
            )))),
        );
        let err = pipeline
            .run(
                view(),
                t0(),
                t0() + chrono::Duration::hours(1),
                &MaterializationOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FeastError::Materialization { ref stage, .. } if stage == "read"));
    }
}
