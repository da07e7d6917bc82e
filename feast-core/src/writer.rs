//! Online store write path with last-write-wins by business time.
//!
//! A row replaces the stored record of its entity key only when its `(event_ts, created_ts)`
//! pair is strictly greater than the stored one; anything else is discarded without error.
//! Reads and writes of one key are serialized through a striped lock table, so a record is
//! never replaced based on a stale read. Distinct keys are written concurrently.

use crate::error::{FeastError, Result};
use crate::key_serialization::serialize_key_with_schema;
use crate::model::{FeatureRow, FeatureView, RecordVersion, StoredRecord};
use crate::onlinestore::OnlineStore;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use rustc_hash::{FxHashMap as HashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_LOCK_STRIPES: usize = 256;
pub const DEFAULT_FLUSH_SIZE: usize = 500;
pub const DEFAULT_KEY_CONCURRENCY: usize = 16;

/// Called after every flushed chunk with the number of rows it contained.
pub type ProgressFn<'a> = &'a (dyn Fn(usize) + Send + Sync);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows_processed: u64,
    /// Rows whose values are now the stored record.
    pub rows_written: u64,
    /// Rows that lost against the stored record or a newer row of the same batch.
    pub rows_discarded: u64,
}

impl AddAssign for WriteSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.rows_processed += rhs.rows_processed;
        self.rows_written += rhs.rows_written;
        self.rows_discarded += rhs.rows_discarded;
    }
}

struct PendingRow {
    version: RecordVersion,
    row: FeatureRow,
}

pub struct ConflictResolvingWriter {
    store: Arc<dyn OnlineStore>,
    locks: Vec<Mutex<()>>,
    flush_size: usize,
    key_concurrency: usize,
}

impl ConflictResolvingWriter {
    pub fn new(store: Arc<dyn OnlineStore>) -> Self {
        Self::with_options(store, DEFAULT_LOCK_STRIPES, DEFAULT_FLUSH_SIZE, DEFAULT_KEY_CONCURRENCY)
    }

    pub fn with_options(
        store: Arc<dyn OnlineStore>,
        lock_stripes: usize,
        flush_size: usize,
        key_concurrency: usize,
    ) -> Self {
        Self {
            store,
            locks: (0..lock_stripes.max(1)).map(|_| Mutex::new(())).collect(),
            flush_size: flush_size.max(1),
            key_concurrency: key_concurrency.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn OnlineStore> {
        &self.store
    }

    fn lock_for(&self, view: &FeatureView, key: &[u8]) -> &Mutex<()> {
        let mut hasher = FxHasher::default();
        view.name.hash(&mut hasher);
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % self.locks.len() as u64) as usize;
        &self.locks[stripe]
    }

    fn encode_row(view: &FeatureView, row: &FeatureRow) -> Result<Vec<u8>> {
        view.check_entity_key(&row.entity_key)?;
        if let Some(unknown) = row.values.keys().find(|name| view.feature(name).is_none()) {
            return Err(FeastError::FeatureNotFound {
                feature: unknown.clone(),
                view: view.name.clone(),
            });
        }
        serialize_key_with_schema(&view.entity_columns, &row.entity_key.entity_values)
    }

    /// Applies `rows` to the online table of `view`.
    ///
    /// Every row is validated and encoded before anything is written, so a malformed row fails
    /// the batch without side effects. A store failure fails the whole batch; some keys may
    /// already be written at that point, and resubmitting the batch is safe because applying a
    /// row twice has the same effect as applying it once.
    pub async fn write_batch(
        &self,
        view: &FeatureView,
        rows: Vec<FeatureRow>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<WriteSummary> {
        let now = Utc::now();
        let keyed = rows
            .into_iter()
            .map(|row| Ok((Self::encode_row(view, &row)?, row)))
            .collect::<Result<Vec<(Vec<u8>, FeatureRow)>>>()?;

        let mut summary = WriteSummary::default();
        let mut keyed = keyed.into_iter().peekable();
        while keyed.peek().is_some() {
            let chunk: Vec<(Vec<u8>, FeatureRow)> = keyed.by_ref().take(self.flush_size).collect();
            let chunk_len = chunk.len();
            let chunk_summary = self.write_chunk(view, chunk, now).await?;
            debug!(
                "Flushed {} rows to {} ({} written, {} discarded)",
                chunk_len, view.name, chunk_summary.rows_written, chunk_summary.rows_discarded
            );
            summary += chunk_summary;
            if let Some(progress) = progress {
                progress(chunk_len);
            }
        }
        Ok(summary)
    }

    async fn write_chunk(
        &self,
        view: &FeatureView,
        chunk: Vec<(Vec<u8>, FeatureRow)>,
        now: DateTime<Utc>,
    ) -> Result<WriteSummary> {
        // Group by key keeping first-seen order; rows of one key are resolved together.
        let mut index: HashMap<Vec<u8>, usize> = HashMap::default();
        let mut groups: Vec<(Vec<u8>, Vec<PendingRow>)> = Vec::new();
        for (key, row) in chunk {
            let pending = PendingRow {
                version: RecordVersion::new(row.event_ts, row.created_ts.unwrap_or(now)),
                row,
            };
            match index.get(&key) {
                Some(&i) => groups[i].1.push(pending),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![pending]));
                }
            }
        }

        stream::iter(groups)
            .map(|(key, rows)| self.write_key(view, key, rows))
            .buffer_unordered(self.key_concurrency)
            .try_fold(WriteSummary::default(), |mut acc, s| async move {
                acc += s;
                Ok(acc)
            })
            .await
    }

    async fn write_key(
        &self,
        view: &FeatureView,
        key: Vec<u8>,
        rows: Vec<PendingRow>,
    ) -> Result<WriteSummary> {
        let rows_processed = rows.len() as u64;
        // Applying rows one after another keeps the greatest version, first occurrence on ties.
        let mut best: Option<PendingRow> = None;
        for row in rows {
            if row
                .version
                .supersedes(best.as_ref().map(|b| &b.version))
            {
                best = Some(row);
            }
        }
        let Some(best) = best else {
            return Ok(WriteSummary::default());
        };

        let _guard = self.lock_for(view, &key).lock().await;
        let stored = self.store.get(view, &key).await?;
        let stored_version = stored.as_ref().map(StoredRecord::version);
        let rows_written = if best.version.supersedes(stored_version.as_ref()) {
            let record = StoredRecord {
                event_ts: best.version.event_ts,
                created_ts: best.version.created_ts,
                values: best.row.values,
            };
            self.store.put(view, &key, &record).await?;
            1
        } else {
            0
        };
        Ok(WriteSummary {
            rows_processed,
            rows_written,
            rows_discarded: rows_processed - rows_written,
        })
    }

    /// Reads the stored records of the given entity keys, in order.
    pub async fn read(&self, view: &FeatureView, keys: &[Vec<u8>]) -> Result<Vec<Option<StoredRecord>>> {
        stream::iter(keys)
            .map(|key| self.store.get(view, key))
            .buffered(self.key_concurrency)
            .try_collect()
            .await
    }
}
