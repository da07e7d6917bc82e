use crate::error::{FeastError, Result};
use crate::offline_store::OfflineStore;
use crate::offline_store::pull_latest::{PullLatestQuery, SourceRow, select_latest};
use crate::types::Value;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// A row of an in-memory source table. Timestamp columns are kept apart from value columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRow {
    pub values: BTreeMap<String, Value>,
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
}

impl TableRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    pub fn with_timestamp(mut self, column: impl Into<String>, ts: DateTime<Utc>) -> Self {
        self.timestamps.insert(column.into(), ts);
        self
    }

    fn project(&self, query: &PullLatestQuery) -> Result<SourceRow> {
        let value = |column: &String| self.values.get(column).cloned().unwrap_or_default();
        let event_ts = self
            .timestamps
            .get(&query.event_timestamp_column)
            .copied()
            .ok_or_else(|| {
                FeastError::offline_store(anyhow!(
                    "row of table {} has no event timestamp column {}",
                    query.table,
                    query.event_timestamp_column
                ))
            })?;
        let created_ts = query
            .created_timestamp_column
            .as_ref()
            .and_then(|column| self.timestamps.get(column).copied());
        Ok(SourceRow {
            join_values: query.join_key_columns.iter().map(value).collect(),
            feature_values: query.feature_columns.iter().map(value).collect(),
            event_ts,
            created_ts,
        })
    }
}

/// Offline source holding whole tables in memory. Used for tests and local ingestion.
#[derive(Debug, Default)]
pub struct InMemoryOfflineStore {
    tables: RwLock<HashMap<String, Vec<TableRow>>>,
}

impl InMemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, table: &str, rows: impl IntoIterator<Item = TableRow>) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }
}

#[async_trait]
impl OfflineStore for InMemoryOfflineStore {
    async fn pull_latest(
        &self,
        query: &PullLatestQuery,
        sink: mpsc::Sender<SourceRow>,
    ) -> Result<u64> {
        let projected = {
            let tables = self.tables.read().await;
            let Some(rows) = tables.get(&query.table) else {
                return Err(FeastError::offline_store(anyhow!(
                    "table {} does not exist",
                    query.table
                )));
            };
            rows.iter()
                .map(|row| row.project(query))
                .collect::<Result<Vec<SourceRow>>>()?
        };
        let mut sent = 0;
        for row in select_latest(query, projected) {
            if sink.send(row).await.is_err() {
                debug!("Receiver for table {} closed early", query.table);
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }
}
