use crate::error::{FeastError, Result};
use crate::offline_store::OfflineStore;
use crate::offline_store::pull_latest::{PullLatestQuery, SourceRow};
use crate::types::Value;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::debug;

/// Offline source backed by a SQLite database. Timestamp columns may hold RFC 3339 text or
/// integer unix seconds. Both are compared and ordered as epoch seconds.
pub struct SqliteOfflineStore {
    pool: Pool<Sqlite>,
}

impl SqliteOfflineStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)
            .with_context(|| format!("Invalid SQLite path {}", path))
            .map_err(FeastError::offline_store)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open offline store {}", path))
            .map_err(FeastError::offline_store)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

fn epoch_seconds_sql(column: &str) -> String {
    format!(
        "(CASE typeof({c}) WHEN 'integer' THEN {c} ELSE unixepoch({c}, 'subsec') END)",
        c = column
    )
}

fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

fn column_value(row: &SqliteRow, index: usize) -> anyhow::Result<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::null());
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "INTEGER" => Value::int64(row.try_get::<i64, _>(index)?),
        "REAL" => Value::double(row.try_get::<f64, _>(index)?),
        "TEXT" => Value::string(row.try_get::<String, _>(index)?),
        "BLOB" => Value::bytes(row.try_get::<Vec<u8>, _>(index)?),
        other => return Err(anyhow!("unsupported SQLite value type {}", other)),
    };
    Ok(value)
}

fn decode_row(row: &SqliteRow, query: &PullLatestQuery) -> anyhow::Result<SourceRow> {
    let join_count = query.join_key_columns.len();
    let feature_count = query.feature_columns.len();
    let join_values = (0..join_count)
        .map(|i| column_value(row, i))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let feature_values = (join_count..join_count + feature_count)
        .map(|i| column_value(row, i))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let event_index = join_count + feature_count;
    let event_ts: DateTime<Utc> = row
        .try_get(event_index)
        .with_context(|| format!("Bad event timestamp in {}", query.event_timestamp_column))?;
    let created_ts: Option<DateTime<Utc>> = match &query.created_timestamp_column {
        Some(column) => row
            .try_get(event_index + 1)
            .with_context(|| format!("Bad created timestamp in {}", column))?,
        None => None,
    };
    Ok(SourceRow {
        join_values,
        feature_values,
        event_ts,
        created_ts,
    })
}

#[async_trait]
impl OfflineStore for SqliteOfflineStore {
    async fn pull_latest(
        &self,
        query: &PullLatestQuery,
        sink: mpsc::Sender<SourceRow>,
    ) -> Result<u64> {
        let sql = query.to_sql_with(Some("rowid"), epoch_seconds_sql);
        debug!("Pull latest from {}: {}", query.table, sql);
        let mut rows = sqlx::query(&sql)
            .bind(epoch_seconds(query.start))
            .bind(epoch_seconds(query.end))
            .fetch(&self.pool);
        let mut sent = 0;
        while let Some(row) = rows
            .try_next()
            .await
            .with_context(|| format!("Failed to query table {}", query.table))
            .map_err(FeastError::offline_store)?
        {
            let row = decode_row(&row, query).map_err(FeastError::offline_store)?;
            if sink.send(row).await.is_err() {
                debug!("Receiver for table {} closed early", query.table);
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }
}
