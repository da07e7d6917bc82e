use crate::error::{FeastError, Result};
use crate::model::{FeatureView, StoredRecord};
use crate::onlinestore::OnlineStore;
use crate::types::Value;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use prost::Message;
use rustc_hash::FxHashSet as HashSet;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const BACKEND: &str = "sqlite";

/// Row that marks a record as present even when its feature map is empty.
const RECORD_MARKER: &str = "";

/// Transient failures are absorbed by the pool acquire timeout and the SQLite busy timeout;
/// once those expire the write fails as unavailable.
pub struct ConnectionOptions {
    max_connections: u32,
    min_connections: u32,
    acquire_timeout: Duration,
    idle_timeout: Duration,
    busy_timeout: Duration,
    test_before_acquire: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::seconds(5),
            idle_timeout: Duration::seconds(600),
            busy_timeout: Duration::seconds(5),
            test_before_acquire: true,
        }
    }
}

fn unavailable(err: impl Into<anyhow::Error>) -> FeastError {
    FeastError::backend_unavailable(BACKEND, err)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug)]
struct SqliteStoreRow {
    feature_name: String,
    value: Option<Vec<u8>>,
    event_ts: DateTime<Utc>,
    created_ts: DateTime<Utc>,
}

impl FromRow<'_, SqliteRow> for SqliteStoreRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            feature_name: row.try_get("feature_name")?,
            value: row.try_get("value")?,
            event_ts: row.try_get("event_ts")?,
            created_ts: row.try_get("created_ts")?,
        })
    }
}

fn rows_to_record(view: &FeatureView, rows: Vec<SqliteStoreRow>) -> Result<Option<StoredRecord>> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };
    let mut record = StoredRecord {
        event_ts: first.event_ts,
        created_ts: first.created_ts,
        values: BTreeMap::new(),
    };
    for row in rows {
        if row.feature_name == RECORD_MARKER {
            continue;
        }
        let value = match row.value {
            Some(bytes) => Value::decode(bytes.as_slice()).map_err(|e| {
                FeastError::encoding(format!(
                    "Failed to decode value for feature {}:{}: {}",
                    view.name, row.feature_name, e
                ))
            })?,
            None => Value::null(),
        };
        record.values.insert(row.feature_name, value);
    }
    Ok(Some(record))
}

pub struct SqliteOnlineStore {
    project: String,
    connection_pool: Pool<Sqlite>,
    known_tables: RwLock<HashSet<String>>,
}

impl SqliteOnlineStore {
    pub async fn from_options(
        path: &str,
        project: String,
        connection_options: ConnectionOptions,
    ) -> Result<Self> {
        let to_std = |d: Duration| d.to_std().unwrap_or(std::time::Duration::ZERO);
        let connect_options = SqliteConnectOptions::from_str(path)
            .with_context(|| format!("Invalid SQLite path {}", path))
            .map_err(unavailable)?
            .create_if_missing(true)
            .busy_timeout(to_std(connection_options.busy_timeout));
        let pool = SqlitePoolOptions::new()
            .max_connections(connection_options.max_connections)
            .min_connections(connection_options.min_connections)
            .acquire_timeout(to_std(connection_options.acquire_timeout))
            .idle_timeout(to_std(connection_options.idle_timeout))
            .test_before_acquire(connection_options.test_before_acquire)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("Failed to open online store {}", path))
            .map_err(unavailable)?;
        Ok(Self {
            project,
            connection_pool: pool,
            known_tables: RwLock::new(HashSet::default()),
        })
    }

    async fn ensure_table(&self, table_name: &str) -> Result<()> {
        if self.known_tables.read().await.contains(table_name) {
            return Ok(());
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (entity_key BLOB NOT NULL, feature_name TEXT NOT NULL, \
             value BLOB, event_ts TIMESTAMP NOT NULL, created_ts TIMESTAMP NOT NULL, \
             PRIMARY KEY (entity_key, feature_name))",
            quote_identifier(table_name)
        );
        sqlx::query(&ddl)
            .execute(&self.connection_pool)
            .await
            .with_context(|| format!("Failed to create table {}", table_name))
            .map_err(unavailable)?;
        debug!("Created online table {}", table_name);
        self.known_tables
            .write()
            .await
            .insert(table_name.to_string());
        Ok(())
    }

    async fn drop_table(&self, table_name: &str) -> Result<()> {
        let ddl = format!("DROP TABLE IF EXISTS {}", quote_identifier(table_name));
        sqlx::query(&ddl)
            .execute(&self.connection_pool)
            .await
            .with_context(|| format!("Failed to drop table {}", table_name))
            .map_err(unavailable)?;
        self.known_tables.write().await.remove(table_name);
        debug!("Dropped online table {}", table_name);
        Ok(())
    }
}

#[async_trait]
impl OnlineStore for SqliteOnlineStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, view: &FeatureView, entity_key: &[u8]) -> Result<Option<StoredRecord>> {
        let table_name = view.table_id(&self.project);
        let query = format!(
            "SELECT feature_name, value, event_ts, created_ts FROM {} WHERE entity_key = ?",
            quote_identifier(&table_name)
        );
        let rows: Vec<SqliteStoreRow> = match sqlx::query_as(&query)
            .bind(entity_key)
            .fetch_all(&self.connection_pool)
            .await
        {
            Ok(rows) => rows,
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("no such table") => {
                return Ok(None);
            }
            Err(err) => {
                return Err(unavailable(
                    anyhow::Error::new(err).context(format!("Failed to read {}", table_name)),
                ));
            }
        };
        rows_to_record(view, rows)
    }

    async fn put(
        &self,
        view: &FeatureView,
        entity_key: &[u8],
        record: &StoredRecord,
    ) -> Result<()> {
        let table_name = view.table_id(&self.project);
        self.ensure_table(&table_name).await?;
        let table = quote_identifier(&table_name);
        let delete = format!("DELETE FROM {} WHERE entity_key = ?", table);
        let insert = format!(
            "INSERT INTO {} (entity_key, feature_name, value, event_ts, created_ts) \
             VALUES (?, ?, ?, ?, ?)",
            table
        );

        let mut tx = self.connection_pool.begin().await.map_err(unavailable)?;
        sqlx::query(&delete)
            .bind(entity_key)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        sqlx::query(&insert)
            .bind(entity_key)
            .bind(RECORD_MARKER)
            .bind(None::<Vec<u8>>)
            .bind(record.event_ts)
            .bind(record.created_ts)
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        for (feature_name, value) in &record.values {
            sqlx::query(&insert)
                .bind(entity_key)
                .bind(feature_name)
                .bind(value.encode_to_vec())
                .bind(record.event_ts)
                .bind(record.created_ts)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }
        tx.commit()
            .await
            .with_context(|| format!("Failed to commit write to {}", table_name))
            .map_err(unavailable)?;
        Ok(())
    }

    async fn update(&self, keep: &[Arc<FeatureView>], delete: &[Arc<FeatureView>]) -> Result<()> {
        for view in keep {
            self.ensure_table(&view.table_id(&self.project)).await?;
        }
        for view in delete {
            self.drop_table(&view.table_id(&self.project)).await?;
        }
        Ok(())
    }

    async fn teardown(&self, views: &[Arc<FeatureView>]) -> Result<()> {
        for view in views {
            self.drop_table(&view.table_id(&self.project)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{DataSource, Field, ValueType};
    use chrono::TimeZone;

    fn driver_view() -> FeatureView {
        FeatureView {
            name: "driver_hourly_stats".to_string(),
            entity_names: vec!["driver".to_string()],
            entity_columns: vec![Field::new("driver_id", ValueType::Int64)],
            features: vec![
                Field::new("conv_rate", ValueType::Float),
                Field::new("city", ValueType::String),
            ],
            ttl: Duration::zero(),
            source: DataSource::default(),
        }
    }

    async fn temp_store(dir: &tempfile::TempDir) -> Result<SqliteOnlineStore> {
        let path = dir.path().join("online_store.db");
        SqliteOnlineStore::from_options(
            &path.to_string_lossy(),
            "golden_hornet".to_string(),
            ConnectionOptions::default(),
        )
        .await
    }

    #[tokio::test]
    async fn read_sqlite_trait() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store: Box<dyn OnlineStore> = Box::new(temp_store(&dir).await?);
        let view = driver_view();
        let key = b"driver-1005".to_vec();

        // no table yet
        assert!(store.get(&view, &key).await?.is_none());

        let t = Utc.with_ymd_and_hms(2021, 4, 12, 10, 0, 0).unwrap();
        let record = StoredRecord {
            event_ts: t,
            created_ts: t + Duration::seconds(1),
            values: BTreeMap::from([
                ("conv_rate".to_string(), Value::float(0.5)),
                ("city".to_string(), Value::string("sf")),
            ]),
        };
        store.put(&view, &key, &record).await?;
        assert_eq!(store.get(&view, &key).await?, Some(record.clone()));

        let replacement = StoredRecord {
            event_ts: t + Duration::hours(1),
            created_ts: t,
            values: BTreeMap::from([("conv_rate".to_string(), Value::float(0.9))]),
        };
        store.put(&view, &key, &replacement).await?;
        let stored = store.get(&view, &key).await?.expect("record present");
        assert_eq!(stored, replacement);
        assert!(!stored.values.contains_key("city"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_feature_map_is_still_a_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = temp_store(&dir).await?;
        let view = driver_view();
        let now = Utc::now();
        let record = StoredRecord {
            event_ts: now,
            created_ts: now,
            values: BTreeMap::new(),
        };
        store.put(&view, b"k", &record).await?;
        assert_eq!(store.get(&view, b"k").await?, Some(record));
        Ok(())
    }

    #[tokio::test]
    async fn teardown_drops_tables() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = temp_store(&dir).await?;
        let view = Arc::new(driver_view());
        store.update(&[view.clone()], &[]).await?;
        let now = Utc::now();
        let record = StoredRecord {
            event_ts: now,
            created_ts: now,
            values: BTreeMap::from([("city".to_string(), Value::null())]),
        };
        store.put(&view, b"k", &record).await?;
        store.teardown(&[view.clone()]).await?;
        assert!(store.get(&view, b"k").await?.is_none());
        // writes after teardown recreate the table
        store.put(&view, b"k", &record).await?;
        assert_eq!(store.get(&view, b"k").await?, Some(record));
        Ok(())
    }
}
