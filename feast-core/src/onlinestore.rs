pub mod memory;
mod redis;
pub mod sqlite_onlinestore;

use crate::config::OnlineStoreConfig;
use crate::error::Result;
use crate::model::{FeatureView, StoredRecord};
use crate::onlinestore::memory::InMemoryOnlineStore;
use crate::onlinestore::sqlite_onlinestore::{ConnectionOptions, SqliteOnlineStore};
use crate::util::resolve_path;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Key/value contract every online backend satisfies. Keys are canonical entity key bytes and
/// records are replaced whole, never merged per feature.
///
/// Backends retry transient failures on their own (see each backend) and report exhaustion as
/// `FeastError::BackendUnavailable`.
#[async_trait]
pub trait OnlineStore: Send + Sync + 'static {
    /// Short backend name used in errors and logs.
    fn backend(&self) -> &'static str;

    async fn get(&self, view: &FeatureView, entity_key: &[u8]) -> Result<Option<StoredRecord>>;

    /// Atomically replaces the record stored under `entity_key`. Readers observe either the old
    /// or the new record.
    async fn put(&self, view: &FeatureView, entity_key: &[u8], record: &StoredRecord)
    -> Result<()>;

    /// Creates storage for `keep` and drops storage of `delete`.
    async fn update(&self, keep: &[Arc<FeatureView>], delete: &[Arc<FeatureView>]) -> Result<()>;

    async fn teardown(&self, views: &[Arc<FeatureView>]) -> Result<()>;
}

pub async fn get_online_store(
    online_store_config: &OnlineStoreConfig,
    project: &str,
    cwd: Option<&str>,
) -> Result<Arc<dyn OnlineStore>> {
    match online_store_config {
        OnlineStoreConfig::Sqlite { path } => {
            let full_path = resolve_path(cwd, path);
            debug!("Create SQLite online store with path: {}", full_path);
            SqliteOnlineStore::from_options(
                &full_path,
                project.to_owned(),
                ConnectionOptions::default(),
            )
            .await
            .map(|sqlite| Arc::new(sqlite) as Arc<dyn OnlineStore>)
        }
        OnlineStoreConfig::Redis {
            redis_type,
            connection_string,
        } => {
            debug!("Create Redis online store");
            redis::new(project.to_owned(), redis_type.clone(), connection_string).await
        }
        OnlineStoreConfig::Memory => {
            debug!("Create in-memory online store");
            Ok(Arc::new(InMemoryOnlineStore::new(project.to_owned())))
        }
    }
}
