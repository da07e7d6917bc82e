//! Offline (batch) sources that materialization reads from.

pub mod memory;
pub mod pull_latest;
pub mod sqlite_offline_store;

pub use pull_latest::{PullLatestQuery, PullLatestQueryBuilder, SourceRow, select_latest};

use crate::config::OfflineStoreConfig;
use crate::error::Result;
use crate::offline_store::memory::InMemoryOfflineStore;
use crate::offline_store::sqlite_offline_store::SqliteOfflineStore;
use crate::util::resolve_path;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[async_trait]
pub trait OfflineStore: Send + Sync + 'static {
    /// Streams the rows selected by `query` into `sink` and returns how many were sent.
    /// Result cursors are drained by this single producer; a closed receiver ends the stream.
    async fn pull_latest(
        &self,
        query: &PullLatestQuery,
        sink: mpsc::Sender<SourceRow>,
    ) -> Result<u64>;
}

pub async fn get_offline_store(
    offline_store_config: &OfflineStoreConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn OfflineStore>> {
    match offline_store_config {
        OfflineStoreConfig::Sqlite { path } => {
            let full_path = resolve_path(cwd, path);
            debug!("Create SQLite offline store with path: {}", full_path);
            SqliteOfflineStore::connect(&full_path)
                .await
                .map(|sqlite| Arc::new(sqlite) as Arc<dyn OfflineStore>)
        }
        OfflineStoreConfig::Memory => {
            debug!("Create in-memory offline store");
            Ok(Arc::new(InMemoryOfflineStore::new()))
        }
    }
}
