use crate::error::Result;
use crate::model::{FeatureView, StoredRecord};
use crate::onlinestore::OnlineStore;
use async_trait::async_trait;
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type Table = HashMap<Vec<u8>, StoredRecord>;

/// Online store keeping one hash map per feature view table. Never unavailable.
pub struct InMemoryOnlineStore {
    project: String,
    tables: RwLock<HashMap<String, Table>>,
}

impl InMemoryOnlineStore {
    pub fn new(project: String) -> Self {
        Self {
            project,
            tables: RwLock::new(HashMap::default()),
        }
    }

    pub async fn record_count(&self, view: &FeatureView) -> usize {
        self.tables
            .read()
            .await
            .get(&view.table_id(&self.project))
            .map_or(0, |table| table.len())
    }
}

#[async_trait]
impl OnlineStore for InMemoryOnlineStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, view: &FeatureView, entity_key: &[u8]) -> Result<Option<StoredRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&view.table_id(&self.project))
            .and_then(|table| table.get(entity_key))
            .cloned())
    }

    async fn put(
        &self,
        view: &FeatureView,
        entity_key: &[u8],
        record: &StoredRecord,
    ) -> Result<()> {
        self.tables
            .write()
            .await
            .entry(view.table_id(&self.project))
            .or_default()
            .insert(entity_key.to_vec(), record.clone());
        Ok(())
    }

    async fn update(&self, keep: &[Arc<FeatureView>], delete: &[Arc<FeatureView>]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for view in delete {
            tables.remove(&view.table_id(&self.project));
        }
        for view in keep {
            tables.entry(view.table_id(&self.project)).or_default();
        }
        Ok(())
    }

    async fn teardown(&self, views: &[Arc<FeatureView>]) -> Result<()> {
        self.update(&[], views).await
    }
}
