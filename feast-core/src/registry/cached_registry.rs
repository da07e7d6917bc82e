use crate::error::Result;
use crate::model::{Entity, FeatureView};
use crate::registry::FeatureRegistryService;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type RegistryLoader = Arc<dyn Fn() -> Result<Arc<dyn FeatureRegistryService>> + Send + Sync>;

/// Registry that is reloaded in the background every `ttl`. Readers always see a complete
/// snapshot; a failed reload keeps the previous one.
pub struct CachedRegistry {
    project: String,
    inner: Arc<ArcSwap<Arc<dyn FeatureRegistryService>>>,
    refresh_task: JoinHandle<()>,
}

impl CachedRegistry {
    pub fn create_cached_registry_and_start_background_task(
        loader: RegistryLoader,
        ttl: Duration,
    ) -> Result<Self> {
        let feature_registry = loader()?;
        let project = feature_registry.project().to_string();
        let inner = Arc::new(ArcSwap::new(Arc::new(feature_registry)));
        let refresh_task = Self::start_refresh_task(inner.clone(), loader, ttl);
        Ok(Self {
            project,
            inner,
            refresh_task,
        })
    }

    fn start_refresh_task(
        inner: Arc<ArcSwap<Arc<dyn FeatureRegistryService>>>,
        loader: RegistryLoader,
        ttl: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                match loader() {
                    Ok(new_registry) => {
                        inner.store(Arc::new(new_registry));
                        debug!("Registry reloaded");
                    }
                    Err(err) => warn!("Registry reload failed, keeping previous: {}", err),
                }
            }
        })
    }
}

impl Drop for CachedRegistry {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

#[async_trait]
impl FeatureRegistryService for CachedRegistry {
    fn project(&self) -> &str {
        &self.project
    }

    async fn get_entity(&self, name: &str) -> Result<Entity> {
        let registry = self.inner.load_full();
        registry.get_entity(name).await
    }

    async fn get_feature_view(&self, name: &str) -> Result<Arc<FeatureView>> {
        let registry = self.inner.load_full();
        registry.get_feature_view(name).await
    }

    async fn list_feature_views(&self) -> Result<Vec<Arc<FeatureView>>> {
        let registry = self.inner.load_full();
        registry.list_feature_views().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FileFeatureRegistry;
    use tempfile::TempDir;

    const V1: &str = r#"
entities:
  - {name: driver, join_key: driver_id, value_type: INT64}
feature_views:
  - name: driver_stats
    entities: [driver]
    features:
      - {name: conv_rate, value_type: FLOAT}
    source: {table: driver_stats, event_timestamp_column: ts}
"#;

    #[tokio::test(start_paused = true)]
    async fn reloads_after_ttl_and_survives_bad_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("registry.yaml");
        std::fs::write(&path, V1)?;
        let path_str = path.to_string_lossy().into_owned();
        let loader: RegistryLoader = Arc::new(move || {
            FileFeatureRegistry::from_path("proj", &path_str)
                .map(|r| Arc::new(r) as Arc<dyn FeatureRegistryService>)
        });
        let registry = CachedRegistry::create_cached_registry_and_start_background_task(
            loader,
            Duration::from_secs(10),
        )?;
        assert_eq!(registry.project(), "proj");
        assert_eq!(registry.list_feature_views().await?.len(), 1);

        std::fs::write(&path, V1.replace("driver_stats\n    entities", "driver_stats_v2\n    entities"))?;
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(registry.get_feature_view("driver_stats_v2").await.is_ok());

        std::fs::write(&path, "feature_views: [")?;
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert!(registry.get_feature_view("driver_stats_v2").await.is_ok());
        Ok(())
    }
}
