use crate::config::RegistryConfig;
use crate::error::Result;
use crate::registry::cached_registry::{CachedRegistry, RegistryLoader};
use crate::registry::{FeatureRegistryService, FileFeatureRegistry};
use crate::util::resolve_path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub async fn get_registry(
    conf: &RegistryConfig,
    project: &str,
    cwd: Option<&str>,
) -> Result<Arc<dyn FeatureRegistryService>> {
    let path = resolve_path(cwd, &conf.path);
    match conf.cache_ttl_seconds {
        Some(ttl) if ttl > 0 => {
            debug!("Create cached file registry {} with ttl {}s", path, ttl);
            let project = project.to_string();
            let loader: RegistryLoader = Arc::new(move || {
                FileFeatureRegistry::from_path(project.clone(), &path)
                    .map(|registry| Arc::new(registry) as Arc<dyn FeatureRegistryService>)
            });
            let registry = CachedRegistry::create_cached_registry_and_start_background_task(
                loader,
                Duration::from_secs(ttl),
            )?;
            Ok(Arc::new(registry))
        }
        _ => {
            debug!("Create file registry {}", path);
            Ok(Arc::new(FileFeatureRegistry::from_path(project, &path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relative_registry_path_resolves_against_repo() -> anyhow::Result<()> {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        let conf = RegistryConfig {
            path: "test_data/registry.yaml".to_string(),
            cache_ttl_seconds: Some(60),
        };
        let registry = get_registry(&conf, "driver_ranking", Some(project_dir)).await?;
        assert_eq!(registry.project(), "driver_ranking");
        assert_eq!(registry.list_feature_views().await?.len(), 2);
        Ok(())
    }
}
