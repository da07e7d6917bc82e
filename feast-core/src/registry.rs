//! Registry of entities and feature views of a project.

use crate::error::Result;
use crate::model::{Entity, FeatureView};
use async_trait::async_trait;
use std::sync::Arc;

mod cached_registry;
mod feature_registry;
pub mod file_registry;

pub use cached_registry::CachedRegistry;
pub use feature_registry::get_registry;
pub use file_registry::FileFeatureRegistry;

#[async_trait]
pub trait FeatureRegistryService: Send + Sync {
    fn project(&self) -> &str;

    async fn get_entity(&self, name: &str) -> Result<Entity>;

    /// Feature view with its join keys resolved in canonical order.
    async fn get_feature_view(&self, name: &str) -> Result<Arc<FeatureView>>;

    /// All feature views, ordered by name.
    async fn list_feature_views(&self) -> Result<Vec<Arc<FeatureView>>>;
}
