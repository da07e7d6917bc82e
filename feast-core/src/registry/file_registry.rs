use crate::error::{FeastError, Result};
use crate::model::{DataSource, Entity, FeatureView, Field};
use crate::registry::FeatureRegistryService;
use crate::util::read_file_to_bytes;
use async_trait::async_trait;
use rustc_hash::FxHashMap as HashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RegistryDef {
    #[serde(default)]
    entities: Vec<Entity>,
    #[serde(default)]
    feature_views: Vec<FeatureViewDef>,
}

#[derive(Debug, Deserialize)]
struct FeatureViewDef {
    name: String,
    #[serde(default)]
    entities: Vec<String>,
    features: Vec<Field>,
    #[serde(default)]
    ttl_seconds: i64,
    source: DataSource,
}

/// Registry loaded from a YAML document listing entities and feature views.
#[derive(Debug)]
pub struct FileFeatureRegistry {
    project: String,
    entities: HashMap<String, Entity>,
    feature_views: BTreeMap<String, Arc<FeatureView>>,
}

impl FileFeatureRegistry {
    pub fn from_path(project: impl Into<String>, registry_file_path: &str) -> Result<Self> {
        let bytes = read_file_to_bytes(registry_file_path)
            .map_err(|err| FeastError::config(format!("{:#}", err)))?;
        let yaml = String::from_utf8(bytes).map_err(|err| {
            FeastError::config(format!("Registry {} is not UTF-8: {}", registry_file_path, err))
        })?;
        debug!("Loading registry from {}", registry_file_path);
        Self::from_yaml_str(project, &yaml)
    }

    pub fn from_yaml_str(project: impl Into<String>, yaml: &str) -> Result<Self> {
        let project = project.into();
        let definition: RegistryDef = if yaml.trim().is_empty() {
            RegistryDef {
                entities: vec![],
                feature_views: vec![],
            }
        } else {
            serde_saphyr::from_str(yaml)
                .map_err(|err| FeastError::config(format!("Invalid registry: {}", err)))?
        };

        let mut entities = HashMap::default();
        for entity in definition.entities {
            if entities.contains_key(&entity.name) {
                return Err(FeastError::config(format!(
                    "Entity {} is defined twice",
                    entity.name
                )));
            }
            entities.insert(entity.name.clone(), entity);
        }

        let mut feature_views = BTreeMap::new();
        for view in definition.feature_views {
            let view = Self::resolve_view(&project, &entities, view)?;
            if feature_views.contains_key(&view.name) {
                return Err(FeastError::config(format!(
                    "Feature view {} is defined twice",
                    view.name
                )));
            }
            feature_views.insert(view.name.clone(), Arc::new(view));
        }
        Ok(Self {
            project,
            entities,
            feature_views,
        })
    }

    fn resolve_view(
        project: &str,
        entities: &HashMap<String, Entity>,
        view: FeatureViewDef,
    ) -> Result<FeatureView> {
        let entity_columns = view
            .entities
            .iter()
            .map(|name| {
                entities
                    .get(name)
                    .map(|entity| Field::new(entity.join_key.clone(), entity.value_type))
                    .ok_or_else(|| FeastError::entity_not_found(name, project))
            })
            .collect::<Result<Vec<Field>>>()?;
        for (i, feature) in view.features.iter().enumerate() {
            if view.features[..i].iter().any(|f| f.name == feature.name) {
                return Err(FeastError::config(format!(
                    "Feature {} is defined twice in feature view {}",
                    feature.name, view.name
                )));
            }
        }
        if view.ttl_seconds < 0 {
            return Err(FeastError::config(format!(
                "Feature view {} has a negative ttl",
                view.name
            )));
        }
        if view.source.table.is_empty() || view.source.event_timestamp_column.is_empty() {
            return Err(FeastError::config(format!(
                "Feature view {} needs a source table and an event timestamp column",
                view.name
            )));
        }
        Ok(FeatureView {
            name: view.name,
            entity_names: view.entities,
            entity_columns,
            features: view.features,
            ttl: chrono::Duration::seconds(view.ttl_seconds),
            source: view.source,
        })
    }
}

#[async_trait]
impl FeatureRegistryService for FileFeatureRegistry {
    fn project(&self) -> &str {
        &self.project
    }

    async fn get_entity(&self, name: &str) -> Result<Entity> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| FeastError::entity_not_found(name, &self.project))
    }

    async fn get_feature_view(&self, name: &str) -> Result<Arc<FeatureView>> {
        self.feature_views
            .get(name)
            .cloned()
            .ok_or_else(|| FeastError::feature_view_not_found(name, &self.project))
    }

    async fn list_feature_views(&self) -> Result<Vec<Arc<FeatureView>>> {
        Ok(self.feature_views.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValueType;
    use anyhow::Result;

    fn registry_path() -> String {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        format!("{}/test_data/registry.yaml", project_dir)
    }

    #[tokio::test]
    async fn load_registry_from_file() -> Result<()> {
        let registry = FileFeatureRegistry::from_path("driver_ranking", &registry_path())?;
        let views = registry.list_feature_views().await?;
        let names: Vec<&str> = views.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["customer_driver_stats", "driver_hourly_stats"]);

        let view = registry.get_feature_view("customer_driver_stats").await?;
        assert_eq!(view.join_keys(), vec!["customer_id", "driver_id"]);
        assert_eq!(view.entity_columns[0].value_type, ValueType::String);
        assert_eq!(view.ttl, chrono::Duration::days(1));

        let view = registry.get_feature_view("driver_hourly_stats").await?;
        assert_eq!(view.source.source_column("trips"), "avg_daily_trips");
        assert_eq!(view.source.created_timestamp_column.as_deref(), Some("created"));

        let entity = registry.get_entity("driver").await?;
        assert_eq!(entity.join_key, "driver_id");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() -> Result<()> {
        let registry = FileFeatureRegistry::from_path("driver_ranking", &registry_path())?;
        let err = registry.get_feature_view("missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = registry.get_entity("missing").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn view_with_undeclared_entity_fails_to_load() {
        let yaml = r#"
feature_views:
  - name: orphan
    entities: [rider]
    features:
      - name: score
        value_type: DOUBLE
    source:
      table: scores
      event_timestamp_column: ts
"#;
        let err = FileFeatureRegistry::from_yaml_str("p", yaml).unwrap_err();
        assert!(matches!(err, FeastError::EntityNotFound { ref name, .. } if name == "rider"));
    }

    #[test]
    fn duplicate_features_are_rejected() {
        let yaml = r#"
feature_views:
  - name: dup
    features:
      - {name: a, value_type: INT64}
      - {name: a, value_type: DOUBLE}
    source: {table: t, event_timestamp_column: ts}
"#;
        assert!(matches!(
            FileFeatureRegistry::from_yaml_str("p", yaml),
            Err(FeastError::Config(_))
        ));
    }
}
