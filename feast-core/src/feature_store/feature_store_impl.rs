use crate::config::RepoConfig;
use crate::error::{FeastError, Result};
use crate::feature_reference::{FeatureReference, FeatureReferenceResolver};
use crate::feature_store::response_builder::{OnlineFeaturesResponse, ResponseBuilder};
use crate::job::RetrievalJobHandle;
use crate::job::launcher::JobLauncher;
use crate::key_serialization::serialize_key_with_schema;
use crate::materialization::{LoggingProgress, MaterializationOptions, MaterializationPipeline};
use crate::model::{EntityIdValue, FeatureRow, FeatureView, StoredRecord};
use crate::offline_store::{OfflineStore, get_offline_store};
use crate::onlinestore::{OnlineStore, get_online_store};
use crate::registry::{FeatureRegistryService, get_registry};
use crate::types::EntityKey;
use crate::writer::{ConflictResolvingWriter, WriteSummary};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A requested feature together with the feature view that serves it.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    pub reference: FeatureReference,
    pub view: Arc<FeatureView>,
}

pub struct FeatureStore {
    project: String,
    registry: Arc<dyn FeatureRegistryService>,
    writer: Arc<ConflictResolvingWriter>,
    pipeline: Arc<MaterializationPipeline>,
    resolver: FeatureReferenceResolver,
    options: MaterializationOptions,
}

impl FeatureStore {
    pub fn new(
        project: impl Into<String>,
        registry: Arc<dyn FeatureRegistryService>,
        online_store: Arc<dyn OnlineStore>,
        offline_store: Arc<dyn OfflineStore>,
    ) -> Self {
        let project = project.into();
        let writer = Arc::new(ConflictResolvingWriter::new(online_store));
        let pipeline = Arc::new(
            MaterializationPipeline::new(offline_store, writer.clone())
                .with_progress(Arc::new(LoggingProgress::default())),
        );
        Self {
            resolver: FeatureReferenceResolver::new(Some(project.clone())),
            project,
            registry,
            writer,
            pipeline,
            options: MaterializationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MaterializationOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the store described by `feature_store.yaml`, resolving relative paths against
    /// the repository directory `cwd`.
    pub async fn from_config(config: &RepoConfig, cwd: Option<&str>) -> Result<Self> {
        let registry = get_registry(&config.registry, &config.project, cwd).await?;
        let online_store = get_online_store(&config.online_store, &config.project, cwd).await?;
        let offline_store = get_offline_store(&config.offline_store, cwd).await?;
        info!(
            "Feature store for project {} uses {} online store",
            config.project,
            online_store.backend()
        );
        Ok(Self::new(config.project.clone(), registry, online_store, offline_store)
            .with_options(config.materialization.to_options()))
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn options(&self) -> &MaterializationOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<dyn FeatureRegistryService> {
        &self.registry
    }

    pub fn parse_references<S: AsRef<str>>(&self, references: &[S]) -> Result<Vec<FeatureReference>> {
        self.resolver.parse_all(references)
    }

    /// Parses `references` and finds the feature view serving each of them, preserving order.
    pub async fn resolve_features<S: AsRef<str>>(
        &self,
        references: &[S],
    ) -> Result<Vec<ResolvedFeature>> {
        let parsed = self.parse_references(references)?;
        let mut views: Option<Vec<Arc<FeatureView>>> = None;
        let mut resolved = Vec::with_capacity(parsed.len());
        for reference in parsed {
            if reference.namespace != self.project {
                return Err(FeastError::feature_view_not_found(
                    reference.feature_path(),
                    reference.namespace.clone(),
                ));
            }
            let view = match &reference.feature_view {
                Some(view_name) => self.registry.get_feature_view(view_name).await?,
                None => {
                    if views.is_none() {
                        views = Some(self.registry.list_feature_views().await?);
                    }
                    let candidates: Vec<&Arc<FeatureView>> = views
                        .iter()
                        .flatten()
                        .filter(|view| view.feature(&reference.name).is_some())
                        .collect();
                    match candidates.as_slice() {
                        [view] => Arc::clone(view),
                        [] => {
                            return Err(FeastError::FeatureNotFound {
                                feature: reference.name.clone(),
                                view: format!("any feature view of project {}", self.project),
                            });
                        }
                        several => {
                            return Err(FeastError::AmbiguousFeature {
                                feature: reference.name.clone(),
                                views: several.iter().map(|v| v.name.clone()).collect(),
                            });
                        }
                    }
                }
            };
            // Views are not versioned; only the latest version can be served.
            if view.feature(&reference.name).is_none() || reference.version != 0 {
                return Err(FeastError::FeatureNotFound {
                    feature: reference.to_string(),
                    view: view.name.clone(),
                });
            }
            resolved.push(ResolvedFeature { reference, view });
        }
        Ok(resolved)
    }

    async fn views_or_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<FeatureView>>> {
        if names.is_empty() {
            return self.registry.list_feature_views().await;
        }
        let mut views = Vec::with_capacity(names.len());
        for name in names {
            views.push(self.registry.get_feature_view(name.as_ref()).await?);
        }
        Ok(views)
    }

    /// Starts one materialization job per feature view, all views when `views` is empty.
    pub async fn materialize<S: AsRef<str>>(
        &self,
        views: &[S],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RetrievalJobHandle>> {
        if start > end {
            return Err(FeastError::InvalidWindow { start, end });
        }
        let views = self.views_or_all(views).await?;
        self.writer.store().update(&views, &[]).await?;
        views
            .into_iter()
            .map(|view| {
                self.pipeline
                    .materialize(&self.project, view, start, end, self.options.clone())
            })
            .collect()
    }

    pub async fn materialize_view(
        &self,
        view: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<RetrievalJobHandle> {
        let view = self.registry.get_feature_view(view).await?;
        self.writer
            .store()
            .update(std::slice::from_ref(&view), &[])
            .await?;
        self.pipeline
            .materialize(&self.project, view, start, end, self.options.clone())
    }

    /// Writes rows straight into the online table of `view`.
    pub async fn write_to_online_store(
        &self,
        view: &str,
        rows: Vec<FeatureRow>,
    ) -> Result<WriteSummary> {
        let view = self.registry.get_feature_view(view).await?;
        self.writer.write_batch(&view, rows, None).await
    }

    /// Reads the stored records of `entity_keys`, positionally.
    pub async fn online_read(
        &self,
        view: &str,
        entity_keys: &[EntityKey],
    ) -> Result<Vec<Option<StoredRecord>>> {
        let view = self.registry.get_feature_view(view).await?;
        let keys = entity_keys
            .iter()
            .map(|key| {
                view.check_entity_key(key)?;
                serialize_key_with_schema(&view.entity_columns, &key.entity_values)
            })
            .collect::<Result<Vec<Vec<u8>>>>()?;
        self.writer.read(&view, &keys).await
    }

    /// Latest feature values for each entity row. Result columns are the join keys of the
    /// resolved views followed by the requested features in request order.
    pub async fn get_online_features<S: AsRef<str>>(
        &self,
        references: &[S],
        entity_rows: &[BTreeMap<String, EntityIdValue>],
    ) -> Result<OnlineFeaturesResponse> {
        let features = self.resolve_features(references).await?;

        let mut view_order: Vec<Arc<FeatureView>> = Vec::new();
        for feature in &features {
            if !view_order.iter().any(|v| v.name == feature.view.name) {
                view_order.push(feature.view.clone());
            }
        }

        let mut builder = ResponseBuilder::new(Utc::now());
        let mut join_keys: Vec<&str> = Vec::new();
        for view in &view_order {
            for column in &view.entity_columns {
                if !join_keys.contains(&column.name.as_str()) {
                    join_keys.push(column.name.as_str());
                }
            }
        }
        for join_key in &join_keys {
            let values = entity_rows
                .iter()
                .map(|row| {
                    row.get(*join_key).cloned().ok_or_else(|| {
                        FeastError::encoding(format!("entity row is missing join key {}", join_key))
                    })
                })
                .collect::<Result<Vec<EntityIdValue>>>()?;
            builder.entity_column(join_key, values);
        }

        let mut records: HashMap<String, Vec<Option<StoredRecord>>> = HashMap::default();
        for view in &view_order {
            let keys = entity_rows
                .iter()
                .map(|row| Self::encode_entity_row(view, row))
                .collect::<Result<Vec<Vec<u8>>>>()?;
            debug!("Reading {} keys from {}", keys.len(), view.name);
            records.insert(view.name.clone(), self.writer.read(view, &keys).await?);
        }

        for (feature, reference) in features.iter().zip(references) {
            let view_records = records
                .get(&feature.view.name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            builder.feature_column(
                reference.as_ref().to_string(),
                &feature.view,
                &feature.reference.name,
                view_records,
            );
        }
        Ok(builder.build())
    }

    fn encode_entity_row(
        view: &FeatureView,
        row: &BTreeMap<String, EntityIdValue>,
    ) -> Result<Vec<u8>> {
        let values = view
            .entity_columns
            .iter()
            .map(|column| {
                row.get(&column.name)
                    .ok_or_else(|| {
                        FeastError::encoding(format!(
                            "entity row is missing join key {}",
                            column.name
                        ))
                    })
                    .and_then(|value| value.to_proto_value(column.value_type))
            })
            .collect::<Result<Vec<_>>>()?;
        let entity_key = view.entity_key(values)?;
        serialize_key_with_schema(&view.entity_columns, &entity_key.entity_values)
    }

    /// Submits a point-in-time join of `entity_source` against the requested features.
    pub async fn get_historical_features<S: AsRef<str>>(
        &self,
        references: &[S],
        entity_source: &str,
        output_location: &str,
        launcher: &dyn JobLauncher,
    ) -> Result<RetrievalJobHandle> {
        let features = self.resolve_features(references).await?;
        let mut tables: Vec<(Arc<FeatureView>, Vec<String>)> = Vec::new();
        for feature in features {
            match tables.iter_mut().find(|(view, _)| view.name == feature.view.name) {
                Some((_, names)) => names.push(feature.reference.name),
                None => tables.push((feature.view, vec![feature.reference.name])),
            }
        }
        let feature_tables: Vec<serde_json::Value> = tables
            .iter()
            .map(|(view, names)| {
                let features: Vec<serde_json::Value> = names
                    .iter()
                    .filter_map(|name| view.feature(name))
                    .map(|f| json!({"name": f.name, "type": f.value_type.to_string()}))
                    .collect();
                json!({
                    "project": self.project,
                    "name": view.name,
                    "entities": view
                        .entity_columns
                        .iter()
                        .map(|c| json!({"name": c.name, "type": c.value_type.to_string()}))
                        .collect::<Vec<_>>(),
                    "features": features,
                    "max_age": view.ttl.num_seconds(),
                    "source": view.source,
                })
            })
            .collect();
        let config = json!({
            "entity": {"path": entity_source},
            "feature_tables": feature_tables,
            "output": {"path": output_location},
        });
        let job_id = format!("historical-{}", Uuid::new_v4());
        launcher
            .historical_feature_retrieval(&job_id, config, output_location)
            .await
    }

    /// Removes the online tables of every registered feature view.
    pub async fn teardown(&self) -> Result<()> {
        let views = self.registry.list_feature_views().await?;
        self.writer.store().teardown(&views).await
    }
}
