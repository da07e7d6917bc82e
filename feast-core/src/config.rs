use crate::error::{FeastError, Result};
use crate::job::DEFAULT_POLL_INTERVAL;
use crate::materialization::{
    DEFAULT_WRITE_BATCH_SIZE, EncodingErrorPolicy, MaterializationOptions,
    default_write_concurrency,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "RegistryConfigDef")]
pub struct RegistryConfig {
    pub path: String,
    /// Reload interval of the registry file. No reloading when absent or zero.
    pub cache_ttl_seconds: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum RegistryConfigDef {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        cache_ttl_seconds: Option<u64>,
    },
}

impl From<RegistryConfigDef> for RegistryConfig {
    fn from(value: RegistryConfigDef) -> Self {
        match value {
            RegistryConfigDef::Path(path) => RegistryConfig {
                path,
                ..Default::default()
            },
            RegistryConfigDef::Detailed {
                path,
                cache_ttl_seconds,
            } => RegistryConfig {
                path,
                cache_ttl_seconds,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RedisType {
    #[default]
    SingleNode,
    RedisCluster,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnlineStoreConfig {
    Sqlite {
        path: String,
    },
    Redis {
        #[serde(default)]
        redis_type: RedisType,
        connection_string: String,
    },
    Memory,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OfflineStoreConfig {
    Sqlite {
        path: String,
    },
    #[default]
    Memory,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializationConfig {
    pub write_batch_size: usize,
    /// Number of batches written concurrently. Defaults to the available parallelism.
    pub write_concurrency: Option<usize>,
    pub encoding_errors: EncodingErrorPolicy,
    pub poll_interval_ms: u64,
}

impl Default for MaterializationConfig {
    fn default() -> Self {
        Self {
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            write_concurrency: None,
            encoding_errors: EncodingErrorPolicy::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl MaterializationConfig {
    pub fn to_options(&self) -> MaterializationOptions {
        MaterializationOptions {
            write_batch_size: self.write_batch_size,
            write_concurrency: self
                .write_concurrency
                .unwrap_or_else(default_write_concurrency),
            encoding_errors: self.encoding_errors,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepoConfig {
    pub project: String,
    pub project_description: Option<String>,
    pub registry: RegistryConfig,
    pub online_store: OnlineStoreConfig,
    #[serde(default)]
    pub offline_store: OfflineStoreConfig,
    #[serde(default)]
    pub materialization: MaterializationConfig,
}

impl RepoConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(FeastError::config("Empty configuration file"));
        }
        let config: RepoConfig =
            serde_saphyr::from_str(yaml).map_err(|err| FeastError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|err| {
            FeastError::config(format!("Failed to read {}: {}", path.display(), err))
        })?;
        Self::from_yaml_str(&yaml)
    }

    fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(FeastError::config("project must not be empty"));
        }
        if self.materialization.write_batch_size == 0 {
            return Err(FeastError::config("write_batch_size must be positive"));
        }
        if self.materialization.write_concurrency == Some(0) {
            return Err(FeastError::config("write_concurrency must be positive"));
        }
        if self.materialization.poll_interval_ms == 0 {
            return Err(FeastError::config("poll_interval_ms must be positive"));
        }
        Ok(())
    }
}
