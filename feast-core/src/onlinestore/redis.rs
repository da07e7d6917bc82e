//! Redis online store.
//!
//! Every entity key owns one hash, addressed by the encoded entity key followed by the project
//! name. A feature view stores `_ts:<view>` and `_created_ts:<view>` (protobuf timestamps) and
//! one field per feature, named by the murmur3 hash of `<view>:<feature>`. Several views share
//! the hash of an entity key without touching each other's fields.
//!
//! Single node stores reconnect through the redis `ConnectionManager`; cluster clients retry
//! requests `retries` times. Failures after that surface as unavailable.

use crate::config::RedisType;
use crate::error::{FeastError, Result};
use crate::key_serialization::deserialize_key;
use crate::model::{FeatureView, StoredRecord};
use crate::onlinestore::OnlineStore;
use crate::types::Value as FeastValue;
use crate::util::{datetime_to_prost_timestamp, prost_timestamp_to_datetime, read_file_to_bytes};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;
use prost_types::Timestamp;
use redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig};
use redis::cluster::{ClusterClient, ClusterClientBuilder};
use redis::cluster_async::ClusterConnection;
use redis::{
    Client, ClientTlsConfig, ConnectionAddr, ConnectionInfo, IntoConnectionInfo,
    RedisConnectionInfo, RedisResult, TlsCertificates,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const BACKEND: &str = "redis";
const SCAN_BATCH: usize = 1000;

fn unavailable(err: impl Into<anyhow::Error>) -> FeastError {
    FeastError::backend_unavailable(BACKEND, err)
}

fn feature_redis_key(view_name: &str, feature_name: &str) -> anyhow::Result<Vec<u8>> {
    let mut key_bytes = view_name.as_bytes().to_vec();
    key_bytes.push(b':');
    key_bytes.extend_from_slice(feature_name.as_bytes());
    let hashed_key = murmur3::murmur3_32(&mut std::io::Cursor::new(&key_bytes), 0)?;
    Ok(hashed_key.to_le_bytes().to_vec())
}

fn event_ts_field(view_name: &str) -> Vec<u8> {
    format!("_ts:{}", view_name).into_bytes()
}

fn created_ts_field(view_name: &str) -> Vec<u8> {
    format!("_created_ts:{}", view_name).into_bytes()
}

/// Hash fields owned by a view, in the order `[_ts, _created_ts, features...]`.
fn view_fields(view: &FeatureView) -> Result<Vec<Vec<u8>>> {
    let mut fields = vec![event_ts_field(&view.name), created_ts_field(&view.name)];
    for feature in &view.features {
        fields.push(feature_redis_key(&view.name, &feature.name).map_err(unavailable)?);
    }
    Ok(fields)
}

fn parse_redis_connection_string(connection_string: &str) -> anyhow::Result<RedisConnectionOption> {
    let mut result = RedisConnectionOption::default();
    let mut common_options = CommonConnectionOptions::default();
    for (i, part) in connection_string.split(',').enumerate() {
        let part = part.trim();
        if part.matches(':').count() == 1 && !part.contains('=') {
            if let Some((host, port_str)) = part.split_once(':') {
                let port = port_str
                    .parse::<u16>()
                    .with_context(|| format!("Failed to parse port '{}'", port_str))?;
                result.hosts.push((host.to_string(), port));
            } else {
                return Err(anyhow!("Invalid connection URL of host at index {}", i));
            }
        } else if part.matches('=').count() == 1 {
            if let Some((key, value)) = part.split_once('=') {
                parse_common_options(&mut common_options, i, key, value)?;
            } else {
                return Err(anyhow!("Invalid connection option at index {}", i));
            }
        } else {
            return Err(anyhow!(
                "Invalid connection URL part at index {}: {}",
                i,
                part
            ));
        }
    }
    if result.hosts.is_empty() {
        return Err(anyhow!("Connection string has no host:port entry"));
    }
    result.common_options = common_options;
    Ok(result)
}

trait GetConnection {
    /// Whether the keyspace can be scanned from a single connection.
    const SUPPORTS_SCAN: bool;

    fn get_connection(&self) -> impl ConnectionLike + Send + Sync;
}

trait GetProject {
    fn get_project(&self) -> &str;
}

pub(crate) struct RedisSingleNodeOnlineStore {
    project: String,
    connection_pool: ConnectionManager,
}

impl GetConnection for RedisSingleNodeOnlineStore {
    const SUPPORTS_SCAN: bool = true;

    fn get_connection(&self) -> impl ConnectionLike + Send + Sync {
        self.connection_pool.clone()
    }
}

impl GetProject for RedisSingleNodeOnlineStore {
    fn get_project(&self) -> &str {
        &self.project
    }
}

pub(crate) struct RedisClusterOnlineStore {
    project: String,
    connection_pool: ClusterConnection,
}

impl GetConnection for RedisClusterOnlineStore {
    const SUPPORTS_SCAN: bool = false;

    fn get_connection(&self) -> impl ConnectionLike + Send + Sync {
        self.connection_pool.clone()
    }
}

impl GetProject for RedisClusterOnlineStore {
    fn get_project(&self) -> &str {
        &self.project
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct CommonConnectionOptions {
    password: Option<String>,
    username: Option<String>,
    ssl: Option<bool>,
    db: Option<i64>,
    retries: Option<u32>,
    ssl_certfile: Option<String>,
    ssl_keyfile: Option<String>,
    ssl_ca_certs: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct RedisConnectionOption {
    hosts: Vec<(String, u16)>,
    common_options: CommonConnectionOptions,
}

#[derive(Debug, Default, Clone)]
struct SingleNodeConnectionOption {
    host: String,
    port: u16,
    common_options: CommonConnectionOptions,
}

impl TryFrom<&CommonConnectionOptions> for TlsCertificates {
    type Error = anyhow::Error;

    fn try_from(value: &CommonConnectionOptions) -> anyhow::Result<Self> {
        match (value.ssl_keyfile.as_ref(), value.ssl_certfile.as_ref()) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(anyhow!(
                    "Both ssl_keyfile and ssl_certfile must be provided together or neither"
                ));
            }
            _ => {}
        }
        let client_tls: Option<ClientTlsConfig> = if let (Some(cert), Some(key)) =
            (value.ssl_certfile.as_ref(), value.ssl_keyfile.as_ref())
        {
            Some(ClientTlsConfig {
                client_cert: read_file_to_bytes(cert)?,
                client_key: read_file_to_bytes(key)?,
            })
        } else {
            None
        };
        Ok(TlsCertificates {
            client_tls,
            root_cert: value
                .ssl_ca_certs
                .as_ref()
                .map(|cert_path| read_file_to_bytes(cert_path))
                .transpose()?,
        })
    }
}

impl TryFrom<RedisConnectionOption> for SingleNodeConnectionOption {
    type Error = anyhow::Error;

    fn try_from(value: RedisConnectionOption) -> anyhow::Result<Self> {
        if value.hosts.len() != 1 {
            return Err(anyhow!(
                "Expected single host for a single node Redis store, got {}",
                value.hosts.len()
            ));
        }
        let (host, port) = &value.hosts[0];
        Ok(SingleNodeConnectionOption {
            host: host.clone(),
            port: *port,
            common_options: value.common_options,
        })
    }
}

impl IntoConnectionInfo for SingleNodeConnectionOption {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo> {
        let mut redis = RedisConnectionInfo::default();
        redis.username = self.common_options.username;
        redis.password = self.common_options.password;
        if let Some(db) = self.common_options.db {
            redis.db = db;
        }
        let addr: ConnectionAddr = ConnectionAddr::Tcp(self.host, self.port);
        Ok(ConnectionInfo { addr, redis })
    }
}

struct RedisClusterHost {
    host: String,
    port: u16,
    db: Option<i64>,
}

impl From<RedisConnectionOption> for Vec<RedisClusterHost> {
    fn from(value: RedisConnectionOption) -> Self {
        let db = value.common_options.db;
        value
            .hosts
            .into_iter()
            .map(|(host, port)| RedisClusterHost { host, port, db })
            .collect()
    }
}

impl IntoConnectionInfo for RedisClusterHost {
    fn into_connection_info(self) -> RedisResult<ConnectionInfo> {
        let conn_address = ConnectionAddr::Tcp(self.host, self.port);
        let mut redis_info = RedisConnectionInfo::default();
        if let Some(db) = self.db {
            redis_info.db = db;
        }
        Ok(ConnectionInfo {
            addr: conn_address,
            redis: redis_info,
        })
    }
}

impl TryFrom<RedisConnectionOption> for ClusterClient {
    type Error = anyhow::Error;

    fn try_from(value: RedisConnectionOption) -> anyhow::Result<Self> {
        let hosts: Vec<RedisClusterHost> = value.clone().into();
        let mut builder = ClusterClientBuilder::new(hosts);
        let RedisConnectionOption {
            hosts: _,
            common_options,
        } = value;
        if let Some(enabled) = common_options.ssl
            && enabled
        {
            let certificates = TlsCertificates::try_from(&common_options)?;
            builder = builder.certs(certificates);
        }
        if let Some(username) = common_options.username {
            builder = builder.username(username);
        }
        if let Some(password) = common_options.password {
            builder = builder.password(password);
        }
        if let Some(retries) = common_options.retries {
            builder = builder.retries(retries);
        }
        Ok(builder.build()?)
    }
}

fn parse_common_options(
    result: &mut CommonConnectionOptions,
    i: usize,
    key: &str,
    value: &str,
) -> anyhow::Result<()> {
    match key.to_ascii_lowercase().as_str() {
        "password" => result.password = Some(value.to_string()),
        "username" => result.username = Some(value.to_string()),
        "db" => result.db = Some(value.parse::<i64>()?),
        "retries" => {
            result.retries = Some(
                value
                    .parse::<u32>()
                    .with_context(|| format!("Invalid retries value at index {}", i))?,
            )
        }
        "ssl" => {
            let ssl_value = match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(anyhow!(
                        "Invalid ssl value at index {}: {}, supported values are 'true', 'false', '1', '0', 'yes', 'no'",
                        i,
                        value
                    ));
                }
            };
            result.ssl = Some(ssl_value);
        }
        "ssl_certfile" => result.ssl_certfile = Some(value.to_string()),
        "ssl_keyfile" => result.ssl_keyfile = Some(value.to_string()),
        "ssl_ca_certs" => result.ssl_ca_certs = Some(value.to_string()),
        other => {
            return Err(anyhow!(
                "Invalid connection option at index {}: {}",
                i,
                other
            ));
        }
    }
    Ok(())
}

async fn check_redis_connection(client: &Client) -> anyhow::Result<()> {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .with_context(|| anyhow!("Cannot establish redis connection"))?;
    let ping_response: String = redis::cmd("PING").query_async(&mut conn).await?;
    if ping_response.to_uppercase() != "PONG" {
        return Err(anyhow!(
            "Failed to connect to Redis online store, unexpected PING response: {}",
            ping_response
        ));
    }
    Ok(())
}

pub async fn new(
    project: String,
    redis_type: RedisType,
    connection_string: &str,
) -> Result<Arc<dyn OnlineStore>> {
    let connection_option = parse_redis_connection_string(connection_string)
        .map_err(|e| FeastError::config(format!("{:#}", e)))?;
    match redis_type {
        RedisType::SingleNode => {
            let retries = connection_option.common_options.retries;
            let certificates = TlsCertificates::try_from(&connection_option.common_options)
                .map_err(|e| FeastError::config(format!("{:#}", e)))?;
            let single_node_option = SingleNodeConnectionOption::try_from(connection_option)
                .map_err(|e| FeastError::config(format!("{:#}", e)))?;
            let client =
                Client::build_with_tls(single_node_option, certificates).map_err(unavailable)?;

            check_redis_connection(&client).await.map_err(unavailable)?;
            let mut manager_config = ConnectionManagerConfig::new();
            if let Some(retries) = retries {
                manager_config = manager_config.set_number_of_retries(retries as usize);
            }
            let connection_pool = ConnectionManager::new_with_config(client, manager_config)
                .await
                .map_err(unavailable)?;
            debug!("Connected to single node Redis for project {}", project);
            Ok(Arc::new(RedisSingleNodeOnlineStore {
                project,
                connection_pool,
            }))
        }
        RedisType::RedisCluster => {
            let cluster_client = ClusterClient::try_from(connection_option)
                .map_err(|e| FeastError::config(format!("{:#}", e)))?;
            let connection_pool = cluster_client
                .get_async_connection()
                .await
                .with_context(|| anyhow!("Cannot establish redis cluster connection"))
                .map_err(unavailable)?;
            debug!("Connected to Redis cluster for project {}", project);
            Ok(Arc::new(RedisClusterOnlineStore {
                project,
                connection_pool,
            }))
        }
    }
}

fn decode_timestamp(bytes: &[u8], view_name: &str) -> Result<DateTime<Utc>> {
    let timestamp = Timestamp::decode(bytes).map_err(|e| {
        FeastError::encoding(format!(
            "Failed to decode timestamp for feature view {}: {}",
            view_name, e
        ))
    })?;
    Ok(prost_timestamp_to_datetime(&timestamp))
}

fn hash_key(entity_key: &[u8], project: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(entity_key.len() + project.len());
    key.extend_from_slice(entity_key);
    key.extend_from_slice(project.as_bytes());
    key
}

fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// True when `key` is an encoded entity key followed by exactly `project`. Entity keys are
/// self-delimiting, so a key of a project whose name merely ends with `project` fails to decode.
fn is_project_key(key: &[u8], project: &str) -> bool {
    key.strip_suffix(project.as_bytes())
        .is_some_and(|entity_key| deserialize_key(entity_key).is_ok())
}

async fn scan_project_keys<C: ConnectionLike + Send>(
    connection: &mut C,
    project: &str,
) -> Result<Vec<Vec<u8>>> {
    let pattern = format!("*{}", escape_glob(project));
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, batch): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(&mut *connection)
            .await
            .map_err(unavailable)?;
        keys.extend(batch.into_iter().filter(|key| is_project_key(key, project)));
        if next == 0 {
            return Ok(keys);
        }
        cursor = next;
    }
}

#[async_trait]
impl<T> OnlineStore for T
where
    T: GetConnection + GetProject + Send + Sync + 'static,
{
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, view: &FeatureView, entity_key: &[u8]) -> Result<Option<StoredRecord>> {
        let fields = view_fields(view)?;
        let mut connection = self.get_connection();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(hash_key(entity_key, self.get_project()))
            .arg(&fields)
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        if values.len() != fields.len() {
            return Err(unavailable(anyhow!(
                "Mismatched number of results: expected {}, got {}",
                fields.len(),
                values.len()
            )));
        }
        let mut values = values.into_iter();
        let Some(event_ts) = values.next().flatten() else {
            return Ok(None);
        };
        let event_ts = decode_timestamp(&event_ts, &view.name)?;
        let created_ts = match values.next().flatten() {
            Some(bytes) => decode_timestamp(&bytes, &view.name)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        let mut record = StoredRecord {
            event_ts,
            created_ts,
            values: BTreeMap::new(),
        };
        for (feature, value) in view.features.iter().zip(values) {
            if let Some(bytes) = value {
                let decoded = FeastValue::decode(bytes.as_slice()).map_err(|e| {
                    FeastError::encoding(format!(
                        "Failed to decode value for feature {}:{}: {}",
                        view.name, feature.name, e
                    ))
                })?;
                record.values.insert(feature.name.clone(), decoded);
            }
        }
        Ok(Some(record))
    }

    async fn put(
        &self,
        view: &FeatureView,
        entity_key: &[u8],
        record: &StoredRecord,
    ) -> Result<()> {
        let key = hash_key(entity_key, self.get_project());
        let mut stale: Vec<Vec<u8>> = Vec::new();
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (
                event_ts_field(&view.name),
                datetime_to_prost_timestamp(&record.event_ts).encode_to_vec(),
            ),
            (
                created_ts_field(&view.name),
                datetime_to_prost_timestamp(&record.created_ts).encode_to_vec(),
            ),
        ];
        for feature in &view.features {
            let field = feature_redis_key(&view.name, &feature.name).map_err(unavailable)?;
            match record.values.get(&feature.name) {
                Some(value) => items.push((field, value.encode_to_vec())),
                None => stale.push(field),
            }
        }

        let mut pipeline = redis::pipe();
        pipeline.atomic();
        if !stale.is_empty() {
            pipeline.hdel(&key, stale).ignore();
        }
        pipeline.hset_multiple(&key, &items).ignore();
        let mut connection = self.get_connection();
        pipeline
            .query_async::<()>(&mut connection)
            .await
            .map_err(unavailable)
    }

    async fn update(&self, _keep: &[Arc<FeatureView>], delete: &[Arc<FeatureView>]) -> Result<()> {
        if delete.is_empty() {
            return Ok(());
        }
        self.teardown(delete).await
    }

    async fn teardown(&self, views: &[Arc<FeatureView>]) -> Result<()> {
        if !T::SUPPORTS_SCAN {
            return Err(unavailable(anyhow!(
                "Teardown is not supported for Redis cluster stores"
            )));
        }
        let mut fields = Vec::new();
        for view in views {
            fields.extend(view_fields(view)?);
        }
        if fields.is_empty() {
            return Ok(());
        }
        let mut connection = self.get_connection();
        let keys = scan_project_keys(&mut connection, self.get_project()).await?;
        debug!(
            "Removing {} views from {} Redis keys of project {}",
            views.len(),
            keys.len(),
            self.get_project()
        );
        for chunk in keys.chunks(SCAN_BATCH) {
            let mut pipeline = redis::pipe();
            for key in chunk {
                pipeline.hdel(key, &fields).ignore();
            }
            pipeline
                .query_async::<()>(&mut connection)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }
}
