use crate::cli_options::{CliCommand, CliOptions};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::Parser;
use feast_core::config::RepoConfig;
use feast_core::feature_store::FeatureStore;
use feast_core::job::launcher::StandaloneClusterLauncher;
use feast_core::model::EntityIdValue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_options;

const FEATURE_REPO_DIR_ENV_VAR_NAME: &str = "FEATURE_REPO_DIR_ENV_VAR";
const FEAST_FS_YAML_FILE_PATH_ENV_VAR: &str = "FEAST_FS_YAML_FILE_PATH";
const DEFAULT_FEATURE_STORE_FILE_NAME: &str = "feature_store.yaml";

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid RFC 3339 timestamp: {}", value))
}

fn parse_entity_value(raw: &str) -> EntityIdValue {
    raw.parse::<i64>()
        .map(EntityIdValue::Int)
        .unwrap_or_else(|_| EntityIdValue::String(raw.to_string()))
}

/// Turns `KEY=V1,V2` arguments into one entity row per value position.
fn parse_entity_rows(entities: &[String]) -> Result<Vec<BTreeMap<String, EntityIdValue>>> {
    let mut columns: Vec<(String, Vec<EntityIdValue>)> = Vec::new();
    for entity in entities {
        let (key, values) = entity
            .split_once('=')
            .ok_or_else(|| anyhow!("Entity must be given as KEY=VALUE, got '{}'", entity))?;
        if key.is_empty() {
            return Err(anyhow!("Entity '{}' has an empty join key", entity));
        }
        columns.push((key.to_string(), values.split(',').map(parse_entity_value).collect()));
    }
    let rows = columns.first().map_or(0, |(_, values)| values.len());
    if columns.iter().any(|(_, values)| values.len() != rows) {
        return Err(anyhow!("All entities must have the same number of values"));
    }
    Ok((0..rows)
        .map(|i| {
            columns
                .iter()
                .map(|(key, values)| (key.clone(), values[i].clone()))
                .collect()
        })
        .collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_opts = CliOptions::parse();
    let CliOptions {
        chdir,
        log_level,
        feature_store_yaml,
        command,
    } = cli_opts;

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::from(log_level).into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cwd =
        if let Some(path) = chdir.or_else(|| std::env::var(FEATURE_REPO_DIR_ENV_VAR_NAME).ok()) {
            PathBuf::from(path)
        } else {
            std::env::current_dir()?
        };
    let cwd_str = cwd
        .to_str()
        .ok_or_else(|| anyhow!("Feature repository path contains invalid UTF-8"))?;

    let feature_store_yaml = feature_store_yaml
        .or(std::env::var(FEAST_FS_YAML_FILE_PATH_ENV_VAR).ok())
        .unwrap_or(DEFAULT_FEATURE_STORE_FILE_NAME.to_string());
    let config_path = cwd.join(&feature_store_yaml);
    let repo_config = RepoConfig::from_file(&config_path)?;

    match command {
        CliCommand::Materialize {
            start,
            end,
            views,
            write_batch_size,
            write_concurrency,
            timeout_secs,
        } => {
            let start = parse_timestamp(&start)?;
            let end = parse_timestamp(&end)?;
            let mut options = repo_config.materialization.to_options();
            if let Some(size) = write_batch_size {
                options.write_batch_size = size;
            }
            if let Some(concurrency) = write_concurrency {
                options.write_concurrency = concurrency;
            }
            let feature_store = FeatureStore::from_config(&repo_config, Some(cwd_str))
                .await?
                .with_options(options);
            tracing::info!(
                "Materializing {} from {} to {}",
                if views.is_empty() {
                    "all feature views".to_string()
                } else {
                    views.join(", ")
                },
                start,
                end
            );
            let jobs = feature_store.materialize(&views, start, end).await?;
            let timeout = timeout_secs.map(Duration::from_secs);
            let outcomes = futures::future::join_all(jobs.iter().map(|job| job.wait(timeout))).await;
            let mut failed = 0;
            for (job, outcome) in jobs.iter().zip(outcomes) {
                match outcome {
                    Ok(output) => println!(
                        "{}: {} rows written to {}",
                        job.id(),
                        output.rows_written.unwrap_or(0),
                        output.location
                    ),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{}: {}", job.id(), err);
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{} of {} materialization jobs failed", failed, jobs.len()));
            }
        }
        CliCommand::GetOnlineFeatures { features, entities } => {
            let entity_rows = parse_entity_rows(&entities)?;
            let feature_store = FeatureStore::from_config(&repo_config, Some(cwd_str)).await?;
            let response = feature_store
                .get_online_features(&features, &entity_rows)
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        CliCommand::GetHistoricalFeatures {
            features,
            entity_source,
            output,
            spark_master,
            spark_home,
            script,
            wait_secs,
        } => {
            let feature_store = FeatureStore::from_config(&repo_config, Some(cwd_str)).await?;
            let launcher = StandaloneClusterLauncher::new(spark_master, spark_home, script)
                .with_poll_interval(feature_store.options().poll_interval);
            let job = feature_store
                .get_historical_features(&features, &entity_source, &output, &launcher)
                .await?;
            println!("Submitted job {}", job.id());
            if let Some(wait_secs) = wait_secs {
                let output = job.wait(Some(Duration::from_secs(wait_secs))).await?;
                println!("Job {} wrote {}", job.id(), output.location);
            }
        }
        CliCommand::Teardown => {
            let feature_store = FeatureStore::from_config(&repo_config, Some(cwd_str)).await?;
            feature_store.teardown().await?;
            tracing::info!("Removed online tables of project {}", feature_store.project());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_rows_are_built_positionally() -> Result<()> {
        let rows = parse_entity_rows(&[
            "driver_id=1001,1002".to_string(),
            "customer_id=a,b".to_string(),
        ])?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["driver_id"], EntityIdValue::Int(1002));
        assert_eq!(rows[1]["customer_id"], EntityIdValue::String("b".to_string()));
        assert!(parse_entity_rows(&["driver_id=1,2".to_string(), "c=x".to_string()]).is_err());
        assert!(parse_entity_rows(&["driver_id".to_string()]).is_err());
        Ok(())
    }

    #[test]
    fn timestamps_must_be_rfc3339() {
        assert!(parse_timestamp("2021-04-12T10:00:00+02:00").is_ok());
        assert!(parse_timestamp("2021-04-12").is_err());
    }
}
