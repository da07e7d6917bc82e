use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Load the latest feature values of [START, END) from the offline store into the online store
    Materialize {
        /// Start of the window (RFC 3339), inclusive
        start: String,
        /// End of the window (RFC 3339), exclusive
        end: String,
        /// Feature views to materialize. All feature views when omitted
        #[arg(short = 'v', long = "views", num_args = 1..)]
        views: Vec<String>,
        /// Rows per write batch. Overrides feature_store.yaml
        #[arg(long = "write-batch-size")]
        write_batch_size: Option<usize>,
        /// Batches written concurrently. Overrides feature_store.yaml
        #[arg(long = "write-concurrency")]
        write_concurrency: Option<usize>,
        /// Give up waiting after this many seconds. The jobs keep running until the process exits
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
    },
    /// Read the latest feature values of entities from the online store and print them as JSON
    GetOnlineFeatures {
        /// Feature references: [project/][view.]feature[:version]
        #[arg(long = "features", num_args = 1.., required = true)]
        features: Vec<String>,
        /// Entity values as JOIN_KEY=VALUE[,VALUE...]; one entity row per position
        #[arg(short = 'e', long = "entity", num_args = 1.., required = true)]
        entities: Vec<String>,
    },
    /// Submit a historical feature retrieval job to a standalone Spark cluster
    GetHistoricalFeatures {
        /// Feature references: [project/][view.]feature[:version]
        #[arg(long = "features", num_args = 1.., required = true)]
        features: Vec<String>,
        /// Location of the entity rows to join features onto
        #[arg(long = "entity-source")]
        entity_source: String,
        /// Location the job writes its result to
        #[arg(long = "output")]
        output: String,
        /// Spark master url, e.g. spark://host:7077
        #[arg(long = "spark-master")]
        spark_master: String,
        /// Spark installation directory
        #[arg(long = "spark-home", env = "SPARK_HOME")]
        spark_home: PathBuf,
        /// Retrieval script submitted to the cluster
        #[arg(long = "script")]
        script: PathBuf,
        /// Wait for the job to finish, giving up after this many seconds
        #[arg(long = "wait-secs")]
        wait_secs: Option<u64>,
    },
    /// Remove the online tables of all feature views
    Teardown,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct CliOptions {
    #[arg(short = 'c', long = "chdir", default_value = None)]
    /// Switch to a different feature repository directory before executing the given subcommand.
    /// Can also be set via the FEATURE_REPO_DIR_ENV_VAR environment variable.
    pub chdir: Option<String>,
    /// The logging level. Case-insensitive.
    #[arg(
        value_enum,
        long = "log-level",
        ignore_case = true,
        default_value = "info"
    )]
    pub log_level: LogLevel,
    /// Override the directory where the CLI should look for the feature_store.yaml file.
    /// Can also be set via the FEAST_FS_YAML_FILE_PATH environment variable
    #[arg(short='f', long="feature-store-yaml", default_value = None)]
    pub feature_store_yaml: Option<String>,
    #[command(subcommand)]
    pub command: CliCommand,
}
