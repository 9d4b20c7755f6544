//! Configuration structures for shokuyoku.
//!
//! Configuration is loaded either from a TOML file or from the process
//! environment, and stream settings can be overridden via CLI flags.
//! Environment loading reports every missing variable at once.

use crate::frame::ByteOrder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Kafka configuration
    pub kafka: KafkaConfig,

    /// Storage sink configuration
    pub storage: StorageConfig,

    /// Schema lookup configuration
    pub schema: SchemaConfig,

    /// Buffering and flush configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Kafka consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from
    pub topic: String,

    /// Consumer group ID
    pub consumer_group: String,

    /// Maximum number of messages taken per poll
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    /// Poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// Max poll interval in milliseconds (must exceed the longest flush cycle)
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

/// Kafka security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,
}

/// Object storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Storage location: `s3://bucket`, `memory://`, or a local directory
    pub location: String,

    /// Key prefix prepended to every object path
    #[serde(default)]
    pub prefix: String,

    /// AWS region
    pub aws_region: Option<String>,

    /// AWS access key ID
    pub aws_access_key_id: Option<String>,

    /// AWS secret access key
    pub aws_secret_access_key: Option<String>,

    /// S3 endpoint (for MinIO or other S3-compatible storage)
    pub s3_endpoint: Option<String>,
}

/// Schema lookup configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaConfig {
    /// Database namespace for every event type
    pub database: String,

    /// Hive metastore Thrift address (host:port)
    pub hive_metastore_uri: Option<String>,

    /// TOML file of static schemas; takes precedence over the metastore
    pub schema_file: Option<PathBuf>,

    /// How long a resolved schema is reused, in seconds
    #[serde(default = "default_schema_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// How long an unknown event type is remembered, in seconds; off when unset
    #[serde(default)]
    pub negative_cache_ttl_seconds: Option<u64>,

    /// Deadline for a single metastore lookup, in milliseconds
    #[serde(default = "default_schema_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Buffering and flush configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Interval between flush cycles in seconds
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,

    /// Byte order of frame length fields
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Rows per columnar write batch
    #[serde(default = "default_batch_size_hint")]
    pub batch_size_hint: usize,

    /// Parquet compression
    #[serde(default)]
    pub compression: ParquetCompression,

    /// Run a flush cycle early once this many records are buffered
    #[serde(default)]
    pub max_buffered_records: Option<usize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval_seconds: default_flush_interval_seconds(),
            byte_order: ByteOrder::default(),
            batch_size_hint: default_batch_size_hint(),
            compression: ParquetCompression::default(),
            max_buffered_records: None,
        }
    }
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Snappy compression (default, good balance)
    #[default]
    Snappy,
    /// Zstd compression (better ratio)
    Zstd,
    /// LZ4 compression (faster)
    Lz4,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Health and metrics HTTP port
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_max_poll_records() -> usize {
    500
}
fn default_poll_timeout_ms() -> u64 {
    500
}
fn default_session_timeout_ms() -> u32 {
    30000
}
fn default_heartbeat_interval_ms() -> u32 {
    3000
}
fn default_max_poll_interval_ms() -> u32 {
    300000 // 5 minutes
}
fn default_schema_cache_ttl_seconds() -> u64 {
    300
}
/// Split a comma-separated broker list, trimming entries and skipping blanks.
pub fn parse_server_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_schema_request_timeout_ms() -> u64 {
    5000
}
fn default_flush_interval_seconds() -> u64 {
    900
}
fn default_batch_size_hint() -> usize {
    1024
}
fn default_health_port() -> u16 {
    8080
}

/// Environment variables that must be present for [`Config::from_env`].
///
/// `KAFKA_TOPIC` is satisfied by `WORKER_KAFKA_TOPIC` as well.
pub const REQUIRED_ENV: &[(&str, &str)] = &[
    ("KAFKA_SERVERS", "comma-separated list of kafka servers, e.g. localhost:9092,localhost:9093"),
    ("KAFKA_GROUP_ID", "name of the Kafka consumer group, e.g. shokuyoku"),
    ("KAFKA_TOPIC", "topic to subscribe to, e.g. events"),
    ("KAFKA_POLL_DURATION_MS", "poll timeout in milliseconds, e.g. 500"),
    ("FLUSH_MINUTES", "interval between flushes in minutes, e.g. 15"),
    ("AWS_DEFAULT_REGION", "AWS region of the bucket, e.g. us-east-1"),
    ("S3_BUCKET", "bucket to write events to, e.g. my-event-bucket"),
    ("S3_PREFIX", "folder to prefix all events, e.g. data"),
    ("HIVE_DATABASE", "database holding the event schemas, e.g. events"),
    ("ORC_BATCH_SIZE", "number of rows per columnar write batch, e.g. 1024"),
];

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from a variable lookup function.
    ///
    /// Every missing required variable is collected before failing with
    /// [`crate::Error::MissingConfig`].
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut missing = Vec::new();
        for (key, hint) in REQUIRED_ENV {
            let present = match *key {
                "KAFKA_TOPIC" => get("WORKER_KAFKA_TOPIC").or_else(|| get("KAFKA_TOPIC")),
                other => get(other),
            };
            if present.is_none() {
                tracing::error!(variable = key, hint = hint, "Missing environment variable");
                missing.push(key.to_string());
            }
        }
        if get("SCHEMA_FILE").is_none() && get("HIVE_METASTORE_URI").is_none() {
            tracing::error!(
                variable = "HIVE_METASTORE_URI",
                hint = "Thrift address of the Hive metastore, or set SCHEMA_FILE",
                "Missing environment variable"
            );
            missing.push("HIVE_METASTORE_URI".to_string());
        }
        if !missing.is_empty() {
            return Err(crate::Error::MissingConfig(missing));
        }

        // Presence was checked above; default only guards the type.
        let required = |key: &str| get(key).unwrap_or_default();

        let topic = get("WORKER_KAFKA_TOPIC").unwrap_or_else(|| required("KAFKA_TOPIC"));
        let flush_minutes: u64 = parse_var("FLUSH_MINUTES", &required("FLUSH_MINUTES"))?;

        let byte_order = match get("ENDIAN") {
            Some(value) => value.parse::<ByteOrder>()?,
            None => ByteOrder::default(),
        };

        let log_format = match get("LOG_FORMAT").as_deref() {
            Some("text") => LogFormat::Text,
            _ => LogFormat::Json,
        };

        let config = Config {
            kafka: KafkaConfig {
                bootstrap_servers: parse_server_list(&required("KAFKA_SERVERS")),
                topic,
                consumer_group: required("KAFKA_GROUP_ID"),
                max_poll_records: get("KAFKA_MAX_POLL_RECORDS")
                    .map(|v| parse_var("KAFKA_MAX_POLL_RECORDS", &v))
                    .transpose()?
                    .unwrap_or_else(default_max_poll_records),
                poll_timeout_ms: parse_var(
                    "KAFKA_POLL_DURATION_MS",
                    &required("KAFKA_POLL_DURATION_MS"),
                )?,
                session_timeout_ms: default_session_timeout_ms(),
                heartbeat_interval_ms: default_heartbeat_interval_ms(),
                max_poll_interval_ms: default_max_poll_interval_ms(),
                security: KafkaSecurityConfig::default(),
            },
            storage: StorageConfig {
                location: format!("s3://{}", required("S3_BUCKET")),
                prefix: required("S3_PREFIX"),
                aws_region: get("AWS_DEFAULT_REGION"),
                aws_access_key_id: get("AWS_ACCESS_KEY_ID"),
                aws_secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
                s3_endpoint: get("S3_ENDPOINT"),
            },
            schema: SchemaConfig {
                database: required("HIVE_DATABASE"),
                hive_metastore_uri: get("HIVE_METASTORE_URI"),
                schema_file: get("SCHEMA_FILE").map(PathBuf::from),
                cache_ttl_seconds: get("SCHEMA_CACHE_TTL_SECONDS")
                    .map(|v| parse_var("SCHEMA_CACHE_TTL_SECONDS", &v))
                    .transpose()?
                    .unwrap_or_else(default_schema_cache_ttl_seconds),
                negative_cache_ttl_seconds: get("SCHEMA_NEGATIVE_CACHE_TTL_SECONDS")
                    .map(|v| parse_var("SCHEMA_NEGATIVE_CACHE_TTL_SECONDS", &v))
                    .transpose()?,
                request_timeout_ms: get("SCHEMA_REQUEST_TIMEOUT_MS")
                    .map(|v| parse_var("SCHEMA_REQUEST_TIMEOUT_MS", &v))
                    .transpose()?
                    .unwrap_or_else(default_schema_request_timeout_ms),
            },
            ingest: IngestConfig {
                flush_interval_seconds: flush_minutes * 60,
                byte_order,
                batch_size_hint: parse_var("ORC_BATCH_SIZE", &required("ORC_BATCH_SIZE"))?,
                compression: ParquetCompression::default(),
                max_buffered_records: get("MAX_BUFFERED_RECORDS")
                    .map(|v| parse_var("MAX_BUFFERED_RECORDS", &v))
                    .transpose()?,
            },
            monitoring: MonitoringConfig {
                log_format,
                ..MonitoringConfig::default()
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if self.kafka.topic.is_empty() {
            return Err(crate::Error::Config("Kafka topic is required".into()));
        }

        if self.kafka.consumer_group.is_empty() {
            return Err(crate::Error::Config("Consumer group is required".into()));
        }

        if self.kafka.max_poll_records == 0 {
            return Err(crate::Error::Config(
                "max_poll_records must be greater than zero".into(),
            ));
        }

        if self.storage.location.is_empty() {
            return Err(crate::Error::Config("Storage location is required".into()));
        }

        if self.schema.database.is_empty() {
            return Err(crate::Error::Config("Schema database is required".into()));
        }

        if self.schema.schema_file.is_none() && self.schema.hive_metastore_uri.is_none() {
            return Err(crate::Error::Config(
                "Either schema_file or hive_metastore_uri is required".into(),
            ));
        }

        if self.schema.request_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "schema request_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.ingest.batch_size_hint == 0 {
            return Err(crate::Error::Config(
                "batch_size_hint must be greater than zero".into(),
            ));
        }

        if self.ingest.max_buffered_records == Some(0) {
            return Err(crate::Error::Config(
                "max_buffered_records must be greater than zero when set".into(),
            ));
        }

        if self.ingest.flush_interval_seconds == 0 {
            tracing::warn!("Flush interval is zero; every poll cycle will flush");
        }

        Ok(())
    }

    /// Flush interval as a duration.
    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ingest.flush_interval_seconds)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        crate::Error::Config(format!("{} has an invalid value: {:?}", key, value))
    })
}
