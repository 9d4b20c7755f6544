//! Durable storage for finished columnar files.
//!
//! A [`StorageSink`] writes one whole file per call. The default
//! implementation, [`ObjectStoreSink`], targets S3 (or any S3-compatible
//! endpoint), a local directory, or an in-memory store for tests.
//!
//! Object paths follow `<prefix>/<database>/<event_type>/<YYYY-MM-DD>/<uuid>.parquet`.

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::normalize::PartitionKey;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Destination for finished files.
///
/// Writes to distinct paths may run concurrently. Writing an existing path
/// replaces it.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn write(&self, path: &str, data: Bytes) -> Result<(), StorageError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Build the object path for a new file under `prefix`.
pub fn object_path(prefix: &str, database: &str, key: &PartitionKey) -> String {
    let prefix = prefix.trim_matches('/');
    let file = format!("{}.parquet", Uuid::new_v4());
    let date = key.date.format("%Y-%m-%d");
    if prefix.is_empty() {
        format!("{}/{}/{}/{}", database, key.event_type, date, file)
    } else {
        format!("{}/{}/{}/{}/{}", prefix, database, key.event_type, date, file)
    }
}

/// [`StorageSink`] over an [`ObjectStore`].
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    location: String,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>, location: impl Into<String>) -> Self {
        Self {
            store,
            location: location.into(),
        }
    }

    /// In-memory sink, mainly for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory://")
    }

    /// Create a sink based on configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let location = config.location.as_str();
        let store = if location.starts_with("s3://") {
            create_s3_store(config)?
        } else if location.starts_with("memory://") {
            Arc::new(InMemory::new()) as Arc<dyn ObjectStore>
        } else {
            create_local_store(location.strip_prefix("file://").unwrap_or(location))?
        };
        Ok(Self::new(store, location))
    }

    /// Underlying store, used by tests to read files back.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }
}

fn create_s3_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    use object_store::aws::AmazonS3Builder;

    let bucket = config
        .location
        .strip_prefix("s3://")
        .and_then(|s| s.split('/').next())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StorageError::Setup(format!("Invalid S3 location: {}", config.location)))?;

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

    if let Some(ref region) = config.aws_region {
        builder = builder.with_region(region);
    }

    if let Some(ref access_key) = config.aws_access_key_id {
        builder = builder.with_access_key_id(access_key);
    }

    if let Some(ref secret_key) = config.aws_secret_access_key {
        builder = builder.with_secret_access_key(secret_key);
    }

    if let Some(ref endpoint) = config.s3_endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }

    let store = builder
        .build()
        .map_err(|e| StorageError::Setup(e.to_string()))?;

    Ok(Arc::new(store))
}

fn create_local_store(dir: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
    use object_store::local::LocalFileSystem;

    let path = std::path::Path::new(dir);

    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Setup(format!("Failed to create local storage directory: {}", e))
        })?;
    }

    let store = LocalFileSystem::new_with_prefix(path).map_err(|e| {
        StorageError::Setup(format!("Failed to create local file system store: {}", e))
    })?;

    Ok(Arc::new(store))
}

#[async_trait]
impl StorageSink for ObjectStoreSink {
    async fn write(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let object_path =
            ObjectPath::parse(path).map_err(|e| StorageError::InvalidPath(e.to_string()))?;
        let size = data.len();
        let payload = PutPayload::from_bytes(data);

        self.store
            .put(&object_path, payload)
            .await
            .map_err(|e| StorageError::WriteFailed {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        debug!(path = %path, size_bytes = size, "Wrote object");
        Ok(())
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}
