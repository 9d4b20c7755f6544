//! Hive Metastore schema lookup.
//!
//! The event type is the table name and the configured database is the Hive
//! database. Columns come from the table's storage descriptor. A
//! `NoSuchObjectException` means the event type is unknown; every other
//! failure is reported as an error so it is never cached.

use super::{ColumnDef, ColumnType, EventSchema, SchemaLookup, SchemaResolver};
use crate::{Error, Result};
use async_trait::async_trait;
use hive_metastore::{ThriftHiveMetastoreClient, ThriftHiveMetastoreClientBuilder};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use volo_thrift::MaybeException;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema resolver backed by a Hive Metastore.
pub struct HiveSchemaResolver {
    client: ThriftHiveMetastoreClient,
    uri: String,
    timeout: Duration,
}

impl HiveSchemaResolver {
    /// Create a resolver for a metastore at `thrift://host:port` or `host:port`.
    ///
    /// The Thrift client connects lazily on the first lookup.
    pub fn new(uri: &str) -> Result<Self> {
        let (host, port) = parse_thrift_uri(uri)?;
        let socket_addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::Config(format!(
                    "Failed to resolve Hive Metastore address {}:{}: {}",
                    host, port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::Config(format!("No address found for Hive Metastore {}:{}", host, port))
            })?;

        let client = ThriftHiveMetastoreClientBuilder::new("shokuyoku-schema")
            .address(socket_addr)
            .build();

        info!(uri = %uri, "Hive Metastore schema resolver initialized");

        Ok(Self {
            client,
            uri: uri.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Deadline for one `get_table` call, connection included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl SchemaResolver for HiveSchemaResolver {
    async fn resolve(&self, database: &str, event_type: &str) -> Result<SchemaLookup> {
        let request = self
            .client
            .get_table(database.to_string().into(), event_type.to_string().into());
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| {
                warn!(
                    uri = %self.uri,
                    table = %event_type,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Hive Metastore lookup timed out"
                );
                Error::Schema(format!(
                    "Hive Metastore lookup of {}.{} timed out after {:?}",
                    database, event_type, self.timeout
                ))
            })?
            .map_err(|e| Error::Schema(format!("Failed to load Hive table: {}", e)))?;

        match response {
            MaybeException::Ok(table) => {
                let columns = columns_of(&table);
                if columns.is_empty() {
                    warn!(
                        database = %database,
                        table = %event_type,
                        "Hive table has no columns, treating as unknown"
                    );
                    return Ok(SchemaLookup::Unknown);
                }
                debug!(
                    database = %database,
                    table = %event_type,
                    columns = columns.len(),
                    "Loaded schema from Hive Metastore"
                );
                Ok(SchemaLookup::Found(Arc::new(EventSchema::new(columns))))
            }
            MaybeException::Exception(e) => {
                let error_str = format!("{:?}", e);
                if error_str.contains("NoSuchObjectException") {
                    Ok(SchemaLookup::Unknown)
                } else {
                    Err(Error::Schema(format!(
                        "Hive exception loading table {}.{}: {}",
                        database, event_type, error_str
                    )))
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "hive"
    }
}

fn columns_of(table: &hive_metastore::Table) -> Vec<ColumnDef> {
    table
        .sd
        .as_ref()
        .and_then(|sd| sd.cols.as_ref())
        .map(|cols| {
            cols.iter()
                .filter_map(|col| {
                    let name = col.name.as_ref()?.to_string();
                    let hive_type = col.r#type.as_ref().map(|s| s.as_str()).unwrap_or("string");
                    Some(ColumnDef::new(name, ColumnType::from_hive(hive_type)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a Thrift URI (thrift://host:port) into host and port.
fn parse_thrift_uri(uri: &str) -> Result<(String, u16)> {
    let uri = uri.strip_prefix("thrift://").unwrap_or(uri);

    let parts: Vec<&str> = uri.split(':').collect();
    if parts.len() != 2 {
        return Err(Error::Config(format!(
            "Invalid Hive Metastore URI format: {}. Expected thrift://host:port",
            uri
        )));
    }

    let host = parts[0].to_string();
    let port = parts[1].parse::<u16>().map_err(|_| {
        Error::Config(format!("Invalid port in Hive Metastore URI: {}", parts[1]))
    })?;

    Ok((host, port))
}
