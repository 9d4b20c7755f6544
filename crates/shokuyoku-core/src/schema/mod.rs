//! Event schema lookup.
//!
//! Every buffer is created against the column schema of its event type.
//! Schemas come from a [`SchemaResolver`]:
//!
//! - [`HiveSchemaResolver`] reads table columns from a Hive Metastore
//! - [`StaticSchemaResolver`] serves schemas from a TOML file or from code
//! - [`CachingSchemaResolver`] wraps either with TTL-based caching
//!
//! A missing schema is [`SchemaLookup::Unknown`], not an error. Errors are
//! reserved for backend failures.

mod cache;
mod file;
mod hive;

pub use cache::{CacheStats, CachedValue, CachingSchemaResolver};
pub use file::StaticSchemaResolver;
pub use hive::HiveSchemaResolver;

use crate::config::SchemaConfig;
use crate::Result;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Column types a buffer can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
    Binary,
    Date,
    Timestamp,
}

impl ColumnType {
    /// Map a Hive column type name onto a column type.
    ///
    /// Parameterized types (`varchar(64)`, `decimal(10,2)`) use their base
    /// name. Complex and unrecognized types are stored as strings.
    pub fn from_hive(hive_type: &str) -> Self {
        let lower = hive_type.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();
        match base {
            "boolean" | "bool" => ColumnType::Boolean,
            "tinyint" | "smallint" | "int" | "integer" => ColumnType::Int,
            "bigint" | "long" => ColumnType::Long,
            "float" => ColumnType::Float,
            "double" | "decimal" | "numeric" => ColumnType::Double,
            "binary" => ColumnType::Binary,
            "date" => ColumnType::Date,
            "timestamp" => ColumnType::Timestamp,
            _ => ColumnType::String,
        }
    }

    /// Arrow type used when building the columnar file.
    pub fn arrow_type(&self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int => DataType::Int32,
            ColumnType::Long => DataType::Int64,
            ColumnType::Float => DataType::Float32,
            ColumnType::Double => DataType::Float64,
            ColumnType::String => DataType::Utf8,
            ColumnType::Binary => DataType::Binary,
            ColumnType::Date => DataType::Date32,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Int => "int",
            ColumnType::Long => "bigint",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::String => "string",
            ColumnType::Binary => "binary",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
        }
    }
}

impl From<String> for ColumnType {
    fn from(value: String) -> Self {
        ColumnType::from_hive(&value)
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Ordered column schema for one event type. Immutable once built.
#[derive(Debug, Clone)]
pub struct EventSchema {
    columns: Vec<ColumnDef>,
    by_name: HashMap<String, usize>,
}

impl EventSchema {
    /// Build a schema. On duplicate names the first column wins.
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        let mut by_name = HashMap::with_capacity(columns.len());
        for (idx, col) in columns.iter().enumerate() {
            by_name.entry(col.name.to_lowercase()).or_insert(idx);
        }
        Self { columns, by_name }
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column index fed by a record field.
    ///
    /// Matching is case-insensitive, and a dotted field path also matches the
    /// column spelled with underscores (`user.id` feeds `user_id`).
    pub fn column_for_field(&self, field: &str) -> Option<usize> {
        let lower = field.to_lowercase();
        if let Some(idx) = self.by_name.get(&lower) {
            return Some(*idx);
        }
        if lower.contains('.') {
            return self.by_name.get(&lower.replace('.', "_")).copied();
        }
        None
    }

    /// Arrow schema with every column nullable.
    pub fn arrow_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns
            .iter()
            .map(|c| Field::new(&c.name, c.column_type.arrow_type(), true))
            .collect();
        Arc::new(Schema::new(fields))
    }
}

impl PartialEq for EventSchema {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
    }
}

/// Outcome of a schema lookup.
#[derive(Debug, Clone)]
pub enum SchemaLookup {
    Found(Arc<EventSchema>),
    Unknown,
}

impl SchemaLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, SchemaLookup::Found(_))
    }
}

/// Source of event schemas.
///
/// Implementations must be cheap enough to call once per buffer creation,
/// which can happen at message rate when schemas are missing.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// Look up the schema of `event_type` in `database`.
    async fn resolve(&self, database: &str, event_type: &str) -> Result<SchemaLookup>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Build the resolver chain described by the configuration.
///
/// A schema file takes precedence over the metastore. The result is always
/// wrapped in a [`CachingSchemaResolver`].
pub fn build_resolver(config: &SchemaConfig) -> Result<Arc<dyn SchemaResolver>> {
    let inner: Arc<dyn SchemaResolver> = match (&config.schema_file, &config.hive_metastore_uri) {
        (Some(path), _) => Arc::new(StaticSchemaResolver::from_file(path)?),
        (None, Some(uri)) => Arc::new(
            HiveSchemaResolver::new(uri)?
                .with_timeout(Duration::from_millis(config.request_timeout_ms)),
        ),
        (None, None) => {
            return Err(crate::Error::Config(
                "Either schema_file or hive_metastore_uri is required".into(),
            ))
        }
    };

    let mut caching =
        CachingSchemaResolver::new(inner, Duration::from_secs(config.cache_ttl_seconds));
    if let Some(secs) = config.negative_cache_ttl_seconds {
        caching = caching.with_negative_ttl(Duration::from_secs(secs));
    }

    Ok(Arc::new(caching))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hive_type_mapping() {
        assert_eq!(ColumnType::from_hive("boolean"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_hive("TINYINT"), ColumnType::Int);
        assert_eq!(ColumnType::from_hive("smallint"), ColumnType::Int);
        assert_eq!(ColumnType::from_hive("bigint"), ColumnType::Long);
        assert_eq!(ColumnType::from_hive("decimal(10,2)"), ColumnType::Double);
        assert_eq!(ColumnType::from_hive("varchar(255)"), ColumnType::String);
        assert_eq!(ColumnType::from_hive("char(3)"), ColumnType::String);
        assert_eq!(ColumnType::from_hive("timestamp"), ColumnType::Timestamp);
        assert_eq!(ColumnType::from_hive("array<string>"), ColumnType::String);
        assert_eq!(ColumnType::from_hive("struct<a:int>"), ColumnType::String);
    }

    #[test]
    fn test_column_for_field() {
        let schema = EventSchema::new(vec![
            ColumnDef::new("event", ColumnType::String),
            ColumnDef::new("user_id", ColumnType::Long),
            ColumnDef::new("userName", ColumnType::String),
        ]);

        assert_eq!(schema.column_for_field("event"), Some(0));
        assert_eq!(schema.column_for_field("user.id"), Some(1));
        assert_eq!(schema.column_for_field("user_id"), Some(1));
        assert_eq!(schema.column_for_field("username"), Some(2));
        assert_eq!(schema.column_for_field("other"), None);
    }

    #[test]
    fn test_duplicate_columns_first_wins() {
        let schema = EventSchema::new(vec![
            ColumnDef::new("a", ColumnType::String),
            ColumnDef::new("A", ColumnType::Long),
        ]);
        assert_eq!(schema.column_for_field("a"), Some(0));
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn test_arrow_schema() {
        let schema = EventSchema::new(vec![
            ColumnDef::new("event", ColumnType::String),
            ColumnDef::new("day", ColumnType::Date),
        ]);
        let arrow = schema.arrow_schema();
        assert_eq!(arrow.fields().len(), 2);
        assert_eq!(arrow.field(1).data_type(), &DataType::Date32);
        assert!(arrow.field(0).is_nullable());
    }

    #[test]
    fn test_column_type_serde() {
        let col: ColumnDef = toml::from_str("name = \"n\"\ntype = \"bigint\"").unwrap();
        assert_eq!(col.column_type, ColumnType::Long);
        assert_eq!(String::from(ColumnType::Long), "bigint");
    }
}
