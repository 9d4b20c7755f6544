//! Schemas loaded from a TOML file or registered in code.
//!
//! ```toml
//! [[events]]
//! database = "events"   # optional, matches every database when omitted
//! name = "login"
//! columns = [
//!     { name = "event", type = "string" },
//!     { name = "timestamp", type = "timestamp" },
//!     { name = "user_id", type = "bigint" },
//! ]
//! ```

use super::{ColumnDef, EventSchema, SchemaLookup, SchemaResolver};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    events: Vec<EventEntry>,
}

#[derive(Debug, Deserialize)]
struct EventEntry {
    database: Option<String>,
    name: String,
    columns: Vec<ColumnDef>,
}

/// In-memory schema registry.
#[derive(Debug, Default)]
pub struct StaticSchemaResolver {
    /// Keyed by (database, event type); `None` database matches any.
    schemas: HashMap<(Option<String>, String), Arc<EventSchema>>,
}

impl StaticSchemaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema for one database.
    pub fn with_schema(
        mut self,
        database: impl Into<String>,
        event_type: impl Into<String>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        self.schemas.insert(
            (Some(database.into()), event_type.into()),
            Arc::new(EventSchema::new(columns)),
        );
        self
    }

    /// Register a schema that applies to every database.
    pub fn with_global_schema(mut self, event_type: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        self.schemas
            .insert((None, event_type.into()), Arc::new(EventSchema::new(columns)));
        self
    }

    /// Parse a schema file.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: SchemaFile = toml::from_str(content)?;
        let mut resolver = Self::new();
        for entry in file.events {
            if entry.columns.is_empty() {
                return Err(Error::Schema(format!(
                    "event {} declares no columns",
                    entry.name
                )));
            }
            resolver.schemas.insert(
                (entry.database, entry.name),
                Arc::new(EventSchema::new(entry.columns)),
            );
        }
        Ok(resolver)
    }

    /// Load a schema file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let resolver = Self::from_toml(&content)?;
        info!(
            path = %path.display(),
            schemas = resolver.schemas.len(),
            "Loaded static schemas"
        );
        Ok(resolver)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[async_trait]
impl SchemaResolver for StaticSchemaResolver {
    async fn resolve(&self, database: &str, event_type: &str) -> Result<SchemaLookup> {
        let scoped = self
            .schemas
            .get(&(Some(database.to_string()), event_type.to_string()));
        let found = scoped.or_else(|| self.schemas.get(&(None, event_type.to_string())));

        Ok(match found {
            Some(schema) => SchemaLookup::Found(Arc::clone(schema)),
            None => SchemaLookup::Unknown,
        })
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
