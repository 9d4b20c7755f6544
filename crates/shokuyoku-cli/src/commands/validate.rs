//! Validate command implementation.

use anyhow::Result;
use shokuyoku_core::schema::build_resolver;
use shokuyoku_core::Config;
use std::path::PathBuf;

/// Load and validate configuration, then build the schema resolver so that
/// schema files and metastore addresses are checked too.
pub fn run(path: &Option<PathBuf>) -> Result<()> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let resolver = build_resolver(&config.schema)?;

    println!("Configuration is valid");
    println!("  topic:          {}", config.kafka.topic);
    println!("  consumer group: {}", config.kafka.consumer_group);
    println!("  servers:        {}", config.kafka.bootstrap_servers.join(","));
    println!(
        "  storage:        {}/{}",
        config.storage.location.trim_end_matches('/'),
        config.storage.prefix.trim_matches('/')
    );
    println!("  database:       {}", config.schema.database);
    println!("  schemas:        {}", resolver.name());
    println!(
        "  flush interval: {}s",
        config.ingest.flush_interval_seconds
    );
    if let Some(limit) = config.ingest.max_buffered_records {
        println!("  flush at:       {} buffered records", limit);
    }

    Ok(())
}
