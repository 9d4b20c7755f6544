//! Decode command implementation.

use anyhow::{Context, Result};
use shokuyoku_core::frame::{self, ByteOrder};
use shokuyoku_core::normalize;
use std::path::Path;

/// Print the event type and flattened record of one raw frame.
pub fn run(file: &Path, order: ByteOrder) -> Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    println!("{}", render(&raw, order)?);
    Ok(())
}

fn render(raw: &[u8], order: ByteOrder) -> Result<String> {
    let frame = frame::decode(raw, order).map_err(shokuyoku_core::Error::from)?;
    let record = normalize::normalize(&frame.payload).map_err(shokuyoku_core::Error::from)?;

    let partition = match normalize::partition_key(&frame.event_type, &record) {
        Ok(key) => serde_json::Value::String(key.to_string()),
        Err(rejection) => serde_json::json!({ "rejected": rejection.reason() }),
    };

    let output = serde_json::json!({
        "event_type": frame.event_type,
        "partition": partition,
        "record": record,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}
