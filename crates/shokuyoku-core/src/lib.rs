//! shokuyoku core - event ingestion from Kafka to columnar object storage
//!
//! This library consumes framed binary events from a Kafka topic and lands
//! them as Parquet files partitioned by event type and date:
//!
//! - Length-prefixed frame decoding with configurable byte order
//! - JSON flattening into dotted-path records
//! - Schema-driven buffering per (event type, date)
//! - Offset commits gated on successful flushes

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod frame;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod normalize;
pub mod schema;
pub mod sink;

// Re-export commonly used types
pub use config::Config;
pub use engine::{CycleReport, EngineSettings, IngestionEngine};
pub use error::{BufferError, FrameError, PayloadError, StorageError, StreamError};
pub use error::{Error, Result};
