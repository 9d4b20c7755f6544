//! Ingestion metrics.

mod prometheus;

pub use self::prometheus::{DropReason, FlushOutcome, IngestionMetrics};
