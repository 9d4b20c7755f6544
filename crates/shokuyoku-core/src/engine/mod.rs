//! Ingestion loop orchestration.

mod ingestion;

pub use ingestion::{CycleReport, EngineSettings, IngestionEngine};
