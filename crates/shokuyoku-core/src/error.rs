//! Error types for shokuyoku core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Per-message errors (`FrameError`, `PayloadError`) are recoverable: the
//! ingestion loop logs and drops the message. `StorageError` aborts the
//! commit step of a flush cycle. Configuration errors are fatal at startup.

use thiserror::Error;

/// Result type alias for shokuyoku operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for shokuyoku.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// One or more required configuration values were not supplied
    #[error("Missing required configuration: {}", .0.join(", "))]
    MissingConfig(Vec<String>),

    /// Stream-related error
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Frame decoding error
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Payload normalization error
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Event buffer error
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Schema lookup error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Stream (Kafka) errors.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Offset commit failed
    #[error("Offset commit failed: {0}")]
    OffsetCommit(String),

    /// Poll failed
    #[error("Poll failed: {0}")]
    Poll(String),
}

/// A raw frame could not be split into event type and payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes to read a length prefix
    #[error("truncated length field at offset {offset}: need 4 bytes, {available} available")]
    TruncatedLength { offset: usize, available: usize },

    /// A declared length indexes past the end of the frame
    #[error("declared {field} length {declared} exceeds remaining {available} bytes")]
    LengthOverrun {
        field: &'static str,
        declared: usize,
        available: usize,
    },

    /// Event type was empty
    #[error("empty event type")]
    EmptyEventType,

    /// Event type was not valid UTF-8
    #[error("event type is not valid UTF-8")]
    InvalidEventType,

    /// Bytes remained after the payload
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// A payload could not be normalized into a flat record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// Payload was not parseable JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Payload parsed but its top level is not an object
    #[error("top-level value is a {0}, expected object")]
    NotAnObject(&'static str),
}

/// Event buffer errors.
#[derive(Error, Debug)]
pub enum BufferError {
    /// Operation not allowed in the driver's current state
    #[error("Invalid driver state: {operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Arrow conversion error
    #[error("Arrow conversion error: {0}")]
    ArrowConversion(String),

    /// Parquet write error
    #[error("Parquet write error: {0}")]
    ParquetWrite(String),

    /// Sink rejected the finished file
    #[error("Storage write failed: {0}")]
    Storage(#[from] StorageError),
}

/// Storage sink errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend could not be constructed
    #[error("Storage backend setup failed: {0}")]
    Setup(String),

    /// Write to the backend failed
    #[error("Write to {path} failed: {message}")]
    WriteFailed { path: String, message: String },

    /// Invalid object path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for BufferError {
    fn from(err: arrow::error::ArrowError) -> Self {
        BufferError::ArrowConversion(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for BufferError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        BufferError::ParquetWrite(err.to_string())
    }
}
