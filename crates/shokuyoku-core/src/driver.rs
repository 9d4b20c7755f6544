//! Per-(event type, date) event buffer.
//!
//! An [`EventDriver`] accumulates normalized records for one partition key
//! and flushes them once, as a single Parquet file, through a
//! [`StorageSink`]. State only moves forward:
//!
//! ```text
//! Open ──flush──▶ Flushing ──ok──▶ Flushed
//!                     └────err──▶ Failed
//! ```
//!
//! Records are drained when the flush starts, so a failed flush loses them.
//! The caller decides what that means for offset commits.
//!
//! ## Type coercion
//!
//! Every schema column gets one value per record, in arrival order:
//!
//! - missing field or JSON null: null
//! - compatible value: stored (numeric strings parse, numbers and booleans
//!   render into string columns, dates use the first 10 characters,
//!   timestamps accept RFC 3339 or epoch milliseconds)
//! - anything else: null, counted in [`FlushStats::coercion_failures`]
//!
//! Fields without a matching column are ignored and counted. Rows are never
//! dropped.

use crate::config::ParquetCompression;
use crate::error::BufferError;
use crate::normalize::{FlatRecord, PartitionKey};
use crate::schema::{ColumnType, EventSchema};
use crate::sink::{object_path, StorageSink};
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array, Int32Array,
    Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use crc32fast::Hasher;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle of an [`EventDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Open,
    Flushing,
    Flushed,
    Failed,
}

impl DriverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::Open => "open",
            DriverState::Flushing => "flushing",
            DriverState::Flushed => "flushed",
            DriverState::Failed => "failed",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File layout options shared by every driver of a process.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Database namespace, second path segment
    pub database: String,
    /// Key prefix, first path segment
    pub prefix: String,
    pub compression: ParquetCompression,
    /// Rows per Parquet write batch
    pub batch_size: usize,
}

/// Outcome of a flush.
#[derive(Debug, Clone)]
pub struct FlushStats {
    /// Rows written
    pub rows: usize,
    /// File size in bytes
    pub file_size_bytes: usize,
    /// Object path, `None` when there was nothing to write
    pub path: Option<String>,
    /// CRC32 of the file
    pub checksum: Option<String>,
    /// Values that could not be coerced and were stored as null
    pub coercion_failures: usize,
    /// Record fields with no matching column
    pub unmatched_fields: usize,
    /// Whether this was a shutdown flush
    pub is_final: bool,
    pub duration: Duration,
}

/// Buffer for one partition key.
pub struct EventDriver {
    key: PartitionKey,
    schema: Arc<EventSchema>,
    options: Arc<WriteOptions>,
    records: Vec<FlatRecord>,
    state: DriverState,
}

impl EventDriver {
    pub fn new(key: PartitionKey, schema: Arc<EventSchema>, options: Arc<WriteOptions>) -> Self {
        debug!(
            event_type = %key.event_type,
            date = %key.date,
            columns = schema.len(),
            "Creating event driver"
        );
        Self {
            key,
            schema,
            options,
            records: Vec::new(),
            state: DriverState::Open,
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a record. Content is never inspected here.
    pub fn add_record(&mut self, record: FlatRecord) -> Result<(), BufferError> {
        if self.state != DriverState::Open {
            return Err(BufferError::InvalidState {
                operation: "add_record",
                state: self.state.as_str(),
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Serialize every buffered record into one file and write it.
    ///
    /// `is_final` marks shutdown flushes; the write is identical.
    pub async fn flush(
        &mut self,
        sink: &dyn StorageSink,
        is_final: bool,
    ) -> Result<FlushStats, BufferError> {
        if self.state != DriverState::Open {
            return Err(BufferError::InvalidState {
                operation: "flush",
                state: self.state.as_str(),
            });
        }
        self.state = DriverState::Flushing;
        let start = Instant::now();
        let records = std::mem::take(&mut self.records);

        if records.is_empty() {
            self.state = DriverState::Flushed;
            return Ok(FlushStats {
                rows: 0,
                file_size_bytes: 0,
                path: None,
                checksum: None,
                coercion_failures: 0,
                unmatched_fields: 0,
                is_final,
                duration: start.elapsed(),
            });
        }

        match self.write_file(sink, &records, is_final, start).await {
            Ok(stats) => {
                self.state = DriverState::Flushed;
                Ok(stats)
            }
            Err(e) => {
                self.state = DriverState::Failed;
                Err(e)
            }
        }
    }

    async fn write_file(
        &self,
        sink: &dyn StorageSink,
        records: &[FlatRecord],
        is_final: bool,
        start: Instant,
    ) -> Result<FlushStats, BufferError> {
        let converted = build_batch(&self.schema, records)?;
        let parquet_bytes = self.convert_to_parquet(&converted.batch)?;
        let file_size_bytes = parquet_bytes.len();

        let mut hasher = Hasher::new();
        hasher.update(&parquet_bytes);
        let checksum = format!("{:08x}", hasher.finalize());

        let path = object_path(&self.options.prefix, &self.options.database, &self.key);
        sink.write(&path, parquet_bytes).await?;

        let duration = start.elapsed();
        info!(
            event_type = %self.key.event_type,
            date = %self.key.date,
            rows = records.len(),
            size_bytes = file_size_bytes,
            checksum = %checksum,
            coercion_failures = converted.coercion_failures,
            unmatched_fields = converted.unmatched_fields,
            is_final = is_final,
            duration_ms = duration.as_millis() as u64,
            path = %path,
            "Event driver flushed"
        );

        Ok(FlushStats {
            rows: records.len(),
            file_size_bytes,
            path: Some(path),
            checksum: Some(checksum),
            coercion_failures: converted.coercion_failures,
            unmatched_fields: converted.unmatched_fields,
            is_final,
            duration,
        })
    }

    fn convert_to_parquet(&self, batch: &RecordBatch) -> Result<Bytes, BufferError> {
        let mut buffer = Cursor::new(Vec::new());

        let compression = match self.options.compression {
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(Default::default()),
            ParquetCompression::Lz4 => Compression::LZ4,
            ParquetCompression::Zstd => Compression::ZSTD(Default::default()),
            ParquetCompression::None => Compression::UNCOMPRESSED,
        };

        let props = WriterProperties::builder()
            .set_compression(compression)
            .set_write_batch_size(self.options.batch_size.max(1))
            .build();

        let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
        writer.write(batch)?;
        writer.close()?;

        Ok(Bytes::from(buffer.into_inner()))
    }
}

/// A record batch plus coercion counters.
pub(crate) struct ConvertedBatch {
    pub batch: RecordBatch,
    pub coercion_failures: usize,
    pub unmatched_fields: usize,
}

/// Lay records out column-wise against `schema`.
pub(crate) fn build_batch(
    schema: &EventSchema,
    records: &[FlatRecord],
) -> Result<ConvertedBatch, BufferError> {
    let width = schema.len();
    let mut unmatched_fields = 0;

    // cells[row][col]; a later field feeding the same column replaces an earlier one
    let mut cells: Vec<Vec<Option<&Value>>> = Vec::with_capacity(records.len());
    for record in records {
        let mut row = vec![None; width];
        for (field, value) in record {
            match schema.column_for_field(field) {
                Some(idx) => row[idx] = Some(value),
                None => unmatched_fields += 1,
            }
        }
        cells.push(row);
    }

    let mut coercion_failures = 0;
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(width);
    for (idx, column) in schema.columns().iter().enumerate() {
        let values = cells.iter().map(|row| row[idx]);
        let mut coerce = Coercer {
            failures: &mut coercion_failures,
        };
        let array: ArrayRef = match column.column_type {
            ColumnType::Boolean => Arc::new(
                values
                    .map(|v| coerce.apply(v, as_bool))
                    .collect::<BooleanArray>(),
            ),
            ColumnType::Int => Arc::new(
                values
                    .map(|v| coerce.apply(v, as_i32))
                    .collect::<Int32Array>(),
            ),
            ColumnType::Long => Arc::new(
                values
                    .map(|v| coerce.apply(v, as_i64))
                    .collect::<Int64Array>(),
            ),
            ColumnType::Float => Arc::new(
                values
                    .map(|v| coerce.apply(v, |v| as_f64(v).map(|f| f as f32)))
                    .collect::<Float32Array>(),
            ),
            ColumnType::Double => Arc::new(
                values
                    .map(|v| coerce.apply(v, as_f64))
                    .collect::<Float64Array>(),
            ),
            ColumnType::String => Arc::new(
                values
                    .map(|v| coerce.apply(v, as_string))
                    .collect::<StringArray>(),
            ),
            ColumnType::Binary => Arc::new(
                values
                    .map(|v| coerce.apply(v, |v| as_string(v).map(String::into_bytes)))
                    .collect::<BinaryArray>(),
            ),
            ColumnType::Date => Arc::new(
                values
                    .map(|v| coerce.apply(v, as_epoch_days))
                    .collect::<Date32Array>(),
            ),
            ColumnType::Timestamp => Arc::new(
                values
                    .map(|v| coerce.apply(v, as_epoch_millis))
                    .collect::<TimestampMillisecondArray>(),
            ),
        };
        arrays.push(array);
    }

    let batch = RecordBatch::try_new(schema.arrow_schema(), arrays)?;

    Ok(ConvertedBatch {
        batch,
        coercion_failures,
        unmatched_fields,
    })
}

struct Coercer<'a> {
    failures: &'a mut usize,
}

impl Coercer<'_> {
    fn apply<T>(&mut self, value: Option<&Value>, f: impl Fn(&Value) -> Option<T>) -> Option<T> {
        match value {
            None | Some(Value::Null) => None,
            Some(v) => {
                let out = f(v);
                if out.is_none() {
                    *self.failures += 1;
                }
                out
            }
        }
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_i32(value: &Value) -> Option<i32> {
    as_i64(value).and_then(|v| i32::try_from(v).ok())
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn as_epoch_days(value: &Value) -> Option<i32> {
    let s = value.as_str()?;
    let date = NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok()?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    i32::try_from(date.signed_duration_since(epoch).num_days()).ok()
}

fn as_epoch_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.timestamp_millis());
            }
            // Numeric offsets such as +0000.
            if let Some(ts) = ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"]
                .iter()
                .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
            {
                return Some(ts.timestamp_millis());
            }
            if let Some(ts) = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            {
                return Some(ts.and_utc().timestamp_millis());
            }
            // A bare date is midnight UTC.
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|ts| ts.and_utc().timestamp_millis())
        }
        _ => None,
    }
}
