//! Prometheus metrics export.
//!
//! Metrics are best effort: recording never fails and never blocks the
//! ingestion loop.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

const NAMESPACE: &str = "shokuyoku";

/// Flush duration buckets in seconds.
const FLUSH_DURATION_BUCKETS: [f64; 7] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Poll batch size buckets in messages.
const POLL_SIZE_BUCKETS: [f64; 9] = [0.0, 1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

/// Why a message never reached a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Envelope could not be decoded
    MalformedFrame,
    /// Payload was not a JSON object
    MalformedPayload,
    MissingTimestamp,
    MissingEvent,
    InvalidTimestamp,
    /// No schema for the event type
    UnknownSchema,
    /// Schema backend failed
    SchemaUnavailable,
}

impl DropReason {
    pub const ALL: [DropReason; 7] = [
        DropReason::MalformedFrame,
        DropReason::MalformedPayload,
        DropReason::MissingTimestamp,
        DropReason::MissingEvent,
        DropReason::InvalidTimestamp,
        DropReason::UnknownSchema,
        DropReason::SchemaUnavailable,
    ];

    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            DropReason::MalformedFrame => "malformed_frame",
            DropReason::MalformedPayload => "malformed_payload",
            DropReason::MissingTimestamp => "missing_timestamp",
            DropReason::MissingEvent => "missing_event",
            DropReason::InvalidTimestamp => "invalid_timestamp",
            DropReason::UnknownSchema => "unknown_schema",
            DropReason::SchemaUnavailable => "schema_unavailable",
        }
    }
}

/// Result label for flush counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written,
    Failed,
}

impl FlushOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            FlushOutcome::Written => "written",
            FlushOutcome::Failed => "failed",
        }
    }
}

/// Ingestion metrics with counters, gauges, and histograms.
pub struct IngestionMetrics {
    registry: Registry,

    messages_total: IntCounter,
    dropped_total: IntCounterVec,
    buffers_created_total: IntCounter,
    flushes_total: IntCounterVec,
    rows_flushed_total: IntCounter,
    coercion_failures_total: IntCounter,
    commits_total: IntCounter,
    commit_failures_total: IntCounter,

    active_buffers: IntGauge,
    buffered_records: IntGauge,

    poll_batch_size: Histogram,
    flush_duration_seconds: Histogram,
}

impl IngestionMetrics {
    /// Create metrics registered in a fresh registry.
    pub fn new() -> crate::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics registered in `registry`.
    pub fn with_registry(registry: Registry) -> crate::Result<Self> {
        let messages_total = IntCounter::with_opts(
            Opts::new("messages_total", "Total messages consumed from the stream")
                .namespace(NAMESPACE),
        )?;
        let dropped_total = IntCounterVec::new(
            Opts::new("messages_dropped_total", "Messages dropped before buffering")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let buffers_created_total = IntCounter::with_opts(
            Opts::new("buffers_created_total", "Event buffers created").namespace(NAMESPACE),
        )?;
        let flushes_total = IntCounterVec::new(
            Opts::new("flushes_total", "Event buffer flushes by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let rows_flushed_total = IntCounter::with_opts(
            Opts::new("rows_flushed_total", "Rows written to storage").namespace(NAMESPACE),
        )?;
        let coercion_failures_total = IntCounter::with_opts(
            Opts::new(
                "coercion_failures_total",
                "Values written as null because they did not match the column type",
            )
            .namespace(NAMESPACE),
        )?;
        let commits_total = IntCounter::with_opts(
            Opts::new("offset_commits_total", "Successful offset commits").namespace(NAMESPACE),
        )?;
        let commit_failures_total = IntCounter::with_opts(
            Opts::new("offset_commit_failures_total", "Failed offset commits")
                .namespace(NAMESPACE),
        )?;
        let active_buffers = IntGauge::with_opts(
            Opts::new("active_buffers", "Event buffers currently open").namespace(NAMESPACE),
        )?;
        let buffered_records = IntGauge::with_opts(
            Opts::new("buffered_records", "Records held across all open buffers")
                .namespace(NAMESPACE),
        )?;
        let poll_batch_size = Histogram::with_opts(
            HistogramOpts::new("poll_batch_size", "Messages returned per poll")
                .namespace(NAMESPACE)
                .buckets(POLL_SIZE_BUCKETS.to_vec()),
        )?;
        let flush_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Duration of event buffer flushes",
            )
            .namespace(NAMESPACE)
            .buckets(FLUSH_DURATION_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(dropped_total.clone()))?;
        registry.register(Box::new(buffers_created_total.clone()))?;
        registry.register(Box::new(flushes_total.clone()))?;
        registry.register(Box::new(rows_flushed_total.clone()))?;
        registry.register(Box::new(coercion_failures_total.clone()))?;
        registry.register(Box::new(commits_total.clone()))?;
        registry.register(Box::new(commit_failures_total.clone()))?;
        registry.register(Box::new(active_buffers.clone()))?;
        registry.register(Box::new(buffered_records.clone()))?;
        registry.register(Box::new(poll_batch_size.clone()))?;
        registry.register(Box::new(flush_duration_seconds.clone()))?;

        // Pre-create every label so dashboards see zeros.
        for reason in DropReason::ALL {
            dropped_total.with_label_values(&[reason.as_label()]);
        }
        for outcome in [FlushOutcome::Written, FlushOutcome::Failed] {
            flushes_total.with_label_values(&[outcome.as_label()]);
        }

        Ok(Self {
            registry,
            messages_total,
            dropped_total,
            buffers_created_total,
            flushes_total,
            rows_flushed_total,
            coercion_failures_total,
            commits_total,
            commit_failures_total,
            active_buffers,
            buffered_records,
            poll_batch_size,
            flush_duration_seconds,
        })
    }

    // === RECORDING ===

    /// Record one poll cycle and the number of messages it returned.
    pub fn record_poll(&self, batch_size: usize) {
        self.poll_batch_size.observe(batch_size as f64);
        self.messages_total.inc_by(batch_size as u64);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.dropped_total
            .with_label_values(&[reason.as_label()])
            .inc();
    }

    pub fn record_buffer_created(&self) {
        self.buffers_created_total.inc();
    }

    /// Record a successful flush.
    pub fn record_flush(&self, rows: usize, coercion_failures: usize, duration: Duration) {
        self.flushes_total
            .with_label_values(&[FlushOutcome::Written.as_label()])
            .inc();
        self.rows_flushed_total.inc_by(rows as u64);
        self.coercion_failures_total
            .inc_by(coercion_failures as u64);
        self.flush_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_flush_failure(&self) {
        self.flushes_total
            .with_label_values(&[FlushOutcome::Failed.as_label()])
            .inc();
    }

    pub fn record_commit(&self) {
        self.commits_total.inc();
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures_total.inc();
    }

    /// Update buffer gauges.
    pub fn set_buffers(&self, active: usize, records: usize) {
        self.active_buffers.set(active as i64);
        self.buffered_records.set(records as i64);
    }

    // === GETTERS ===

    pub fn messages_total(&self) -> u64 {
        self.messages_total.get()
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped_total
            .with_label_values(&[reason.as_label()])
            .get()
    }

    pub fn dropped_total(&self) -> u64 {
        DropReason::ALL.iter().map(|r| self.dropped(*r)).sum()
    }

    pub fn buffers_created_total(&self) -> u64 {
        self.buffers_created_total.get()
    }

    pub fn flushes(&self, outcome: FlushOutcome) -> u64 {
        self.flushes_total
            .with_label_values(&[outcome.as_label()])
            .get()
    }

    pub fn rows_flushed_total(&self) -> u64 {
        self.rows_flushed_total.get()
    }

    pub fn coercion_failures_total(&self) -> u64 {
        self.coercion_failures_total.get()
    }

    pub fn commits_total(&self) -> u64 {
        self.commits_total.get()
    }

    pub fn commit_failures_total(&self) -> u64 {
        self.commit_failures_total.get()
    }

    pub fn active_buffers(&self) -> i64 {
        self.active_buffers.get()
    }

    pub fn buffered_records(&self) -> i64 {
        self.buffered_records.get()
    }

    /// Number of poll cycles observed.
    pub fn poll_count(&self) -> u64 {
        self.poll_batch_size.get_sample_count()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use shokuyoku_core::metrics::IngestionMetrics;
    ///
    /// let metrics = IngestionMetrics::new().unwrap();
    /// metrics.record_poll(3);
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("shokuyoku_messages_total 3"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
