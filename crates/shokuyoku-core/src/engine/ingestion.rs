//! Main ingestion engine.
//!
//! Ties the pipeline together:
//! - poll framed messages from a [`MessageSource`]
//! - decode, normalize, and route each record to the [`EventDriver`] for its
//!   (event type, date) key, creating drivers on demand from the schema
//!   resolver
//! - every flush interval, flush all drivers and commit the stream position
//!
//! Offsets are committed only when every flush of the cycle succeeded, so no
//! record is committed as consumed before it is durably written. All state
//! lives on one task and is never shared.

use crate::config::Config;
use crate::driver::{EventDriver, WriteOptions};
use crate::frame::{self, ByteOrder};
use crate::health::{Component, HealthCheck};
use crate::kafka::{KafkaSource, KafkaSourceBuilder, MessageSource, SourceMessage};
use crate::metrics::{DropReason, IngestionMetrics};
use crate::normalize::{self, PartitionKey, RecordRejection};
use crate::schema::{build_resolver, SchemaLookup, SchemaResolver};
use crate::sink::{ObjectStoreSink, StorageSink};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loop tuning, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Schema namespace for lookups
    pub database: String,
    pub byte_order: ByteOrder,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub flush_interval: Duration,
    /// Flush early once this many records are buffered
    pub max_buffered_records: Option<usize>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            database: config.schema.database.clone(),
            byte_order: config.ingest.byte_order,
            max_poll_records: config.kafka.max_poll_records,
            poll_timeout: Duration::from_millis(config.kafka.poll_timeout_ms),
            flush_interval: config.flush_interval(),
            max_buffered_records: config.ingest.max_buffered_records,
        }
    }
}

/// Outcome of one flush-and-commit cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Drivers flushed without error, including empty ones
    pub flushed: usize,
    pub failed: usize,
    pub rows_written: usize,
    /// Records dropped with a failed driver
    pub records_lost: usize,
    /// Cursor value committed in this cycle
    pub committed: Option<i64>,
    pub is_final: bool,
}

impl CycleReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Main ingestion engine.
pub struct IngestionEngine<S: MessageSource> {
    settings: EngineSettings,
    source: S,
    resolver: Arc<dyn SchemaResolver>,
    sink: Arc<dyn StorageSink>,
    write_options: Arc<WriteOptions>,
    /// Active buffer set
    drivers: HashMap<PartitionKey, EventDriver>,
    buffered_records: usize,
    /// Highest offset buffered since the last commit
    commit_cursor: Option<i64>,
    /// Start of the current flush interval, set by the first message
    cycle_started: Option<Instant>,
    metrics: Arc<IngestionMetrics>,
    health: Arc<HealthCheck>,
    shutdown: CancellationToken,
}

impl IngestionEngine<KafkaSource> {
    /// Create an engine reading from Kafka, with the schema resolver and
    /// storage sink described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let resolver = build_resolver(&config.schema)?;
        let sink = Arc::new(ObjectStoreSink::from_config(&config.storage)?);
        let source = KafkaSourceBuilder::new(config.kafka.clone()).build()?;

        let write_options = WriteOptions {
            database: config.schema.database.clone(),
            prefix: config.storage.prefix.clone(),
            compression: config.ingest.compression,
            batch_size: config.ingest.batch_size_hint,
        };

        info!(
            topic = %config.kafka.topic,
            schema_backend = resolver.name(),
            storage = %sink.describe(),
            database = %config.schema.database,
            flush_interval_secs = config.ingest.flush_interval_seconds,
            "Ingestion engine configured"
        );

        Self::new(
            EngineSettings::from_config(config),
            write_options,
            source,
            resolver,
            sink,
        )
    }
}

impl<S: MessageSource> IngestionEngine<S> {
    pub fn new(
        settings: EngineSettings,
        write_options: WriteOptions,
        source: S,
        resolver: Arc<dyn SchemaResolver>,
        sink: Arc<dyn StorageSink>,
    ) -> Result<Self> {
        Ok(Self {
            settings,
            source,
            resolver,
            sink,
            write_options: Arc::new(write_options),
            drivers: HashMap::new(),
            buffered_records: 0,
            commit_cursor: None,
            cycle_started: None,
            metrics: Arc::new(IngestionMetrics::new()?),
            health: Arc::new(HealthCheck::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Share metrics with another owner, such as the HTTP server.
    pub fn with_metrics(mut self, metrics: Arc<IngestionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = health;
        self
    }

    /// Use an externally owned shutdown token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Run until the shutdown token is cancelled, then flush once more.
    ///
    /// The token is checked at the top of each iteration only; an
    /// iteration in progress, including its flush, always completes.
    pub async fn run(&mut self) -> Result<()> {
        self.health.worker_started();
        info!(source = %self.source.describe(), "Ingestion engine started");

        while !self.shutdown.is_cancelled() {
            if let Err(e) = self.poll_once().await {
                warn!(error = %e, "Poll failed");
            }

            if self.should_flush() {
                self.flush_cycle(false).await;
            }
        }

        info!("Shutdown requested, running final flush");
        let report = self.flush_cycle(true).await;
        self.health.worker_stopped();

        info!(
            flushed = report.flushed,
            failed = report.failed,
            rows = report.rows_written,
            committed = ?report.committed,
            "Ingestion engine stopped"
        );
        Ok(())
    }

    /// Poll one batch and route every message in it. Returns the number of
    /// messages received.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let messages = match self
            .source
            .poll_batch(self.settings.max_poll_records, self.settings.poll_timeout)
            .await
        {
            Ok(messages) => {
                self.health.mark_healthy(Component::Stream);
                messages
            }
            Err(e) => {
                self.health
                    .mark_degraded(Component::Stream, format!("Poll failed: {}", e));
                return Err(e);
            }
        };

        let count = messages.len();
        self.metrics.record_poll(count);

        for message in messages {
            if self.cycle_started.is_none() {
                self.cycle_started = Some(Instant::now());
            }
            let (partition, offset) = (message.partition, message.offset);
            if let Err(reason) = self.process_message(message).await {
                self.metrics.record_drop(reason);
                debug!(
                    partition = partition,
                    offset = offset,
                    reason = reason.as_label(),
                    "Message dropped"
                );
            }
        }

        self.metrics
            .set_buffers(self.drivers.len(), self.buffered_records);
        Ok(count)
    }

    async fn process_message(
        &mut self,
        message: SourceMessage,
    ) -> std::result::Result<(), DropReason> {
        let frame = frame::decode(&message.payload, self.settings.byte_order).map_err(|e| {
            warn!(
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Malformed frame"
            );
            DropReason::MalformedFrame
        })?;

        let record = normalize::normalize(&frame.payload).map_err(|e| {
            warn!(
                offset = message.offset,
                event_type = %frame.event_type,
                error = %e,
                "Malformed payload"
            );
            DropReason::MalformedPayload
        })?;

        let key = normalize::partition_key(&frame.event_type, &record).map_err(|rejection| {
            warn!(
                offset = message.offset,
                event_type = %frame.event_type,
                reason = rejection.reason(),
                "Record rejected"
            );
            match rejection {
                RecordRejection::MissingTimestamp => DropReason::MissingTimestamp,
                RecordRejection::MissingEvent => DropReason::MissingEvent,
                RecordRejection::InvalidTimestamp(_) => DropReason::InvalidTimestamp,
            }
        })?;

        if !self.drivers.contains_key(&key) {
            let driver = self.create_driver(&key).await?;
            self.drivers.insert(key.clone(), driver);
        }

        let Some(driver) = self.drivers.get_mut(&key) else {
            return Ok(());
        };
        if let Err(e) = driver.add_record(record) {
            error!(key = %key, error = %e, "Event driver rejected record");
            return Ok(());
        }

        self.buffered_records += 1;
        self.commit_cursor = Some(
            self.commit_cursor
                .map_or(message.offset, |cursor| cursor.max(message.offset)),
        );
        Ok(())
    }

    async fn create_driver(
        &self,
        key: &PartitionKey,
    ) -> std::result::Result<EventDriver, DropReason> {
        match self
            .resolver
            .resolve(&self.settings.database, &key.event_type)
            .await
        {
            Ok(SchemaLookup::Found(schema)) => {
                self.health.mark_healthy(Component::Schema);
                self.metrics.record_buffer_created();
                Ok(EventDriver::new(
                    key.clone(),
                    schema,
                    Arc::clone(&self.write_options),
                ))
            }
            Ok(SchemaLookup::Unknown) => {
                self.health.mark_healthy(Component::Schema);
                warn!(
                    database = %self.settings.database,
                    event_type = %key.event_type,
                    "No schema for event type"
                );
                Err(DropReason::UnknownSchema)
            }
            Err(e) => {
                self.health
                    .mark_degraded(Component::Schema, format!("Lookup failed: {}", e));
                error!(
                    database = %self.settings.database,
                    event_type = %key.event_type,
                    error = %e,
                    "Schema lookup failed"
                );
                Err(DropReason::SchemaUnavailable)
            }
        }
    }

    /// Whether the flush interval has elapsed or the buffered record limit
    /// has been reached.
    pub fn should_flush(&self) -> bool {
        let interval_elapsed = self
            .cycle_started
            .is_some_and(|started| started.elapsed() > self.settings.flush_interval);
        let buffer_full = self
            .settings
            .max_buffered_records
            .is_some_and(|limit| self.buffered_records >= limit);
        interval_elapsed || buffer_full
    }

    /// Flush every driver, clear the buffer set, and commit if all flushes
    /// succeeded.
    ///
    /// A failed flush does not stop the others. Its records are lost and the
    /// commit cursor is left untouched.
    pub async fn flush_cycle(&mut self, is_final: bool) -> CycleReport {
        let drivers = std::mem::take(&mut self.drivers);
        self.buffered_records = 0;
        let mut report = CycleReport {
            is_final,
            ..CycleReport::default()
        };

        for (key, mut driver) in drivers {
            let pending = driver.len();
            match driver.flush(self.sink.as_ref(), is_final).await {
                Ok(stats) => {
                    report.flushed += 1;
                    report.rows_written += stats.rows;
                    if stats.rows > 0 {
                        self.metrics.record_flush(
                            stats.rows,
                            stats.coercion_failures,
                            stats.duration,
                        );
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    report.records_lost += pending;
                    self.metrics.record_flush_failure();
                    error!(
                        key = %key,
                        records_lost = pending,
                        error = %e,
                        "Event driver flush failed, buffered records lost"
                    );
                }
            }
        }

        if report.failed > 0 {
            self.health.mark_degraded(
                Component::Storage,
                format!("{} flushes failed", report.failed),
            );
            warn!(
                failed = report.failed,
                cursor = ?self.commit_cursor,
                "Skipping offset commit"
            );
        } else {
            if report.flushed > 0 {
                self.health.mark_healthy(Component::Storage);
                self.health.record_flush();
            }
            if let Some(offset) = self.commit_cursor {
                self.commit(offset, &mut report).await;
            }
        }

        self.cycle_started = Some(Instant::now());
        self.metrics.set_buffers(0, 0);

        if report.flushed + report.failed > 0 {
            info!(
                flushed = report.flushed,
                failed = report.failed,
                rows = report.rows_written,
                committed = ?report.committed,
                is_final = is_final,
                "Flush cycle complete"
            );
        }
        report
    }

    async fn commit(&mut self, offset: i64, report: &mut CycleReport) {
        match self.source.commit().await {
            Ok(()) => {
                self.metrics.record_commit();
                self.health.record_commit();
                self.commit_cursor = None;
                report.committed = Some(offset);
                debug!(offset = offset, "Stream position committed");
            }
            Err(e) => {
                // The cursor stays; the next cycle commits again.
                self.metrics.record_commit_failure();
                self.health
                    .mark_degraded(Component::Stream, format!("Commit failed: {}", e));
                error!(offset = offset, error = %e, "Offset commit failed");
            }
        }
    }

    pub fn metrics(&self) -> &Arc<IngestionMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.health
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn commit_cursor(&self) -> Option<i64> {
        self.commit_cursor
    }

    pub fn active_buffers(&self) -> usize {
        self.drivers.len()
    }

    pub fn buffered_records(&self) -> usize {
        self.buffered_records
    }

    /// Keys of the active buffer set, sorted.
    pub fn buffer_keys(&self) -> Vec<PartitionKey> {
        let mut keys: Vec<PartitionKey> = self.drivers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParquetCompression;
    use crate::error::StorageError;
    use crate::kafka::{MemorySource, MemorySourceHandle};
    use crate::metrics::FlushOutcome;
    use crate::schema::{ColumnDef, ColumnType, StaticSchemaResolver};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    /// Records writes; fails any path containing a configured segment.
    #[derive(Default)]
    struct TestSink {
        writes: Mutex<Vec<(String, usize)>>,
        fail_segment: Option<String>,
    }

    #[async_trait]
    impl StorageSink for TestSink {
        async fn write(&self, path: &str, data: Bytes) -> std::result::Result<(), StorageError> {
            if let Some(ref segment) = self.fail_segment {
                if path.contains(segment.as_str()) {
                    return Err(StorageError::WriteFailed {
                        path: path.to_string(),
                        message: "access denied".into(),
                    });
                }
            }
            self.writes.lock().push((path.to_string(), data.len()));
            Ok(())
        }

        fn describe(&self) -> String {
            "test".into()
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            database: "events".into(),
            byte_order: ByteOrder::Big,
            max_poll_records: 100,
            poll_timeout: Duration::from_millis(5),
            flush_interval: Duration::from_secs(3600),
            max_buffered_records: None,
        }
    }

    fn resolver() -> Arc<dyn SchemaResolver> {
        let columns = vec![
            ColumnDef::new("event", ColumnType::String),
            ColumnDef::new("timestamp", ColumnType::Timestamp),
            ColumnDef::new("user_id", ColumnType::Long),
        ];
        Arc::new(
            StaticSchemaResolver::new()
                .with_schema("events", "login", columns.clone())
                .with_schema("events", "signup", columns),
        )
    }

    fn engine_with(
        settings: EngineSettings,
        sink: Arc<TestSink>,
    ) -> (IngestionEngine<MemorySource>, MemorySourceHandle) {
        let source = MemorySource::new();
        let handle = source.handle();
        let options = WriteOptions {
            database: "events".into(),
            prefix: "data".into(),
            compression: ParquetCompression::Snappy,
            batch_size: 1024,
        };
        let engine = IngestionEngine::new(settings, options, source, resolver(), sink).unwrap();
        (engine, handle)
    }

    fn event(event_type: &str, timestamp: &str) -> Bytes {
        let payload = format!(
            r#"{{"event":"{}","timestamp":"{}","user":{{"id":7}}}}"#,
            event_type, timestamp
        );
        frame::encode(event_type, payload.as_bytes(), ByteOrder::Big)
    }

    #[tokio::test]
    async fn test_two_messages_one_write_one_commit() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(settings(), sink.clone());

        source.push(event("login", "2024-01-01T00:00:00Z"));
        let second = source.push(event("login", "2024-01-01T09:30:00Z"));

        assert_eq!(engine.poll_once().await.unwrap(), 2);
        assert_eq!(engine.active_buffers(), 1);
        assert_eq!(engine.buffered_records(), 2);
        assert_eq!(engine.commit_cursor(), Some(second));

        let report = engine.flush_cycle(false).await;
        assert_eq!(report.flushed, 1);
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.committed, Some(second));

        let writes = sink.writes.lock().clone();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].0.starts_with("data/events/login/2024-01-01/"));
        assert_eq!(source.commits().len(), 1);
        assert_eq!(source.committed_offset(0), Some(second));
        assert_eq!(engine.commit_cursor(), None);
        assert_eq!(engine.active_buffers(), 0);
    }

    #[tokio::test]
    async fn test_routes_by_event_type_and_date() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(settings(), sink.clone());

        source.push(event("login", "2024-01-01T00:00:00Z"));
        source.push(event("login", "2024-01-02T00:00:00Z"));
        source.push(event("signup", "2024-01-01T00:00:00Z"));
        source.push(event("login", "2024-01-01T23:59:59Z"));
        engine.poll_once().await.unwrap();

        let keys: Vec<String> = engine.buffer_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(
            keys,
            vec!["login/2024-01-01", "login/2024-01-02", "signup/2024-01-01"]
        );
        assert_eq!(engine.metrics().buffers_created_total(), 3);

        let report = engine.flush_cycle(false).await;
        assert_eq!(report.flushed, 3);
        assert_eq!(report.rows_written, 4);
        assert_eq!(sink.writes.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_schema_creates_no_buffer() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(settings(), sink.clone());

        source.push(event("purchase", "2024-01-01T00:00:00Z"));
        engine.poll_once().await.unwrap();

        assert_eq!(engine.active_buffers(), 0);
        assert_eq!(engine.commit_cursor(), None);
        assert_eq!(engine.metrics().dropped(DropReason::UnknownSchema), 1);

        let report = engine.flush_cycle(false).await;
        assert_eq!(report, CycleReport::default());
        assert!(source.commits().is_empty());
    }

    #[tokio::test]
    async fn test_drop_reasons() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(settings(), sink);

        source.push(Bytes::from_static(&[0, 0, 0]));
        source.push(frame::encode("login", b"[1,2]", ByteOrder::Big));
        source.push(frame::encode("login", br#"{"event":"login"}"#, ByteOrder::Big));
        source.push(frame::encode(
            "login",
            br#"{"timestamp":"2024-01-01T00:00:00Z"}"#,
            ByteOrder::Big,
        ));
        source.push(frame::encode(
            "login",
            br#"{"event":"login","timestamp":"yesterday"}"#,
            ByteOrder::Big,
        ));
        source.push(event("login", "2024-01-01T00:00:00Z"));

        assert_eq!(engine.poll_once().await.unwrap(), 6);

        let metrics = engine.metrics();
        assert_eq!(metrics.dropped(DropReason::MalformedFrame), 1);
        assert_eq!(metrics.dropped(DropReason::MalformedPayload), 1);
        assert_eq!(metrics.dropped(DropReason::MissingTimestamp), 1);
        assert_eq!(metrics.dropped(DropReason::MissingEvent), 1);
        assert_eq!(metrics.dropped(DropReason::InvalidTimestamp), 1);
        assert_eq!(metrics.dropped_total(), 5);
        assert_eq!(engine.buffered_records(), 1);
        assert_eq!(engine.commit_cursor(), Some(5));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_cursor() {
        let sink = Arc::new(TestSink {
            fail_segment: Some("/signup/".into()),
            ..TestSink::default()
        });
        let (mut engine, source) = engine_with(settings(), sink.clone());

        source.push(event("login", "2024-01-01T00:00:00Z"));
        source.push(event("signup", "2024-01-01T00:00:00Z"));
        source.push(event("signup", "2024-01-01T00:00:01Z"));
        engine.poll_once().await.unwrap();

        let report = engine.flush_cycle(false).await;
        assert!(!report.all_succeeded());
        assert_eq!(report.flushed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.records_lost, 2);
        assert_eq!(report.committed, None);

        // The healthy buffer was still written.
        assert_eq!(sink.writes.lock().len(), 1);
        assert!(source.commits().is_empty());
        assert_eq!(engine.commit_cursor(), Some(2));
        assert_eq!(engine.active_buffers(), 0);
        assert_eq!(engine.metrics().flushes(FlushOutcome::Failed), 1);
        assert!(matches!(
            engine.health().component_status(Component::Storage),
            crate::health::ComponentStatus::Degraded(_)
        ));
    }

    #[tokio::test]
    async fn test_commit_failure_retries_next_cycle() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(settings(), sink);

        source.push(event("login", "2024-01-01T00:00:00Z"));
        engine.poll_once().await.unwrap();
        source.fail_next_commits(1);

        let report = engine.flush_cycle(false).await;
        assert_eq!(report.committed, None);
        assert_eq!(engine.commit_cursor(), Some(0));
        assert_eq!(engine.metrics().commit_failures_total(), 1);

        let report = engine.flush_cycle(false).await;
        assert_eq!(report.committed, Some(0));
        assert_eq!(source.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_timer_starts_with_first_message() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(
            EngineSettings {
                flush_interval: Duration::from_millis(20),
                ..settings()
            },
            sink,
        );

        engine.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!engine.should_flush());

        source.push(event("login", "2024-01-01T00:00:00Z"));
        engine.poll_once().await.unwrap();
        assert!(!engine.should_flush());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(engine.should_flush());

        engine.flush_cycle(false).await;
        assert!(!engine.should_flush());
    }

    #[tokio::test]
    async fn test_early_flush_on_buffered_limit() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(
            EngineSettings {
                max_buffered_records: Some(3),
                ..settings()
            },
            sink,
        );

        source.push(event("login", "2024-01-01T00:00:00Z"));
        source.push(event("login", "2024-01-01T00:00:01Z"));
        engine.poll_once().await.unwrap();
        assert!(!engine.should_flush());

        source.push(event("signup", "2024-01-01T00:00:02Z"));
        engine.poll_once().await.unwrap();
        assert!(engine.should_flush());
    }

    #[tokio::test]
    async fn test_poll_size_observed_once_per_poll() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(settings(), sink);

        source.push(event("login", "2024-01-01T00:00:00Z"));
        engine.poll_once().await.unwrap();
        engine.poll_once().await.unwrap();

        assert_eq!(engine.metrics().poll_count(), 2);
        assert_eq!(engine.metrics().messages_total(), 1);
    }

    #[tokio::test]
    async fn test_poll_failure_marks_stream_degraded() {
        let sink = Arc::new(TestSink::default());
        let (mut engine, source) = engine_with(settings(), sink);

        source.fail_next_polls(1);
        assert!(engine.poll_once().await.is_err());
        assert!(matches!(
            engine.health().component_status(Component::Stream),
            crate::health::ComponentStatus::Degraded(_)
        ));

        engine.poll_once().await.unwrap();
        assert_eq!(
            engine.health().component_status(Component::Stream),
            crate::health::ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let sink = Arc::new(TestSink::default());
        let (engine, source) = engine_with(settings(), sink.clone());
        let token = engine.shutdown_token();

        source.push(event("login", "2024-01-01T00:00:00Z"));
        source.push(event("login", "2024-01-01T00:00:01Z"));

        let mut engine = engine;
        let handle = tokio::spawn(async move {
            engine.run().await.unwrap();
            engine
        });

        while source.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        let engine = handle.await.unwrap();

        assert_eq!(sink.writes.lock().len(), 1);
        assert_eq!(source.committed_offset(0), Some(1));
        assert_eq!(engine.commit_cursor(), None);
        assert!(!engine.health().is_running());
    }
}
