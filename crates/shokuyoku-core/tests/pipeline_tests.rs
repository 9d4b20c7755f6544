//! End-to-end pipeline tests.
//!
//! The `pipeline` tests drive the engine with an in-memory source and store.
//! The `kafka_integration` tests require Docker and are marked with #[ignore].
//!
//! Run with: cargo test --test pipeline_tests -- --ignored

use arrow::array::{Array, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::ObjectStore;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use shokuyoku_core::config::ParquetCompression;
use shokuyoku_core::driver::WriteOptions;
use shokuyoku_core::engine::{EngineSettings, IngestionEngine};
use shokuyoku_core::frame::{self, ByteOrder};
use shokuyoku_core::kafka::{MemorySource, MemorySourceHandle, MessageSource};
use shokuyoku_core::metrics::DropReason;
use shokuyoku_core::schema::{SchemaResolver, StaticSchemaResolver};
use shokuyoku_core::sink::ObjectStoreSink;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SCHEMAS: &str = r#"
[[events]]
database = "events"
name = "login"
columns = [
    { name = "event", type = "string" },
    { name = "timestamp", type = "timestamp" },
    { name = "user_id", type = "bigint" },
    { name = "client", type = "string" },
]

[[events]]
name = "signup"
columns = [
    { name = "event", type = "string" },
    { name = "timestamp", type = "timestamp" },
    { name = "plan", type = "string" },
]
"#;

fn resolver() -> Arc<dyn SchemaResolver> {
    Arc::new(StaticSchemaResolver::from_toml(SCHEMAS).unwrap())
}

fn settings(order: ByteOrder) -> EngineSettings {
    EngineSettings {
        database: "events".into(),
        byte_order: order,
        max_poll_records: 500,
        poll_timeout: Duration::from_millis(5),
        flush_interval: Duration::from_secs(3600),
        max_buffered_records: None,
    }
}

fn write_options() -> WriteOptions {
    WriteOptions {
        database: "events".into(),
        prefix: "raw".into(),
        compression: ParquetCompression::Zstd,
        batch_size: 1024,
    }
}

fn memory_engine<S: MessageSource>(
    source: S,
    order: ByteOrder,
) -> (IngestionEngine<S>, Arc<dyn ObjectStore>) {
    let sink = ObjectStoreSink::in_memory();
    let store = sink.store();
    let engine = IngestionEngine::new(
        settings(order),
        write_options(),
        source,
        resolver(),
        Arc::new(sink),
    )
    .unwrap();
    (engine, store)
}

fn framed(event_type: &str, json: &str, order: ByteOrder) -> Bytes {
    frame::encode(event_type, json.as_bytes(), order)
}

async fn written_files(store: &Arc<dyn ObjectStore>) -> Vec<String> {
    let mut paths: Vec<String> = store
        .list(None)
        .map_ok(|meta| meta.location.to_string())
        .try_collect()
        .await
        .unwrap();
    paths.sort();
    paths
}

async fn read_file(store: &Arc<dyn ObjectStore>, path: &str) -> RecordBatch {
    let data = store
        .get(&object_store::path::Path::from(path))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .unwrap()
        .build()
        .unwrap();
    let batches: Vec<RecordBatch> = reader.collect::<Result<_, _>>().unwrap();
    arrow::compute::concat_batches(&batches[0].schema(), &batches).unwrap()
}

fn push_login(source: &MemorySourceHandle, timestamp: &str, user_id: i64) -> i64 {
    source.push(framed(
        "login",
        &format!(
            r#"{{"event":"login","timestamp":"{}","user":{{"id":{}}},"client":"ios"}}"#,
            timestamp, user_id
        ),
        ByteOrder::Big,
    ))
}

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn test_login_event_lands_as_parquet() {
        let source = MemorySource::new();
        let handle = source.handle();
        let (mut engine, store) = memory_engine(source, ByteOrder::Big);

        push_login(&handle, "2024-01-01T00:00:00Z", 42);
        let second = push_login(&handle, "2024-01-01T12:00:00.250Z", 43);

        engine.poll_once().await.unwrap();
        let report = engine.flush_cycle(false).await;
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.committed, Some(second));
        assert_eq!(handle.committed_offset(0), Some(second));

        let files = written_files(&store).await;
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("raw/events/login/2024-01-01/"));
        assert!(files[0].ends_with(".parquet"));

        let batch = read_file(&store, &files[0]).await;
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 4);

        let users = batch
            .column_by_name("user_id")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(users.value(0), 42);
        assert_eq!(users.value(1), 43);

        let timestamps = batch
            .column_by_name("timestamp")
            .unwrap()
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .unwrap();
        assert_eq!(timestamps.value(0), 1_704_067_200_000);
        assert_eq!(timestamps.value(1), 1_704_067_200_000 + 12 * 3_600_000 + 250);

        let events = batch
            .column_by_name("event")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(events.value(0), "login");
    }

    #[tokio::test]
    async fn test_each_key_gets_its_own_file() {
        let source = MemorySource::new();
        let handle = source.handle();
        let (mut engine, store) = memory_engine(source, ByteOrder::Big);

        push_login(&handle, "2024-01-01T00:00:00Z", 1);
        push_login(&handle, "2024-01-02T00:00:00Z", 2);
        handle.push(framed(
            "signup",
            r#"{"event":"signup","timestamp":"2024-01-01T08:00:00Z","plan":"pro"}"#,
            ByteOrder::Big,
        ));

        engine.poll_once().await.unwrap();
        assert_eq!(engine.active_buffers(), 3);
        engine.flush_cycle(false).await;

        let files = written_files(&store).await;
        assert_eq!(files.len(), 3);
        assert!(files[0].starts_with("raw/events/login/2024-01-01/"));
        assert!(files[1].starts_with("raw/events/login/2024-01-02/"));
        assert!(files[2].starts_with("raw/events/signup/2024-01-01/"));
    }

    #[tokio::test]
    async fn test_unmatched_and_uncoercible_values() {
        let source = MemorySource::new();
        let handle = source.handle();
        let (mut engine, store) = memory_engine(source, ByteOrder::Big);

        handle.push(framed(
            "login",
            r#"{"event":"login","timestamp":"2024-03-05T10:00:00Z","user":{"id":"not-a-number"},"extra":{"a":1}}"#,
            ByteOrder::Big,
        ));

        engine.poll_once().await.unwrap();
        engine.flush_cycle(false).await;
        assert_eq!(engine.metrics().coercion_failures_total(), 1);

        let files = written_files(&store).await;
        let batch = read_file(&store, &files[0]).await;
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.column_by_name("user_id").unwrap().is_null(0));
        assert!(batch.column_by_name("client").unwrap().is_null(0));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages_are_dropped() {
        let source = MemorySource::new();
        let handle = source.handle();
        let (mut engine, store) = memory_engine(source, ByteOrder::Big);

        handle.push(framed(
            "purchase",
            r#"{"event":"purchase","timestamp":"2024-01-01T00:00:00Z"}"#,
            ByteOrder::Big,
        ));
        handle.push(Bytes::from_static(b"\x00\x00\x00\x05log"));
        handle.push(framed("login", "not json", ByteOrder::Big));

        assert_eq!(engine.poll_once().await.unwrap(), 3);
        assert_eq!(engine.active_buffers(), 0);
        assert_eq!(engine.commit_cursor(), None);

        let metrics = engine.metrics();
        assert_eq!(metrics.dropped(DropReason::UnknownSchema), 1);
        assert_eq!(metrics.dropped(DropReason::MalformedFrame), 1);
        assert_eq!(metrics.dropped(DropReason::MalformedPayload), 1);

        let report = engine.flush_cycle(false).await;
        assert_eq!(report.committed, None);
        assert!(handle.commits().is_empty());
        assert!(written_files(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_little_endian_frames() {
        let source = MemorySource::new();
        let handle = source.handle();
        let (mut engine, store) = memory_engine(source, ByteOrder::Little);

        handle.push(framed(
            "signup",
            r#"{"event":"signup","timestamp":"2024-06-30T23:59:59Z","plan":"free"}"#,
            ByteOrder::Little,
        ));
        handle.push(framed(
            "signup",
            r#"{"event":"signup","timestamp":"2024-06-30T23:59:59Z","plan":"free"}"#,
            ByteOrder::Big,
        ));

        engine.poll_once().await.unwrap();
        assert_eq!(engine.metrics().dropped(DropReason::MalformedFrame), 1);
        engine.flush_cycle(false).await;

        let files = written_files(&store).await;
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("raw/events/signup/2024-06-30/"));
    }

    #[tokio::test]
    async fn test_run_with_local_storage_and_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let sink = ObjectStoreSink::from_config(&shokuyoku_core::config::StorageConfig {
            location: format!("file://{}", temp_dir.path().display()),
            prefix: "raw".into(),
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            s3_endpoint: None,
        })
        .unwrap();

        let source = MemorySource::new();
        let handle = source.handle();
        let mut engine = IngestionEngine::new(
            settings(ByteOrder::Big),
            write_options(),
            source,
            resolver(),
            Arc::new(sink),
        )
        .unwrap();
        let shutdown = engine.shutdown_token();

        for i in 0..10 {
            push_login(&handle, "2024-01-01T00:00:00Z", i);
        }

        let task = tokio::spawn(async move {
            engine.run().await.unwrap();
            engine
        });

        while handle.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        let engine = task.await.unwrap();

        assert_eq!(engine.metrics().rows_flushed_total(), 10);
        assert_eq!(handle.committed_offset(0), Some(9));

        let day_dir = temp_dir.path().join("raw/events/login/2024-01-01");
        let files: Vec<_> = std::fs::read_dir(&day_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
    }
}

mod kafka_integration {
    use super::*;
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::client::DefaultClientContext;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use shokuyoku_core::config::{
        Config, IngestConfig, KafkaConfig, KafkaSecurityConfig, MonitoringConfig, SchemaConfig,
        StorageConfig,
    };
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::kafka::Kafka;

    /// Produce framed events to a real broker and land them on local storage.
    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_kafka_to_local_storage() {
        let kafka = Kafka::default()
            .start()
            .await
            .expect("Failed to start Kafka container");
        let bootstrap_servers = format!(
            "127.0.0.1:{}",
            kafka
                .get_host_port_ipv4(9093)
                .await
                .expect("Failed to get Kafka port")
        );

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .create()
            .expect("Failed to create admin client");
        admin
            .create_topics(
                &[NewTopic::new("events", 1, TopicReplication::Fixed(1))],
                &AdminOptions::new(),
            )
            .await
            .expect("Failed to create topic");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");

        for user_id in 0..3 {
            let payload = framed(
                "login",
                &format!(
                    r#"{{"event":"login","timestamp":"2024-01-01T00:00:00Z","user":{{"id":{}}}}}"#,
                    user_id
                ),
                ByteOrder::Big,
            );
            producer
                .send(
                    FutureRecord::<(), [u8]>::to("events").payload(payload.as_ref()),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to produce message");
        }

        let temp_dir = TempDir::new().unwrap();
        let schema_file = temp_dir.path().join("schemas.toml");
        std::fs::write(&schema_file, SCHEMAS).unwrap();
        let warehouse = temp_dir.path().join("warehouse");

        let config = Config {
            kafka: KafkaConfig {
                bootstrap_servers: vec![bootstrap_servers],
                topic: "events".into(),
                consumer_group: "shokuyoku-test".into(),
                max_poll_records: 100,
                poll_timeout_ms: 200,
                session_timeout_ms: 10000,
                heartbeat_interval_ms: 1000,
                max_poll_interval_ms: 300000,
                security: KafkaSecurityConfig::default(),
            },
            storage: StorageConfig {
                location: warehouse.display().to_string(),
                prefix: "raw".into(),
                aws_region: None,
                aws_access_key_id: None,
                aws_secret_access_key: None,
                s3_endpoint: None,
            },
            schema: SchemaConfig {
                database: "events".into(),
                hive_metastore_uri: None,
                schema_file: Some(schema_file),
                cache_ttl_seconds: 300,
                negative_cache_ttl_seconds: None,
                request_timeout_ms: 5000,
            },
            ingest: IngestConfig {
                flush_interval_seconds: 0,
                ..IngestConfig::default()
            },
            monitoring: MonitoringConfig::default(),
        };

        let mut engine = IngestionEngine::from_config(&config).unwrap();
        let shutdown = engine.shutdown_token();
        let metrics = Arc::clone(engine.metrics());
        let task = tokio::spawn(async move { engine.run().await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        while metrics.rows_flushed_total() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(metrics.rows_flushed_total(), 3);
        assert!(metrics.commits_total() >= 1);
        assert!(warehouse.join("raw/events/login/2024-01-01").exists());
    }
}
