//! Kafka message source with exponential backoff.
//!
//! Offsets are never auto-committed. librdkafka stores the position of each
//! message as it is handed to the application, and the ingestion loop commits
//! that position once per flush cycle with a synchronous
//! `commit_consumer_state` call.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) + jitter

use super::{MessageSource, SourceMessage};
use crate::config::KafkaConfig;
use crate::{Error, Result, StreamError};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (default: 100ms)
    pub base_delay: Duration,
    /// Maximum delay cap (default: 30s)
    pub max_delay: Duration,
    /// Maximum number of attempts (default: 10)
    pub max_retries: u32,
    /// Whether to add jitter to delays (default: true)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Shorter schedule for the per-cycle offset commit, which holds up the
    /// poll loop while it retries.
    pub fn for_commit() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 5)
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    ///
    /// Jitter, when enabled, spreads the delay by ±25%.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }
}

/// Builder for a [`KafkaSource`].
pub struct KafkaSourceBuilder {
    config: KafkaConfig,
    poll_retry: RetryConfig,
    commit_retry: RetryConfig,
}

impl KafkaSourceBuilder {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            poll_retry: RetryConfig::default(),
            commit_retry: RetryConfig::for_commit(),
        }
    }

    /// Backoff applied after failed polls.
    pub fn with_poll_retry(mut self, retry: RetryConfig) -> Self {
        self.poll_retry = retry;
        self
    }

    /// Retry schedule for offset commits.
    pub fn with_commit_retry(mut self, retry: RetryConfig) -> Self {
        self.commit_retry = retry;
        self
    }

    /// librdkafka settings for the consumer.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", self.config.bootstrap_servers.join(","))
            .set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.config.heartbeat_interval_ms.to_string(),
            )
            // A flush cycle runs between polls, so this bounds the longest flush.
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky");

        let security = &self.config.security;
        if let Some(ref protocol) = security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }

        client_config
    }

    /// Create the consumer and subscribe to the topic.
    pub fn build(self) -> Result<KafkaSource> {
        let servers = self.config.bootstrap_servers.join(",");

        let consumer: StreamConsumer = self.client_config().create().map_err(|e| {
            Error::Stream(StreamError::ConnectionFailed {
                broker: servers.clone(),
                message: e.to_string(),
            })
        })?;

        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| Error::Stream(StreamError::ConsumerGroup(e.to_string())))?;

        info!(
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            servers = %servers,
            "Kafka consumer subscribed"
        );

        Ok(KafkaSource {
            consumer,
            topic: self.config.topic,
            poll_retry: self.poll_retry,
            commit_retry: self.commit_retry,
            consecutive_failures: 0,
        })
    }
}

#[derive(Debug)]
enum PollOutcome {
    Delivered(Vec<SourceMessage>),
    Partial(Vec<SourceMessage>, String),
    Failed(String),
}

fn poll_outcome(batch: Vec<SourceMessage>, failure: Option<String>) -> PollOutcome {
    match failure {
        None => PollOutcome::Delivered(batch),
        Some(message) if batch.is_empty() => PollOutcome::Failed(message),
        Some(message) => PollOutcome::Partial(batch, message),
    }
}

/// [`MessageSource`] backed by an rdkafka [`StreamConsumer`].
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
    poll_retry: RetryConfig,
    commit_retry: RetryConfig,
    consecutive_failures: u32,
}

impl KafkaSource {
    fn convert_message(msg: &BorrowedMessage<'_>) -> SourceMessage {
        SourceMessage {
            partition: msg.partition(),
            offset: msg.offset(),
            payload: msg
                .payload()
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        }
    }

    fn commit_once(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| Error::Stream(StreamError::OffsetCommit(e.to_string())))
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll_batch(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<SourceMessage>> {
        use futures::StreamExt;

        let mut batch = Vec::with_capacity(max_messages);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut failure = None;

        {
            let stream = self.consumer.stream();
            tokio::pin!(stream);

            while batch.len() < max_messages {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }

                match tokio::time::timeout(remaining, stream.next()).await {
                    Ok(Some(Ok(msg))) => batch.push(Self::convert_message(&msg)),
                    Ok(Some(Err(e))) => {
                        failure = Some(e.to_string());
                        break;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }

        match poll_outcome(batch, failure) {
            PollOutcome::Failed(message) => {
                self.consecutive_failures += 1;
                let backoff = self.poll_retry.calculate_delay(self.consecutive_failures);
                warn!(
                    failures = self.consecutive_failures,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %message,
                    "Poll error, backing off"
                );
                tokio::time::sleep(backoff).await;
                Err(Error::Stream(StreamError::Poll(message)))
            }
            // Delivered messages are kept; a persisting error resurfaces on
            // the next poll.
            PollOutcome::Partial(batch, message) => {
                self.consecutive_failures = 0;
                warn!(
                    error = %message,
                    delivered = batch.len(),
                    "Poll error after partial batch"
                );
                Ok(batch)
            }
            PollOutcome::Delivered(batch) => {
                self.consecutive_failures = 0;
                Ok(batch)
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let mut attempt = 0;

        loop {
            match self.commit_once() {
                Ok(()) => {
                    debug!(topic = %self.topic, attempt = attempt, "Offsets committed");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.commit_retry.max_retries {
                        warn!(
                            attempt = attempt,
                            max_retries = self.commit_retry.max_retries,
                            error = %e,
                            "Offset commit failed after max retries"
                        );
                        return Err(e);
                    }

                    let delay = self.commit_retry.calculate_delay(attempt);
                    warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Offset commit failed, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("kafka topic {}", self.topic)
    }
}
