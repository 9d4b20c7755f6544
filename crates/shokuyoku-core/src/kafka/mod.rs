//! Stream consumption.
//!
//! The ingestion loop reads through the [`MessageSource`] trait so it can run
//! against Kafka in production and an in-memory queue in tests.

mod consumer;
mod memory;

pub use consumer::{KafkaSource, KafkaSourceBuilder, RetryConfig};
pub use memory::{MemorySource, MemorySourceHandle};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// One raw message from the stream.
#[derive(Debug, Clone)]
pub struct SourceMessage {
    pub partition: i32,
    pub offset: i64,
    /// Framed bytes; empty for tombstones
    pub payload: Bytes,
}

impl SourceMessage {
    pub fn new(partition: i32, offset: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            payload: payload.into(),
        }
    }
}

/// A consumer-group style stream of framed messages.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `timeout` for at most `max_messages` messages. An empty
    /// batch is not an error.
    async fn poll_batch(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<SourceMessage>>;

    /// Synchronously commit the position of everything delivered so far.
    async fn commit(&mut self) -> Result<()>;

    /// Human-readable source description for logs.
    fn describe(&self) -> String;
}
