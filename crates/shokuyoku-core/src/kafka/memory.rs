//! In-memory message source for tests and local replay.

use super::{MessageSource, SourceMessage};
use crate::{Error, Result, StreamError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    pending: VecDeque<SourceMessage>,
    next_offset: BTreeMap<i32, i64>,
    /// Highest offset handed out per partition
    delivered: BTreeMap<i32, i64>,
    commits: Vec<BTreeMap<i32, i64>>,
    failing_polls: u32,
    failing_commits: u32,
}

/// Queue-backed [`MessageSource`].
///
/// A commit records the highest delivered offset of every partition, which
/// mirrors a consumer committing its current position.
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
}

/// Producer side of a [`MemorySource`], kept by the test after the source is
/// moved into the engine.
#[derive(Debug, Clone)]
pub struct MemorySourceHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MemorySourceHandle {
        MemorySourceHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl MemorySourceHandle {
    /// Append a message to partition 0 and return its offset.
    pub fn push(&self, payload: impl Into<Bytes>) -> i64 {
        self.push_to(0, payload)
    }

    /// Append a message to `partition` and return its offset.
    pub fn push_to(&self, partition: i32, payload: impl Into<Bytes>) -> i64 {
        let mut state = self.state.lock();
        let next = state.next_offset.entry(partition).or_insert(0);
        let offset = *next;
        *next += 1;
        state
            .pending
            .push_back(SourceMessage::new(partition, offset, payload));
        offset
    }

    /// Messages not yet polled.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Every successful commit, oldest first.
    pub fn commits(&self) -> Vec<BTreeMap<i32, i64>> {
        self.state.lock().commits.clone()
    }

    /// Last committed offset of `partition`.
    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .commits
            .iter()
            .rev()
            .find_map(|c| c.get(&partition).copied())
    }

    /// Make the next `n` polls fail.
    pub fn fail_next_polls(&self, n: u32) {
        self.state.lock().failing_polls = n;
    }

    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().failing_commits = n;
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn poll_batch(
        &mut self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<SourceMessage>> {
        let batch = {
            let mut state = self.state.lock();
            if state.failing_polls > 0 {
                state.failing_polls -= 1;
                return Err(Error::Stream(StreamError::Poll("injected poll failure".into())));
            }

            let take = max_messages.min(state.pending.len());
            let batch: Vec<SourceMessage> = state.pending.drain(..take).collect();
            for msg in &batch {
                let high = state.delivered.entry(msg.partition).or_insert(msg.offset);
                *high = (*high).max(msg.offset);
            }
            batch
        };

        if batch.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(batch)
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(Error::Stream(StreamError::OffsetCommit(
                "injected commit failure".into(),
            )));
        }

        let position = state.delivered.clone();
        state.commits.push(position);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
