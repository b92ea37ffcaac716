//! Source reader contract
//!
//! A reader owns the splits handed to it, pushes rows into a [`Collector`]
//! and reports exact resume positions at checkpoint time.

use super::split::{Boundedness, SourceSplit, SplitProgress};
use crate::error::{ConnectorError, ConnectorResult};
use crate::retry::{self, RetryPolicy};
use crate::types::Row;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Receives rows produced by a reader
pub trait Collector: Send {
    fn collect(&mut self, row: Row);
}

impl Collector for Vec<Row> {
    fn collect(&mut self, row: Row) {
        self.push(row);
    }
}

/// Outcome of one `poll_next` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Call again immediately
    MoreAvailable,
    /// Nothing to read right now
    NothingAvailable,
    /// Bounded source fully read
    EndOfInput,
}

/// Per-reader checkpoint: resume positions of every split still owned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: SourceSplit")]
pub struct SourceReaderState<S> {
    pub checkpoint_id: u64,
    pub splits: Vec<SplitProgress<S>>,
}

impl<S: SourceSplit> SourceReaderState<S> {
    pub fn position_of(&self, split_id: &str) -> Option<u64> {
        self.splits
            .iter()
            .find(|p| p.split_id() == split_id)
            .map(|p| p.position)
    }
}

#[async_trait]
pub trait SourceReader: Send {
    type Split: SourceSplit;

    fn boundedness(&self) -> Boundedness;

    /// Take ownership of splits, either fresh from the enumerator or restored
    fn add_splits(&mut self, splits: Vec<SplitProgress<Self::Split>>);

    /// The enumerator will not send further splits
    fn handle_no_more_splits(&mut self);

    async fn poll_next(&mut self, output: &mut dyn Collector) -> ConnectorResult<ReadStatus>;

    fn snapshot_state(
        &mut self,
        checkpoint_id: u64,
    ) -> ConnectorResult<SourceReaderState<Self::Split>>;

    async fn notify_checkpoint_complete(&mut self, _checkpoint_id: u64) -> ConnectorResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> ConnectorResult<()>;
}

/// Bookkeeping shared by readers: owned splits, their positions, and
/// whether more splits may still arrive.
#[derive(Debug, Clone)]
pub struct SplitQueue<S> {
    active: VecDeque<SplitProgress<S>>,
    finished: usize,
    no_more_splits: bool,
}

impl<S> Default for SplitQueue<S> {
    fn default() -> Self {
        Self {
            active: VecDeque::new(),
            finished: 0,
            no_more_splits: false,
        }
    }
}

impl<S: SourceSplit> SplitQueue<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add splits, ignoring ids already owned
    pub fn add(&mut self, splits: Vec<SplitProgress<S>>) {
        for progress in splits {
            let id = progress.split_id();
            if self.active.iter().any(|p| p.split_id() == id) {
                continue;
            }
            self.active.push_back(progress);
        }
    }

    pub fn current(&self) -> Option<&SplitProgress<S>> {
        self.active.front()
    }

    pub fn current_mut(&mut self) -> Option<&mut SplitProgress<S>> {
        self.active.front_mut()
    }

    /// Move the current split behind the others so unbounded splits share reads
    pub fn rotate(&mut self) {
        if let Some(current) = self.active.pop_front() {
            self.active.push_back(current);
        }
    }

    /// Drop the split being read; it is no longer part of checkpoints
    pub fn finish_current(&mut self) -> Option<SplitProgress<S>> {
        let done = self.active.pop_front();
        if done.is_some() {
            self.finished += 1;
        }
        done
    }

    pub fn set_no_more_splits(&mut self) {
        self.no_more_splits = true;
    }

    pub fn finished_count(&self) -> usize {
        self.finished
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Every owned split read and none still coming
    pub fn is_drained(&self) -> bool {
        self.no_more_splits && self.active.is_empty()
    }

    pub fn snapshot(&self, checkpoint_id: u64) -> SourceReaderState<S> {
        SourceReaderState {
            checkpoint_id,
            splits: self.active.iter().cloned().collect(),
        }
    }

    /// Status to report when the current split yielded nothing
    pub fn idle_status(&self, boundedness: Boundedness) -> ReadStatus {
        if boundedness == Boundedness::Bounded && self.is_drained() {
            ReadStatus::EndOfInput
        } else if self.active.is_empty() {
            ReadStatus::NothingAvailable
        } else {
            ReadStatus::MoreAvailable
        }
    }
}

/// Run one split-local I/O call with the reader's retry limit.
///
/// An exhausted budget is escalated to [`ConnectorError::Fatal`] naming the split.
pub async fn read_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    split_id: &str,
    cancel: &CancellationToken,
    operation: F,
) -> ConnectorResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ConnectorResult<T>>,
{
    match retry::retry(policy, &format!("read split '{}'", split_id), cancel, operation).await {
        Ok(value) => Ok(value),
        Err(e @ ConnectorError::RetriesExhausted { .. }) => {
            error!(split = %split_id, error = %e, "Split read failed permanently");
            Err(ConnectorError::fatal(format!("split '{}': {}", split_id, e)))
        }
        Err(e) => Err(e),
    }
}
