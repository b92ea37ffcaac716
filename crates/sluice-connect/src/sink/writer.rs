//! Sink writer contract
//!
//! One writer per parallel task. The checkpoint coordinator drives it:
//!
//! ```text
//! write* -> prepare_commit(c) -> snapshot_state(c) -> notify_checkpoint_complete(c)
//!                             \-> abort_prepare()
//! ```
//!
//! Writers never trigger a checkpoint themselves.

use crate::error::ConnectorResult;
use crate::types::Row;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Marker for values that cross the checkpoint boundary (commit infos, states)
pub trait CheckpointData:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> CheckpointData for T where
    T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// Where a writer runs
#[derive(Debug, Clone)]
pub struct SinkWriterContext {
    /// Index of this writer among its peers
    pub subtask_index: u32,
    /// Number of parallel writers
    pub parallelism: u32,
    /// Job identifier, used to namespace staged work
    pub job_id: String,
    /// Cancels backoff waits and background tasks
    pub cancel: CancellationToken,
}

impl SinkWriterContext {
    pub fn new(job_id: impl Into<String>, subtask_index: u32, parallelism: u32) -> Self {
        Self {
            subtask_index,
            parallelism,
            job_id: job_id.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token (builder pattern)
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
pub trait SinkWriter: Send {
    /// Produced once per checkpoint by `prepare_commit`
    type CommitInfo: CheckpointData;
    /// Persisted by `snapshot_state`, handed back on restore
    type State: CheckpointData;

    /// Buffer a row. Only blocks on I/O when a flush threshold is crossed.
    async fn write(&mut self, row: Row) -> ConnectorResult<()>;

    /// Flush buffered data and return what the committer must finalize.
    async fn prepare_commit(&mut self, checkpoint_id: u64)
        -> ConnectorResult<Option<Self::CommitInfo>>;

    /// State to persist for `checkpoint_id`
    async fn snapshot_state(&mut self, checkpoint_id: u64) -> ConnectorResult<Vec<Self::State>>;

    /// Roll back whatever was prepared for the in-flight checkpoint
    async fn abort_prepare(&mut self) -> ConnectorResult<()>;

    async fn notify_checkpoint_complete(&mut self, _checkpoint_id: u64) -> ConnectorResult<()> {
        Ok(())
    }

    /// Flush remaining data and release connections
    async fn close(&mut self) -> ConnectorResult<()>;
}
