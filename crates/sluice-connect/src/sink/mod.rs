//! Sink side of the connector contract
//!
//! A [`Sink`] is created from a validated config. It hands out one
//! [`SinkWriter`] per parallel task and, for two-phase sinks, a single
//! [`AggregatedCommitter`] that finalizes every writer's work for a
//! checkpoint at once.

pub mod batch;
pub mod buffer;
pub mod committer;
pub mod resource;
pub mod transactional;
pub mod writer;

pub use batch::{BatchLoadClient, BatchSinkWriter, BatchWriterConfig};
pub use buffer::{Batch, BatchBuffer};
pub use committer::{AggregatedCommitter, CommitCoordinator, NoopCommitter, ReportStatus};
pub use resource::{ResourceTable, SinkResource};
pub use transactional::{
    resolve_prefix, AbortOutcome, OutgoingRecord, TransactionAggregatedCommitInfo,
    TransactionCommitInfo, TransactionCommitter, TransactionId, TransactionalSender,
    TransactionalSinkState, TransactionalSinkWriter, TransactionalWriterConfig,
};
pub use writer::{CheckpointData, SinkWriter, SinkWriterContext};

use crate::error::ConnectorResult;
use crate::spec::ConnectorSpec;
use async_trait::async_trait;

/// Commit info type of a sink's writer
pub type CommitInfoOf<S> = <<S as Sink>::Writer as SinkWriter>::CommitInfo;

/// Persisted state type of a sink's writer
pub type WriterStateOf<S> = <<S as Sink>::Writer as SinkWriter>::State;

/// Trait for sink connectors
///
/// Writes become visible either when a writer flushes (at-least-once
/// sinks, no committer) or when the committer commits the aggregated
/// infos of a completed checkpoint.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    type Writer: SinkWriter + 'static;
    type Committer: AggregatedCommitter<CommitInfo = CommitInfoOf<Self>> + 'static;

    fn spec(&self) -> ConnectorSpec;

    /// Create a writer, restoring it from `states` when non-empty
    async fn create_writer(
        &self,
        context: SinkWriterContext,
        states: Vec<WriterStateOf<Self>>,
    ) -> ConnectorResult<Self::Writer>;

    /// The aggregated committer, if this sink needs one
    fn create_committer(&self) -> ConnectorResult<Option<Self::Committer>> {
        Ok(None)
    }
}
