//! Source side of the connector contract: splits, enumerator, reader

pub mod enumerator;
pub mod reader;
pub mod split;

pub use enumerator::{
    AssignmentStrategy, Assignments, EnumeratorPhase, EnumeratorState, SingleSplitDiscovery,
    SplitDiscovery, SplitEnumerator,
};
pub use reader::{
    read_with_retry, Collector, ReadStatus, SourceReader, SourceReaderState, SplitQueue,
};
pub use split::{Boundedness, ReaderId, SourceSplit, SplitProgress};

use crate::error::ConnectorResult;
use crate::spec::ConnectorSpec;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Trait for source connectors
///
/// The source itself holds only configuration. Work is split by the
/// [`SplitEnumerator`] it creates and read by one [`SourceReader`] per
/// parallel task.
#[async_trait]
pub trait Source: Send + Sync + 'static {
    type Split: SourceSplit;
    type Reader: SourceReader<Split = Self::Split> + 'static;

    fn spec(&self) -> ConnectorSpec;

    fn boundedness(&self) -> Boundedness;

    /// Create the enumerator, restoring it from `state` when present
    fn create_enumerator(
        &self,
        num_readers: u32,
        state: Option<EnumeratorState<Self::Split>>,
    ) -> ConnectorResult<SplitEnumerator<Self::Split>>;

    async fn create_reader(
        &self,
        reader: ReaderId,
        cancel: CancellationToken,
    ) -> ConnectorResult<Self::Reader>;
}
