//! Datagen source connector
//!
//! Generates deterministic rows without an external system. Work is split
//! into `splits` partitions; each partition is an offset range, and the
//! reader's resume position is the next offset to emit, so a restored job
//! continues exactly where the checkpoint left off.
//!
//! Rows are `(partition, offset, value)` where `value` is
//! `<table>-<partition>-<offset>`.
//!
//! # Example Configuration
//!
//! ```yaml
//! source:
//!   connector: datagen
//!   config:
//!     splits: 4
//!     rows_per_split: 1000   # 0 = unbounded
//!     batch_size: 100
//! ```

use crate::config::ReadonlyConfig;
use crate::error::ConnectorResult;
use crate::metrics;
use crate::registry::{AnySource, SourceFactory};
use crate::row;
use crate::source::{
    AssignmentStrategy, Boundedness, Collector, EnumeratorState, ReadStatus, ReaderId, Source,
    SourceReader, SourceReaderState, SourceSplit, SplitDiscovery, SplitEnumerator,
    SplitProgress, SplitQueue,
};
use crate::spec::{Capability, ConnectorSpec};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use validator::Validate;

/// Datagen source configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct DatagenConfig {
    /// Number of partitions
    #[serde(default = "default_splits")]
    #[validate(range(min = 1, max = 1024))]
    pub splits: u32,

    /// Rows per partition (0 = unbounded)
    #[serde(default)]
    pub rows_per_split: u64,

    /// Rows emitted per poll
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 10_000))]
    pub batch_size: u32,

    /// Table name stamped on every row
    #[serde(default = "default_table")]
    #[validate(length(min = 1, max = 255))]
    pub table: String,
}

fn default_splits() -> u32 {
    1
}

fn default_batch_size() -> u32 {
    100
}

fn default_table() -> String {
    "datagen".to_string()
}

impl Default for DatagenConfig {
    fn default() -> Self {
        Self {
            splits: default_splits(),
            rows_per_split: 0,
            batch_size: default_batch_size(),
            table: default_table(),
        }
    }
}

impl DatagenConfig {
    pub fn boundedness(&self) -> Boundedness {
        if self.rows_per_split > 0 {
            Boundedness::Bounded
        } else {
            Boundedness::Unbounded
        }
    }
}

/// One generated partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagenSplit {
    pub partition: u32,
    /// Offsets `0..rows`; `None` never ends
    pub rows: Option<u64>,
}

impl SourceSplit for DatagenSplit {
    fn split_id(&self) -> String {
        format!("datagen-{}", self.partition)
    }
}

struct DatagenDiscovery {
    config: DatagenConfig,
}

#[async_trait]
impl SplitDiscovery<DatagenSplit> for DatagenDiscovery {
    async fn discover(&mut self) -> ConnectorResult<Vec<DatagenSplit>> {
        let rows = (self.config.rows_per_split > 0).then_some(self.config.rows_per_split);
        Ok((0..self.config.splits)
            .map(|partition| DatagenSplit { partition, rows })
            .collect())
    }

    fn boundedness(&self) -> Boundedness {
        self.config.boundedness()
    }
}

/// Reader emitting rows for its assigned partitions
pub struct DatagenReader {
    id: ReaderId,
    table: String,
    batch_size: u64,
    boundedness: Boundedness,
    splits: SplitQueue<DatagenSplit>,
    cancel: CancellationToken,
}

impl DatagenReader {
    pub fn new(id: ReaderId, config: &DatagenConfig, cancel: CancellationToken) -> Self {
        Self {
            id,
            table: config.table.clone(),
            batch_size: u64::from(config.batch_size),
            boundedness: config.boundedness(),
            splits: SplitQueue::new(),
            cancel,
        }
    }
}

#[async_trait]
impl SourceReader for DatagenReader {
    type Split = DatagenSplit;

    fn boundedness(&self) -> Boundedness {
        self.boundedness
    }

    fn add_splits(&mut self, splits: Vec<SplitProgress<DatagenSplit>>) {
        debug!(reader = %self.id, count = splits.len(), "Datagen splits added");
        self.splits.add(splits);
    }

    fn handle_no_more_splits(&mut self) {
        self.splits.set_no_more_splits();
    }

    async fn poll_next(&mut self, output: &mut dyn Collector) -> ConnectorResult<ReadStatus> {
        if self.cancel.is_cancelled() {
            return Ok(ReadStatus::NothingAvailable);
        }
        loop {
            let table = &self.table;
            let batch_size = self.batch_size;
            let Some(progress) = self.splits.current_mut() else {
                return Ok(self.splits.idle_status(self.boundedness));
            };
            let start = progress.position;
            let end = match progress.split.rows {
                Some(rows) => rows.min(start.saturating_add(batch_size)),
                None => start.saturating_add(batch_size),
            };
            if start >= end {
                self.splits.finish_current();
                continue;
            }

            let partition = progress.split.partition;
            for offset in start..end {
                output.collect(
                    row![
                        i64::from(partition),
                        offset as i64,
                        format!("{}-{}-{}", table, partition, offset)
                    ]
                    .with_table(table.clone()),
                );
            }
            progress.position = end;
            metrics::record_rows_read("datagen", (end - start) as usize);
            self.splits.rotate();
            return Ok(ReadStatus::MoreAvailable);
        }
    }

    fn snapshot_state(
        &mut self,
        checkpoint_id: u64,
    ) -> ConnectorResult<SourceReaderState<DatagenSplit>> {
        Ok(self.splits.snapshot(checkpoint_id))
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        debug!(reader = %self.id, finished = self.splits.finished_count(), "Datagen reader closed");
        Ok(())
    }
}

/// Datagen source
#[derive(Debug, Clone, Default)]
pub struct DatagenSource {
    config: DatagenConfig,
}

impl DatagenSource {
    pub fn new(config: DatagenConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &ReadonlyConfig) -> ConnectorResult<Self> {
        Ok(Self::new(config.parse()?))
    }

    fn connector_spec() -> ConnectorSpec {
        ConnectorSpec::builder("datagen", env!("CARGO_PKG_VERSION"))
            .description("Generate deterministic rows for testing and demos")
            .config_schema::<DatagenConfig>()
            .capability(Capability::Bounded)
            .capability(Capability::Unbounded)
            .build()
    }
}

#[async_trait]
impl Source for DatagenSource {
    type Split = DatagenSplit;
    type Reader = DatagenReader;

    fn spec(&self) -> ConnectorSpec {
        Self::connector_spec()
    }

    fn boundedness(&self) -> Boundedness {
        self.config.boundedness()
    }

    fn create_enumerator(
        &self,
        num_readers: u32,
        state: Option<EnumeratorState<DatagenSplit>>,
    ) -> ConnectorResult<SplitEnumerator<DatagenSplit>> {
        let discovery = Box::new(DatagenDiscovery {
            config: self.config.clone(),
        });
        match state {
            Some(state) => SplitEnumerator::restore(
                discovery,
                num_readers,
                AssignmentStrategy::RoundRobin,
                state,
            ),
            None => SplitEnumerator::new(discovery, num_readers, AssignmentStrategy::RoundRobin),
        }
    }

    async fn create_reader(
        &self,
        reader: ReaderId,
        cancel: CancellationToken,
    ) -> ConnectorResult<DatagenReader> {
        Ok(DatagenReader::new(reader, &self.config, cancel))
    }
}

/// Factory for the datagen source
pub struct DatagenSourceFactory;

impl SourceFactory for DatagenSourceFactory {
    fn spec(&self) -> ConnectorSpec {
        DatagenSource::connector_spec()
    }

    fn create(&self, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySource>> {
        Ok(Box::new(DatagenSource::from_config(config)?))
    }
}
