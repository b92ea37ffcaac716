//! Connector registry for runtime lookup
//!
//! The runtime drives connectors it knows only by name. Typed [`Source`] and
//! [`Sink`] implementations are erased behind the `Any*` traits below;
//! splits, writer states and commit infos cross that boundary as opaque
//! JSON blobs so the runtime can persist them without knowing their types.
//!
//! ```text
//! ConnectorRegistry ── name ──> SourceFactory ── config ──> AnySource
//!                                                            ├─ AnyEnumerator
//!                                                            └─ AnySourceReader
//!                   ── name ──> SinkFactory   ── config ──> AnySink
//!                                                            ├─ AnySinkWriter
//!                                                            └─ AnyAggregatedCommitter
//! ```

use crate::config::ReadonlyConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::sink::{AggregatedCommitter, Sink, SinkWriter, SinkWriterContext};
use crate::source::{
    Boundedness, Collector, EnumeratorPhase, EnumeratorState, ReadStatus, ReaderId, Source,
    SourceReader, SourceReaderState, SourceSplit, SplitEnumerator, SplitProgress,
};
use crate::spec::ConnectorSpec;
use crate::types::Row;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn encode<T: Serialize>(value: &T) -> ConnectorResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> ConnectorResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ConnectorError::state(format!("cannot decode {}: {}", what, e)))
}

fn decode_all<T: DeserializeOwned>(blobs: &[Bytes], what: &str) -> ConnectorResult<Vec<T>> {
    blobs.iter().map(|b| decode(b, what)).collect()
}

// ============================================================================
// Sink side
// ============================================================================

/// Type-erased sink writer
#[async_trait]
pub trait AnySinkWriter: Send {
    async fn write_raw(&mut self, row: Row) -> ConnectorResult<()>;

    async fn prepare_commit_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<Option<Bytes>>;

    async fn snapshot_state_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<Vec<Bytes>>;

    async fn abort_prepare_raw(&mut self) -> ConnectorResult<()>;

    async fn notify_checkpoint_complete_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<()>;

    async fn close_raw(&mut self) -> ConnectorResult<()>;
}

#[async_trait]
impl<W: SinkWriter> AnySinkWriter for W {
    async fn write_raw(&mut self, row: Row) -> ConnectorResult<()> {
        self.write(row).await
    }

    async fn prepare_commit_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<Option<Bytes>> {
        match self.prepare_commit(checkpoint_id).await? {
            Some(info) => Ok(Some(encode(&info)?)),
            None => Ok(None),
        }
    }

    async fn snapshot_state_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<Vec<Bytes>> {
        self.snapshot_state(checkpoint_id)
            .await?
            .iter()
            .map(encode)
            .collect()
    }

    async fn abort_prepare_raw(&mut self) -> ConnectorResult<()> {
        self.abort_prepare().await
    }

    async fn notify_checkpoint_complete_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<()> {
        self.notify_checkpoint_complete(checkpoint_id).await
    }

    async fn close_raw(&mut self) -> ConnectorResult<()> {
        self.close().await
    }
}

/// Type-erased aggregated committer
#[async_trait]
pub trait AnyAggregatedCommitter: Send + Sync {
    fn combine_raw(&self, infos: Vec<Bytes>) -> ConnectorResult<Bytes>;

    /// Returns the aggregated infos that still need committing
    async fn commit_raw(&self, infos: Vec<Bytes>) -> ConnectorResult<Vec<Bytes>>;

    async fn abort_raw(&self, infos: Vec<Bytes>) -> ConnectorResult<()>;

    async fn close_raw(&self) -> ConnectorResult<()>;
}

#[async_trait]
impl<C: AggregatedCommitter> AnyAggregatedCommitter for C {
    fn combine_raw(&self, infos: Vec<Bytes>) -> ConnectorResult<Bytes> {
        let infos = decode_all(&infos, "commit info")?;
        encode(&self.combine(infos)?)
    }

    async fn commit_raw(&self, infos: Vec<Bytes>) -> ConnectorResult<Vec<Bytes>> {
        let infos = decode_all(&infos, "aggregated commit info")?;
        self.commit(infos).await?.iter().map(encode).collect()
    }

    async fn abort_raw(&self, infos: Vec<Bytes>) -> ConnectorResult<()> {
        let infos = decode_all(&infos, "aggregated commit info")?;
        self.abort(infos).await
    }

    async fn close_raw(&self) -> ConnectorResult<()> {
        self.close().await
    }
}

/// Type-erased sink
#[async_trait]
pub trait AnySink: Send + Sync {
    async fn create_writer_raw(
        &self,
        context: SinkWriterContext,
        states: Vec<Bytes>,
    ) -> ConnectorResult<Box<dyn AnySinkWriter>>;

    fn create_committer_raw(&self) -> ConnectorResult<Option<Box<dyn AnyAggregatedCommitter>>>;
}

#[async_trait]
impl<S: Sink> AnySink for S {
    async fn create_writer_raw(
        &self,
        context: SinkWriterContext,
        states: Vec<Bytes>,
    ) -> ConnectorResult<Box<dyn AnySinkWriter>> {
        let states = decode_all(&states, "sink writer state")?;
        let writer = self.create_writer(context, states).await?;
        Ok(Box::new(writer))
    }

    fn create_committer_raw(&self) -> ConnectorResult<Option<Box<dyn AnyAggregatedCommitter>>> {
        Ok(self
            .create_committer()?
            .map(|c| Box::new(c) as Box<dyn AnyAggregatedCommitter>))
    }
}

// ============================================================================
// Source side
// ============================================================================

/// Type-erased split enumerator
#[async_trait]
pub trait AnyEnumerator: Send {
    fn phase_raw(&self) -> EnumeratorPhase;

    async fn discover_and_assign_raw(&mut self) -> ConnectorResult<BTreeMap<ReaderId, Vec<Bytes>>>;

    fn register_reader_raw(&mut self, reader: ReaderId) -> ConnectorResult<Vec<Bytes>>;

    fn add_splits_back_raw(&mut self, splits: Vec<Bytes>, reader: ReaderId)
        -> ConnectorResult<()>;

    fn has_no_more_splits_raw(&self, reader: ReaderId) -> bool;

    fn snapshot_state_raw(&self, checkpoint_id: u64) -> ConnectorResult<Bytes>;

    fn close_raw(&mut self);
}

fn encode_assignments<S: SourceSplit>(
    assignments: BTreeMap<ReaderId, Vec<S>>,
) -> ConnectorResult<BTreeMap<ReaderId, Vec<Bytes>>> {
    assignments
        .into_iter()
        .map(|(reader, splits)| {
            let blobs = splits.iter().map(encode).collect::<ConnectorResult<Vec<_>>>()?;
            Ok((reader, blobs))
        })
        .collect()
}

#[async_trait]
impl<S: SourceSplit> AnyEnumerator for SplitEnumerator<S> {
    fn phase_raw(&self) -> EnumeratorPhase {
        self.phase()
    }

    async fn discover_and_assign_raw(&mut self) -> ConnectorResult<BTreeMap<ReaderId, Vec<Bytes>>> {
        encode_assignments(self.discover_and_assign().await?)
    }

    fn register_reader_raw(&mut self, reader: ReaderId) -> ConnectorResult<Vec<Bytes>> {
        self.register_reader(reader)?.iter().map(encode).collect()
    }

    fn add_splits_back_raw(
        &mut self,
        splits: Vec<Bytes>,
        reader: ReaderId,
    ) -> ConnectorResult<()> {
        let splits: Vec<S> = decode_all(&splits, "split")?;
        self.add_splits_back(splits, reader)
    }

    fn has_no_more_splits_raw(&self, reader: ReaderId) -> bool {
        self.has_no_more_splits(reader)
    }

    fn snapshot_state_raw(&self, checkpoint_id: u64) -> ConnectorResult<Bytes> {
        encode(&self.snapshot_state(checkpoint_id)?)
    }

    fn close_raw(&mut self) {
        self.close();
    }
}

/// Type-erased source reader
#[async_trait]
pub trait AnySourceReader: Send {
    fn boundedness_raw(&self) -> Boundedness;

    /// Add splits fresh from the enumerator
    fn add_splits_raw(&mut self, splits: Vec<Bytes>) -> ConnectorResult<()>;

    /// Re-add the splits of a persisted reader state at their positions
    fn restore_raw(&mut self, state: Bytes) -> ConnectorResult<()>;

    fn handle_no_more_splits_raw(&mut self);

    async fn poll_next_raw(&mut self, output: &mut dyn Collector) -> ConnectorResult<ReadStatus>;

    fn snapshot_state_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<Bytes>;

    async fn notify_checkpoint_complete_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<()>;

    async fn close_raw(&mut self) -> ConnectorResult<()>;
}

#[async_trait]
impl<R: SourceReader> AnySourceReader for R {
    fn boundedness_raw(&self) -> Boundedness {
        self.boundedness()
    }

    fn add_splits_raw(&mut self, splits: Vec<Bytes>) -> ConnectorResult<()> {
        let splits: Vec<R::Split> = decode_all(&splits, "split")?;
        self.add_splits(splits.into_iter().map(SplitProgress::fresh).collect());
        Ok(())
    }

    fn restore_raw(&mut self, state: Bytes) -> ConnectorResult<()> {
        let state: SourceReaderState<R::Split> = decode(&state, "source reader state")?;
        self.add_splits(state.splits);
        Ok(())
    }

    fn handle_no_more_splits_raw(&mut self) {
        self.handle_no_more_splits();
    }

    async fn poll_next_raw(&mut self, output: &mut dyn Collector) -> ConnectorResult<ReadStatus> {
        self.poll_next(output).await
    }

    fn snapshot_state_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<Bytes> {
        encode(&self.snapshot_state(checkpoint_id)?)
    }

    async fn notify_checkpoint_complete_raw(&mut self, checkpoint_id: u64) -> ConnectorResult<()> {
        self.notify_checkpoint_complete(checkpoint_id).await
    }

    async fn close_raw(&mut self) -> ConnectorResult<()> {
        self.close().await
    }
}

/// Type-erased source
#[async_trait]
pub trait AnySource: Send + Sync {
    fn boundedness_raw(&self) -> Boundedness;

    fn create_enumerator_raw(
        &self,
        num_readers: u32,
        state: Option<Bytes>,
    ) -> ConnectorResult<Box<dyn AnyEnumerator>>;

    async fn create_reader_raw(
        &self,
        reader: ReaderId,
        cancel: CancellationToken,
    ) -> ConnectorResult<Box<dyn AnySourceReader>>;
}

#[async_trait]
impl<S: Source> AnySource for S {
    fn boundedness_raw(&self) -> Boundedness {
        self.boundedness()
    }

    fn create_enumerator_raw(
        &self,
        num_readers: u32,
        state: Option<Bytes>,
    ) -> ConnectorResult<Box<dyn AnyEnumerator>> {
        let state: Option<EnumeratorState<S::Split>> = state
            .map(|b| decode(&b, "enumerator state"))
            .transpose()?;
        Ok(Box::new(self.create_enumerator(num_readers, state)?))
    }

    async fn create_reader_raw(
        &self,
        reader: ReaderId,
        cancel: CancellationToken,
    ) -> ConnectorResult<Box<dyn AnySourceReader>> {
        Ok(Box::new(self.create_reader(reader, cancel).await?))
    }
}

// ============================================================================
// Factories and registry
// ============================================================================

/// Creates source instances from configuration
pub trait SourceFactory: Send + Sync {
    fn spec(&self) -> ConnectorSpec;

    /// Validate `config` and build the source; fails before anything is opened
    fn create(&self, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySource>>;
}

/// Creates sink instances from configuration
pub trait SinkFactory: Send + Sync {
    fn spec(&self) -> ConnectorSpec;

    /// Validate `config` and build the sink; fails before anything is opened
    fn create(&self, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySink>>;
}

/// Registry of available connectors, keyed by connector name
#[derive(Default)]
pub struct ConnectorRegistry {
    sources: HashMap<String, Arc<dyn SourceFactory>>,
    sinks: HashMap<String, Arc<dyn SinkFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, name: &str, factory: Arc<dyn SourceFactory>) {
        self.sources.insert(name.to_string(), factory);
    }

    pub fn register_sink(&mut self, name: &str, factory: Arc<dyn SinkFactory>) {
        self.sinks.insert(name.to_string(), factory);
    }

    /// Build the source registered under `name`
    pub fn source(&self, name: &str, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySource>> {
        self.sources
            .get(name)
            .ok_or_else(|| ConnectorError::config(format!("unknown source connector: {}", name)))?
            .create(config)
    }

    /// Build the sink registered under `name`
    pub fn sink(&self, name: &str, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySink>> {
        self.sinks
            .get(name)
            .ok_or_else(|| ConnectorError::config(format!("unknown sink connector: {}", name)))?
            .create(config)
    }

    pub fn source_spec(&self, name: &str) -> Option<ConnectorSpec> {
        self.sources.get(name).map(|f| f.spec())
    }

    pub fn sink_spec(&self, name: &str) -> Option<ConnectorSpec> {
        self.sinks.get(name).map(|f| f.spec())
    }

    /// Registered sources with their specs, sorted by name
    pub fn list_sources(&self) -> Vec<(&str, ConnectorSpec)> {
        let mut list: Vec<_> = self
            .sources
            .iter()
            .map(|(name, f)| (name.as_str(), f.spec()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(b.0));
        list
    }

    /// Registered sinks with their specs, sorted by name
    pub fn list_sinks(&self) -> Vec<(&str, ConnectorSpec)> {
        let mut list: Vec<_> = self
            .sinks
            .iter()
            .map(|(name, f)| (name.as_str(), f.spec()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(b.0));
        list
    }

    pub fn contains_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn contains_sink(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }
}
