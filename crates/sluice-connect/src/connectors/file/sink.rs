//! Two-phase file sink writer
//!
//! Transaction `n` of a writer collects every row written between
//! checkpoints `n - 1` and `n`. Its files live under
//! `<path>/.sluice_tmp/T_<job>_<subtask>_<n>/` until the committer moves
//! them to the same relative location under `<path>`.

use super::committer::FileCommitInfo;
use super::{extension, FileCommitter, FileSinkConfig, STAGING_DIR, TRANSACTION_ID_PLACEHOLDER};
use crate::config::DeliverySemantic;
use crate::error::{ConnectorError, ConnectorResult};
use crate::format::{serializer_for, RowSerializer};
use crate::metrics;
use crate::sink::{ResourceTable, Sink, SinkResource, SinkWriter, SinkWriterContext};
use crate::spec::{Capability, ConnectorSpec};
use crate::types::{FieldValue, Row};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// Directory name used for null and empty partition values
const NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// Escape a partition name or value into a single path component, the way
/// Hive does: separators and other special characters become `%XX`.
fn escape_path_name(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let special = c.is_control()
            || matches!(
                c,
                '"' | '#' | '%' | '\'' | '*' | '/' | ':' | '=' | '?' | '\\' | '{' | '[' | ']' | '^'
            );
        if special {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Persisted writer state: the last checkpoint whose transaction was handed
/// to the committer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSinkState {
    pub checkpoint_id: u64,
}

/// One open staged file
struct StagedFile {
    writer: BufWriter<File>,
    delimiter: Arc<[u8]>,
    rows: u64,
    bytes: u64,
}

impl StagedFile {
    async fn create(path: PathBuf, delimiter: Arc<[u8]>) -> ConnectorResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        debug!(path = %path.display(), "Opened staged file");
        Ok(Self {
            writer: BufWriter::new(file),
            delimiter,
            rows: 0,
            bytes: 0,
        })
    }

    async fn append(&mut self, payload: &[u8]) -> ConnectorResult<()> {
        if self.rows > 0 {
            self.writer.write_all(&self.delimiter).await?;
            self.bytes += self.delimiter.len() as u64;
        }
        self.writer.write_all(payload).await?;
        self.rows += 1;
        self.bytes += payload.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl SinkResource for StagedFile {
    async fn close(&mut self) -> ConnectorResult<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(())
    }
}

async fn remove_dir_if_exists(dir: &Path) -> ConnectorResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Writer staging rows into per-transaction files
pub struct FileSinkWriter {
    root: PathBuf,
    staging_root: PathBuf,
    file_name_expression: String,
    extension: &'static str,
    serializer: Arc<dyn RowSerializer>,
    row_delimiter: Arc<[u8]>,
    partitions: Arc<[(String, usize)]>,
    txn_prefix: String,
    files: ResourceTable<PathBuf, StagedFile>,
    /// Transaction receiving writes
    current: u64,
    last_checkpoint_id: u64,
    prepared: Option<u64>,
    rows_in_txn: usize,
    bytes_in_txn: usize,
    started: Instant,
    closed: bool,
}

impl std::fmt::Debug for FileSinkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSinkWriter")
            .field("root", &self.root)
            .field("current", &self.current_transaction())
            .field("last_checkpoint_id", &self.last_checkpoint_id)
            .field("open_files", &self.files.len())
            .finish()
    }
}

impl FileSinkWriter {
    async fn open(
        sink: &FileSink,
        context: &SinkWriterContext,
        states: Vec<FileSinkState>,
    ) -> ConnectorResult<Self> {
        let root = PathBuf::from(&sink.config.path);
        let last_checkpoint_id = states.iter().map(|s| s.checkpoint_id).max().unwrap_or(0);
        let writer = Self {
            staging_root: root.join(STAGING_DIR),
            root,
            file_name_expression: sink.config.file_name_expression.clone(),
            extension: extension(sink.config.format),
            serializer: sink.serializer.clone(),
            row_delimiter: Arc::from(sink.config.row_delimiter.as_bytes()),
            partitions: sink.partitions.clone(),
            txn_prefix: format!("T_{}_{}_", context.job_id, context.subtask_index),
            files: ResourceTable::new(),
            current: last_checkpoint_id + 1,
            last_checkpoint_id,
            prepared: None,
            rows_in_txn: 0,
            bytes_in_txn: 0,
            started: Instant::now(),
            closed: false,
        };
        writer.discard_lingering().await?;
        info!(
            path = %writer.root.display(),
            transaction_id = %writer.current_transaction(),
            restored = last_checkpoint_id > 0,
            "File sink writer opened"
        );
        Ok(writer)
    }

    /// Id of the transaction receiving writes
    pub fn current_transaction(&self) -> String {
        self.transaction_id(self.current)
    }

    pub fn last_checkpoint_id(&self) -> u64 {
        self.last_checkpoint_id
    }

    fn transaction_id(&self, n: u64) -> String {
        format!("{}{}", self.txn_prefix, n)
    }

    fn staging_dir(&self, n: u64) -> PathBuf {
        self.staging_root.join(self.transaction_id(n))
    }

    /// Remove this writer's staged transactions newer than the restored
    /// checkpoint. Older ones belong to checkpoints the committer replays.
    async fn discard_lingering(&self) -> ConnectorResult<()> {
        let mut entries = match fs::read_dir(&self.staging_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut discarded = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(n) = name
                .to_str()
                .and_then(|s| s.strip_prefix(&self.txn_prefix))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if n > self.last_checkpoint_id {
                remove_dir_if_exists(&entry.path()).await?;
                discarded += 1;
            }
        }
        if discarded > 0 {
            warn!(path = %self.root.display(), discarded, "Discarded uncommitted staged transactions");
        }
        Ok(())
    }

    fn ensure_open(&self) -> ConnectorResult<()> {
        if self.closed {
            return Err(ConnectorError::state("file sink writer is closed"));
        }
        Ok(())
    }

    /// Path of the file a row goes to, relative to the sink root
    fn relative_path(&self, row: &Row) -> ConnectorResult<PathBuf> {
        let mut rel = PathBuf::new();
        for (name, index) in self.partitions.iter() {
            let value = match row.get(*index) {
                Some(FieldValue::Null) => NULL_PARTITION.to_string(),
                Some(v) => match v.to_string() {
                    v if v.is_empty() => NULL_PARTITION.to_string(),
                    v => escape_path_name(&v),
                },
                None => {
                    return Err(ConnectorError::Serialization(format!(
                        "row has no partition field '{}' at index {}",
                        name, index
                    )))
                }
            };
            rel.push(format!("{}={}", escape_path_name(name), value));
        }
        let stem = self
            .file_name_expression
            .replace(TRANSACTION_ID_PLACEHOLDER, &self.current_transaction());
        rel.push(format!("{}.{}", stem, self.extension));
        Ok(rel)
    }
}

#[async_trait]
impl SinkWriter for FileSinkWriter {
    type CommitInfo = FileCommitInfo;
    type State = FileSinkState;

    async fn write(&mut self, row: Row) -> ConnectorResult<()> {
        self.ensure_open()?;
        let payload = self.serializer.serialize(&row)?;
        let rel = self.relative_path(&row)?;
        let staged = self.staging_dir(self.current).join(&rel);
        let delimiter = self.row_delimiter.clone();
        let file = self
            .files
            .get_or_open(&rel, |_| StagedFile::create(staged, delimiter))
            .await?;
        file.append(&payload).await?;
        self.rows_in_txn += 1;
        self.bytes_in_txn += payload.len();
        Ok(())
    }

    async fn prepare_commit(&mut self, checkpoint_id: u64) -> ConnectorResult<Option<FileCommitInfo>> {
        self.ensure_open()?;
        let written = self.files.close_all().await?;
        metrics::record_flush(
            "file",
            self.rows_in_txn,
            self.bytes_in_txn,
            self.started.elapsed(),
        );
        self.rows_in_txn = 0;
        self.bytes_in_txn = 0;
        self.prepared = Some(self.current);
        if written.is_empty() {
            debug!(checkpoint_id, transaction_id = %self.current_transaction(), "Nothing staged");
            return Ok(None);
        }

        let staging_dir = self.staging_dir(self.current);
        let needs_move: BTreeMap<String, String> = written
            .iter()
            .map(|rel| {
                (
                    staging_dir.join(rel).to_string_lossy().into_owned(),
                    self.root.join(rel).to_string_lossy().into_owned(),
                )
            })
            .collect();
        debug!(
            checkpoint_id,
            transaction_id = %self.current_transaction(),
            files = needs_move.len(),
            "Staged files prepared"
        );
        Ok(Some(FileCommitInfo {
            transaction_id: self.current_transaction(),
            staging_dir: staging_dir.to_string_lossy().into_owned(),
            needs_move,
        }))
    }

    async fn snapshot_state(&mut self, checkpoint_id: u64) -> ConnectorResult<Vec<FileSinkState>> {
        self.ensure_open()?;
        if checkpoint_id <= self.last_checkpoint_id {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} does not follow {}",
                checkpoint_id, self.last_checkpoint_id
            )));
        }
        if self.prepared != Some(self.current) {
            return Err(ConnectorError::checkpoint(format!(
                "snapshot of checkpoint {} before its files were prepared",
                checkpoint_id
            )));
        }
        self.last_checkpoint_id = checkpoint_id;
        self.current = checkpoint_id + 1;
        self.started = Instant::now();
        Ok(vec![FileSinkState { checkpoint_id }])
    }

    async fn abort_prepare(&mut self) -> ConnectorResult<()> {
        let Some(n) = self.prepared.take() else {
            return Ok(());
        };
        remove_dir_if_exists(&self.staging_dir(n)).await?;
        warn!(transaction_id = %self.transaction_id(n), "Prepared files discarded");
        Ok(())
    }

    async fn notify_checkpoint_complete(&mut self, checkpoint_id: u64) -> ConnectorResult<()> {
        if self.prepared.is_some_and(|n| n <= checkpoint_id && n != self.current) {
            self.prepared = None;
        }
        Ok(())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let closed = self.files.close_all().await;
        if self.prepared != Some(self.current) {
            remove_dir_if_exists(&self.staging_dir(self.current)).await?;
        }
        debug!(path = %self.root.display(), "File sink writer closed");
        closed.map(|_| ())
    }
}

/// File sink
#[derive(Debug)]
pub struct FileSink {
    config: FileSinkConfig,
    serializer: Arc<dyn RowSerializer>,
    /// Partition field names with their row index
    partitions: Arc<[(String, usize)]>,
}

impl FileSink {
    pub fn new(config: FileSinkConfig) -> ConnectorResult<Self> {
        let serializer = serializer_for(
            config.format,
            config.field_delimiter.as_deref(),
            config.schema.clone(),
        )?;
        let partitions = config
            .partition_by
            .iter()
            .map(|name| {
                config
                    .schema
                    .as_ref()
                    .and_then(|rt| rt.index_of(name))
                    .map(|index| (name.clone(), index))
                    .ok_or_else(|| {
                        ConnectorError::config(format!(
                            "partition field '{}' is not part of the schema",
                            name
                        ))
                    })
            })
            .collect::<ConnectorResult<Vec<_>>>()?;
        Ok(Self {
            config,
            serializer,
            partitions: partitions.into(),
        })
    }

    pub fn config(&self) -> &FileSinkConfig {
        &self.config
    }

    pub(crate) fn connector_spec() -> ConnectorSpec {
        ConnectorSpec::builder("file", env!("CARGO_PKG_VERSION"))
            .description("Write rows to local files, committed atomically per checkpoint")
            .config_schema::<FileSinkConfig>()
            .capability(Capability::TwoPhaseCommit)
            .semantics([DeliverySemantic::AtLeastOnce, DeliverySemantic::ExactlyOnce])
            .build()
    }
}

#[async_trait]
impl Sink for FileSink {
    type Writer = FileSinkWriter;
    type Committer = FileCommitter;

    fn spec(&self) -> ConnectorSpec {
        Self::connector_spec()
    }

    async fn create_writer(
        &self,
        context: SinkWriterContext,
        states: Vec<FileSinkState>,
    ) -> ConnectorResult<FileSinkWriter> {
        FileSinkWriter::open(self, &context, states).await
    }

    fn create_committer(&self) -> ConnectorResult<Option<FileCommitter>> {
        Ok(Some(FileCommitter::new()))
    }
}
