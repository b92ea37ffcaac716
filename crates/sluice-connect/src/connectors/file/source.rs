//! Line-oriented file source

use super::{FileSourceConfig, STAGING_DIR};
use crate::error::{ConnectorError, ConnectorResult};
use crate::format::{deserializer_for, RowDeserializer};
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::source::{
    read_with_retry, AssignmentStrategy, Boundedness, Collector, EnumeratorState, ReadStatus,
    ReaderId, Source, SourceReader, SourceReaderState, SourceSplit, SplitDiscovery,
    SplitEnumerator, SplitProgress, SplitQueue,
};
use crate::spec::{Capability, ConnectorSpec};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One input file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSplit {
    pub path: String,
}

impl SourceSplit for FileSplit {
    fn split_id(&self) -> String {
        self.path.clone()
    }
}

struct FileDiscovery {
    root: PathBuf,
    filter: Option<Regex>,
}

impl FileDiscovery {
    fn accepts(&self, name: &str) -> bool {
        !name.starts_with('.')
            && !name.starts_with('_')
            && self.filter.as_ref().map_or(true, |re| re.is_match(name))
    }
}

#[async_trait]
impl SplitDiscovery<FileSplit> for FileDiscovery {
    async fn discover(&mut self) -> ConnectorResult<Vec<FileSplit>> {
        if fs::metadata(&self.root).await?.is_file() {
            return Ok(vec![FileSplit {
                path: self.root.to_string_lossy().into_owned(),
            }]);
        }

        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == STAGING_DIR {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if !name.starts_with('.') {
                        pending.push(entry.path());
                    }
                } else if self.accepts(&name) {
                    found.push(entry.path().to_string_lossy().into_owned());
                }
            }
        }
        found.sort();
        info!(path = %self.root.display(), files = found.len(), "Discovered input files");
        Ok(found.into_iter().map(|path| FileSplit { path }).collect())
    }

    fn boundedness(&self) -> Boundedness {
        Boundedness::Bounded
    }
}

/// Open `path` and skip the lines already emitted
async fn open_at(path: &str, skip: u64) -> ConnectorResult<Lines<BufReader<File>>> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    for _ in 0..skip {
        if lines.next_line().await?.is_none() {
            break;
        }
    }
    Ok(lines)
}

/// Read up to `max` lines, opening `path` after `skip` lines when there is
/// no cursor. A failed attempt drops its cursor, so the next one reopens at
/// the same position.
async fn read_batch(
    cursor: Option<Lines<BufReader<File>>>,
    path: &str,
    skip: u64,
    max: u64,
) -> ConnectorResult<(Lines<BufReader<File>>, Vec<String>, bool)> {
    let mut lines = match cursor {
        Some(lines) => lines,
        None => {
            debug!(path, skip, "Opening input file");
            open_at(path, skip).await?
        }
    };
    let mut batch = Vec::new();
    while (batch.len() as u64) < max {
        match lines.next_line().await? {
            Some(line) => batch.push(line),
            None => return Ok((lines, batch, true)),
        }
    }
    Ok((lines, batch, false))
}

/// Reader emitting one row per line.
///
/// The resume position of a split is the number of lines consumed,
/// blank lines included.
pub struct FileReader {
    id: ReaderId,
    batch_size: u64,
    deserializer: Arc<dyn RowDeserializer>,
    splits: SplitQueue<FileSplit>,
    /// Split id and line cursor of the file being read
    open: Option<(String, Lines<BufReader<File>>)>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl FileReader {
    fn new(id: ReaderId, source: &FileSource, cancel: CancellationToken) -> Self {
        Self {
            id,
            batch_size: u64::from(source.config.batch_size),
            deserializer: source.deserializer.clone(),
            splits: SplitQueue::new(),
            open: None,
            retry: source.retry.clone(),
            cancel,
        }
    }
}

#[async_trait]
impl SourceReader for FileReader {
    type Split = FileSplit;

    fn boundedness(&self) -> Boundedness {
        Boundedness::Bounded
    }

    fn add_splits(&mut self, splits: Vec<SplitProgress<FileSplit>>) {
        debug!(reader = %self.id, count = splits.len(), "File splits added");
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
            let Some(progress) = self.splits.current() else {
                self.open = None;
                return Ok(self.splits.idle_status(Boundedness::Bounded));
            };
            let split_id = progress.split_id();
            let path = progress.split.path.clone();
            let skip = progress.position;
            let max = self.batch_size;
            let mut cursor = match self.open.take() {
                Some((id, lines)) if id == split_id => Some(lines),
                _ => None,
            };
            let (lines, batch, at_eof) =
                read_with_retry(&self.retry, &split_id, &self.cancel, |_| {
                    read_batch(cursor.take(), &path, skip, max)
                })
                .await?;

            // nothing is emitted or counted unless the whole batch decodes
            let rows = batch
                .iter()
                .filter(|line| !line.is_empty())
                .map(|line| self.deserializer.deserialize(line.as_bytes()))
                .collect::<ConnectorResult<Vec<_>>>()?;
            let consumed = batch.len() as u64;
            let emitted = rows.len();
            for row in rows {
                output.collect(row);
            }
            if let Some(progress) = self.splits.current_mut() {
                progress.position += consumed;
            }
            metrics::record_rows_read("file", emitted);

            if at_eof {
                if let Some(done) = self.splits.finish_current() {
                    debug!(reader = %self.id, split = %done.split_id(), lines = done.position, "Input file finished");
                }
                if consumed == 0 {
                    continue;
                }
            } else {
                self.open = Some((split_id, lines));
            }
            return Ok(ReadStatus::MoreAvailable);
        }
    }

    fn snapshot_state(
        &mut self,
        checkpoint_id: u64,
    ) -> ConnectorResult<SourceReaderState<FileSplit>> {
        Ok(self.splits.snapshot(checkpoint_id))
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        self.open = None;
        debug!(reader = %self.id, finished = self.splits.finished_count(), "File reader closed");
        Ok(())
    }
}

/// File source
#[derive(Debug)]
pub struct FileSource {
    config: FileSourceConfig,
    deserializer: Arc<dyn RowDeserializer>,
    filter: Option<Regex>,
    retry: RetryPolicy,
}

impl FileSource {
    pub fn new(config: FileSourceConfig) -> ConnectorResult<Self> {
        let deserializer = deserializer_for(
            config.format,
            config.field_delimiter.as_deref(),
            config.schema.clone(),
        )?;
        let filter = config
            .file_filter_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConnectorError::config(format!("invalid file_filter_pattern: {}", e)))?;
        Ok(Self {
            config,
            deserializer,
            filter,
            retry: RetryPolicy::default(),
        })
    }

    /// Retry limit for opening input files (builder pattern)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn connector_spec() -> ConnectorSpec {
        ConnectorSpec::builder("file", env!("CARGO_PKG_VERSION"))
            .description("Read rows from local text, csv or json files")
            .config_schema::<FileSourceConfig>()
            .capability(Capability::Bounded)
            .build()
    }
}

#[async_trait]
impl Source for FileSource {
    type Split = FileSplit;
    type Reader = FileReader;

    fn spec(&self) -> ConnectorSpec {
        Self::connector_spec()
    }

    fn boundedness(&self) -> Boundedness {
        Boundedness::Bounded
    }

    fn create_enumerator(
        &self,
        num_readers: u32,
        state: Option<EnumeratorState<FileSplit>>,
    ) -> ConnectorResult<SplitEnumerator<FileSplit>> {
        let discovery = Box::new(FileDiscovery {
            root: PathBuf::from(&self.config.path),
            filter: self.filter.clone(),
        });
        match state {
            Some(state) => {
                SplitEnumerator::restore(discovery, num_readers, AssignmentStrategy::Hash, state)
            }
            None => SplitEnumerator::new(discovery, num_readers, AssignmentStrategy::Hash),
        }
    }

    async fn create_reader(
        &self,
        reader: ReaderId,
        cancel: CancellationToken,
    ) -> ConnectorResult<FileReader> {
        Ok(FileReader::new(reader, self, cancel))
    }
}
