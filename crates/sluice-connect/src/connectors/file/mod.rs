//! Local file connectors
//!
//! * [`FileSource`]: every matching file under `path` is one split; the
//!   resume position is the number of lines already emitted.
//! * [`FileSink`]: two-phase sink. Writers stage files under
//!   `<path>/.sluice_tmp/<transaction_id>/`; the [`FileCommitter`] moves them
//!   into place once the checkpoint is complete.
//!
//! # Example Configuration
//!
//! ```yaml
//! sink:
//!   connector: file
//!   config:
//!     path: /data/out
//!     format: text
//!     field_delimiter: "|"
//!     partition_by: [region]
//!     schema:
//!       fields:
//!         - { name: id, type: int }
//!         - { name: region, type: string }
//! ```

mod committer;
mod sink;
mod source;

pub use committer::{FileAggregatedCommitInfo, FileCommitInfo, FileCommitter};
pub use sink::{FileSink, FileSinkState, FileSinkWriter};
pub use source::{FileReader, FileSource, FileSplit};

use crate::config::{check_all_exists, ReadonlyConfig};
use crate::error::{ConnectorError, ConnectorResult, PluginType};
use crate::format::{Format, DEFAULT_ROW_DELIMITER};
use crate::registry::{AnySink, AnySource, SinkFactory, SourceFactory};
use crate::spec::ConnectorSpec;
use crate::types::RowType;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Directory under the sink path holding uncommitted files
pub const STAGING_DIR: &str = ".sluice_tmp";

/// Placeholder replaced by the transaction id in file names
pub const TRANSACTION_ID_PLACEHOLDER: &str = "${transactionId}";

/// File source configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct FileSourceConfig {
    /// Directory (or single file) to read
    #[validate(length(min = 1))]
    pub path: String,

    #[serde(default)]
    pub format: Format,

    /// Field separator for `text` and `csv`
    #[serde(default)]
    pub field_delimiter: Option<String>,

    /// Only read file names matching this regex
    #[serde(default)]
    pub file_filter_pattern: Option<String>,

    /// Field names and types; only for formats without an embedded schema
    #[serde(default)]
    pub schema: Option<RowType>,

    /// Lines emitted per poll
    #[serde(default = "default_read_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: u32,
}

fn default_read_batch_size() -> u32 {
    1000
}

/// File sink configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct FileSinkConfig {
    /// Target directory
    #[validate(length(min = 1))]
    pub path: String,

    #[serde(default)]
    pub format: Format,

    /// Field separator for `text` and `csv`
    #[serde(default)]
    pub field_delimiter: Option<String>,

    /// Written between rows of a file
    #[serde(default = "default_row_delimiter")]
    #[validate(length(min = 1))]
    pub row_delimiter: String,

    /// File name without extension; `${transactionId}` is replaced
    #[serde(default = "default_file_name_expression")]
    #[validate(length(min = 1))]
    pub file_name_expression: String,

    /// Hive-style `<field>=<value>` directories, in order
    #[serde(default)]
    pub partition_by: Vec<String>,

    /// Field names and types of incoming rows
    #[serde(default)]
    pub schema: Option<RowType>,
}

fn default_row_delimiter() -> String {
    DEFAULT_ROW_DELIMITER.to_string()
}

fn default_file_name_expression() -> String {
    TRANSACTION_ID_PLACEHOLDER.to_string()
}

/// File extension for a row-oriented format
pub(crate) fn extension(format: Format) -> &'static str {
    match format {
        Format::Json => "json",
        Format::Text => "txt",
        Format::Csv => "csv",
        Format::Parquet => "parquet",
        Format::Orc => "orc",
    }
}

impl FileSourceConfig {
    /// Check required keys, then parse and validate
    pub fn prepare(config: &ReadonlyConfig) -> ConnectorResult<Self> {
        check_all_exists(config, &["path"]).into_prepare_result("file", PluginType::Source)?;
        let typed: Self = config.parse()?;
        if typed.format.is_self_describing() && typed.schema.is_some() {
            return Err(ConnectorError::Unsupported(format!(
                "a user-defined schema is not supported for {} files, the schema is read from the file",
                typed.format
            )));
        }
        if let Some(pattern) = &typed.file_filter_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| ConnectorError::config(format!("invalid file_filter_pattern: {}", e)))?;
        }
        Ok(typed)
    }
}

impl FileSinkConfig {
    /// Check required keys, then parse and validate
    pub fn prepare(config: &ReadonlyConfig) -> ConnectorResult<Self> {
        check_all_exists(config, &["path"]).into_prepare_result("file", PluginType::Sink)?;
        let typed: Self = config.parse()?;
        if !typed.format.is_row_oriented() {
            return Err(ConnectorError::Unsupported(format!(
                "writing {} files is not supported",
                typed.format
            )));
        }
        if !typed.file_name_expression.contains(TRANSACTION_ID_PLACEHOLDER) {
            return Err(ConnectorError::config(format!(
                "file_name_expression must contain {} so committed files never collide",
                TRANSACTION_ID_PLACEHOLDER
            )));
        }
        for field in &typed.partition_by {
            let known = typed
                .schema
                .as_ref()
                .is_some_and(|rt| rt.index_of(field).is_some());
            if !known {
                return Err(ConnectorError::config(format!(
                    "partition field '{}' is not part of the schema",
                    field
                )));
            }
        }
        Ok(typed)
    }
}

/// Factory for the file source
pub struct FileSourceFactory;

impl SourceFactory for FileSourceFactory {
    fn spec(&self) -> ConnectorSpec {
        FileSource::connector_spec()
    }

    fn create(&self, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySource>> {
        Ok(Box::new(FileSource::new(FileSourceConfig::prepare(config)?)?))
    }
}

/// Factory for the file sink
pub struct FileSinkFactory;

impl SinkFactory for FileSinkFactory {
    fn spec(&self) -> ConnectorSpec {
        FileSink::connector_spec()
    }

    fn create(&self, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySink>> {
        Ok(Box::new(FileSink::new(FileSinkConfig::prepare(config)?)?))
    }
}
