//! Console sink connector
//!
//! At-least-once debug sink. Rows are batched like any bulk-load sink and
//! each batch is printed as one block, so it exercises the batch writer
//! without an external system.

use crate::config::{DeliverySemantic, ReadonlyConfig};
use crate::error::{ConnectorError, ConnectorResult};
use crate::format::{serializer_for, Format, RowSerializer};
use crate::registry::{AnySink, SinkFactory};
use crate::sink::{
    Batch, BatchLoadClient, BatchSinkWriter, BatchWriterConfig, NoopCommitter, Sink,
    SinkWriterContext,
};
use crate::spec::ConnectorSpec;
use async_trait::async_trait;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

/// Console sink configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ConsoleSinkConfig {
    /// Row encoding
    #[serde(default)]
    pub format: Format,

    /// Field separator for `text` and `csv`
    #[serde(default)]
    pub field_delimiter: Option<String>,

    /// Printed before every row
    #[serde(default)]
    #[validate(length(max = 64))]
    pub row_prefix: Option<String>,
}

/// Where console output goes
#[derive(Debug, Clone, Default)]
pub enum ConsoleOutput {
    #[default]
    Stdout,
    /// In-memory buffer, shared with the caller
    Buffer(Arc<Mutex<Vec<u8>>>),
}

impl ConsoleOutput {
    pub fn buffer() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        (ConsoleOutput::Buffer(buf.clone()), buf)
    }
}

/// [`BatchLoadClient`] printing every batch
#[derive(Debug)]
pub struct ConsoleClient {
    output: ConsoleOutput,
    row_prefix: Option<String>,
}

impl ConsoleClient {
    pub fn new(output: ConsoleOutput, row_prefix: Option<String>) -> Self {
        Self { output, row_prefix }
    }

    fn render(&self, batch: &Batch) -> Vec<u8> {
        let mut out = Vec::with_capacity(batch.total_bytes + batch.len());
        for row in &batch.rows {
            if let Some(prefix) = &self.row_prefix {
                out.extend_from_slice(prefix.as_bytes());
            }
            out.extend_from_slice(row);
            out.push(b'\n');
        }
        out
    }
}

#[async_trait]
impl BatchLoadClient for ConsoleClient {
    async fn load(&self, label: &str, batch: &Batch) -> ConnectorResult<()> {
        let rendered = self.render(batch);
        match &self.output {
            ConsoleOutput::Stdout => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&rendered)?;
                stdout.flush()?;
            }
            ConsoleOutput::Buffer(buf) => buf.lock().extend_from_slice(&rendered),
        }
        debug!(label, rows = batch.len(), "Printed batch");
        Ok(())
    }

    async fn close(&self) -> ConnectorResult<()> {
        Ok(())
    }
}

/// Console sink
pub struct ConsoleSink {
    config: ConsoleSinkConfig,
    writer_config: BatchWriterConfig,
    serializer: Arc<dyn RowSerializer>,
    output: ConsoleOutput,
}

impl ConsoleSink {
    pub fn new(config: &ReadonlyConfig) -> ConnectorResult<Self> {
        let typed: ConsoleSinkConfig = config.parse()?;
        if !typed.format.is_row_oriented() {
            return Err(ConnectorError::Unsupported(format!(
                "console sink cannot print {} rows",
                typed.format
            )));
        }
        let serializer = serializer_for(typed.format, typed.field_delimiter.as_deref(), None)?;
        Ok(Self {
            writer_config: BatchWriterConfig::from_config("console", config)?,
            config: typed,
            serializer,
            output: ConsoleOutput::Stdout,
        })
    }

    /// Redirect output (builder pattern)
    pub fn with_output(mut self, output: ConsoleOutput) -> Self {
        self.output = output;
        self
    }

    pub fn config(&self) -> &ConsoleSinkConfig {
        &self.config
    }

    fn connector_spec() -> ConnectorSpec {
        ConnectorSpec::builder("console", env!("CARGO_PKG_VERSION"))
            .description("Print rows to stdout for debugging")
            .config_schema::<ConsoleSinkConfig>()
            .semantics([DeliverySemantic::None, DeliverySemantic::AtLeastOnce])
            .build()
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    type Writer = BatchSinkWriter<ConsoleClient>;
    type Committer = NoopCommitter<()>;

    fn spec(&self) -> ConnectorSpec {
        Self::connector_spec()
    }

    async fn create_writer(
        &self,
        context: SinkWriterContext,
        _states: Vec<()>,
    ) -> ConnectorResult<Self::Writer> {
        let client = ConsoleClient::new(self.output.clone(), self.config.row_prefix.clone());
        Ok(BatchSinkWriter::new(
            client,
            self.serializer.clone(),
            self.writer_config.clone(),
            context.cancel,
        ))
    }
}

/// Factory for the console sink
pub struct ConsoleSinkFactory;

impl SinkFactory for ConsoleSinkFactory {
    fn spec(&self) -> ConnectorSpec {
        ConsoleSink::connector_spec()
    }

    fn create(&self, config: &ReadonlyConfig) -> ConnectorResult<Box<dyn AnySink>> {
        Ok(Box::new(ConsoleSink::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use crate::sink::SinkWriter;
    use serde_json::json;

    fn sink(config: serde_json::Value) -> (ConsoleSink, Arc<Mutex<Vec<u8>>>) {
        let (output, buf) = ConsoleOutput::buffer();
        let sink = ConsoleSink::new(&ReadonlyConfig::from_json(config).unwrap())
            .unwrap()
            .with_output(output);
        (sink, buf)
    }

    #[tokio::test]
    async fn test_prints_rows_on_flush() {
        let (sink, buf) = sink(json!({ "format": "csv", "interval_ms": 0, "row_prefix": "> " }));
        let mut writer = sink
            .create_writer(SinkWriterContext::new("job", 0, 1), vec![])
            .await
            .unwrap();
        writer.write(row![1i64, "a"]).await.unwrap();
        writer.write(row![2i64, "b"]).await.unwrap();
        assert!(buf.lock().is_empty());

        writer.close().await.unwrap();
        assert_eq!(String::from_utf8(buf.lock().clone()).unwrap(), "> 1,a\n> 2,b\n");
    }

    #[tokio::test]
    async fn test_max_rows_triggers_flush() {
        let (sink, buf) = sink(json!({ "max_rows": 2, "interval_ms": 0 }));
        let mut writer = sink
            .create_writer(SinkWriterContext::new("job", 0, 1), vec![])
            .await
            .unwrap();
        writer.write(row![1i64]).await.unwrap();
        writer.write(row![2i64]).await.unwrap();
        assert_eq!(String::from_utf8(buf.lock().clone()).unwrap(), "[1]\n[2]\n");
        writer.close().await.unwrap();
    }

    #[test]
    fn test_rejects_columnar_format() {
        let config = ReadonlyConfig::from_json(json!({ "format": "parquet" })).unwrap();
        assert!(matches!(
            ConsoleSink::new(&config),
            Err(ConnectorError::Unsupported(_))
        ));
    }

    #[test]
    fn test_spec() {
        let spec = ConsoleSinkFactory.spec();
        assert_eq!(spec.connector_type, "console");
        assert!(spec.supports(DeliverySemantic::AtLeastOnce));
        assert!(!spec.supports(DeliverySemantic::ExactlyOnce));
        assert!(spec.config_schema.is_some());
    }
}
