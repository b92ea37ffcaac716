//! sluice-connect - checkpoint-aligned connector runtime
//!
//! The contract between a stream-processing engine and the external systems
//! it reads from and writes to.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Source side                                                      │
//! │   SplitEnumerator ── assigns splits ──▶ SourceReader (per task)  │
//! │        │ discovery, ownership, restore        │ rows, positions  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Sink side                                                        │
//! │   SinkWriter (per task) ── commit info ──▶ CommitCoordinator     │
//! │     ├── BatchSinkWriter         (buffer, labelled bulk loads)    │
//! │     ├── TransactionalSinkWriter (one transaction per checkpoint) │
//! │     └── FileSinkWriter          (staged files)                   │
//! │                       AggregatedCommitter ◀── combined infos     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Shared: RetryPolicy, ReadonlyConfig, ConnectorRegistry, metrics  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use sluice_connect::prelude::*;
//! use sluice_connect::connectors::create_default_registry;
//!
//! let registry = create_default_registry();
//! let config = ReadonlyConfig::from_yaml("path: /data/out\nformat: csv")?;
//! let sink = registry.sink("file", &config)?;
//! let mut writer = sink.create_writer_raw(SinkWriterContext::new("job-1", 0, 1), vec![]).await?;
//! ```

pub mod config;
pub mod connectors;
pub mod error;
pub mod format;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod sink;
pub mod source;
pub mod spec;
pub mod telemetry;
pub mod testing;
pub mod types;

pub use config::{DeliverySemantic, ReadonlyConfig};
pub use error::{ConnectorError, ConnectorResult, PluginType};
pub use registry::ConnectorRegistry;
pub use retry::{Backoff, RetryPolicy};
pub use spec::{Capability, ConnectorSpec};
pub use types::{FieldType, FieldValue, Row, RowKind, RowType, SensitiveString};

/// Typed connector traits and the types they use.
///
/// The type-erased `Any*` traits are left out; they share method receivers
/// with the typed ones and are imported from [`registry`] where needed.
pub mod prelude {
    pub use crate::config::{DeliverySemantic, ReadonlyConfig};
    pub use crate::error::{ConnectorError, ConnectorResult};
    pub use crate::format::{Format, RowDeserializer, RowSerializer};
    pub use crate::retry::{Backoff, RetryPolicy};
    pub use crate::sink::{
        AggregatedCommitter, BatchLoadClient, CommitCoordinator, Sink, SinkWriter,
        SinkWriterContext, TransactionalSender,
    };
    pub use crate::source::{
        Boundedness, Collector, ReadStatus, ReaderId, Source, SourceReader, SourceSplit,
        SplitDiscovery, SplitEnumerator, SplitProgress,
    };
    pub use crate::spec::{Capability, ConnectorSpec};
    pub use crate::types::{FieldValue, Row, RowType};
    pub use async_trait::async_trait;
}
