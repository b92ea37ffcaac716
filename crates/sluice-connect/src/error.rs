//! Error types for sluice-connect
//!
//! A single taxonomy shared by sources, sinks, committers and the retry loop.
//! Classification helpers decide what the retry policy may retry.

use std::fmt;
use thiserror::Error;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Errors that can occur in connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Prepare-time failure of a plugin (missing keys, invalid combination)
    #[error("plugin '{plugin}' ({plugin_type}) failed to prepare: {message}")]
    Prepare {
        plugin: String,
        plugin_type: PluginType,
        message: String,
    },

    /// Requested configuration combination is not supported
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Connection to external system failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Authentication failed
    #[error("authentication error: {0}")]
    Auth(String),

    /// Rate limited by external system
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeout waiting for response
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote system reports the batch label or transaction id as already in use
    #[error("identity conflict for '{identity}': {message}")]
    IdentityConflict { identity: String, message: String },

    /// The external system rejected the batch itself
    #[error("malformed batch: {0}")]
    MalformedBatch(String),

    /// Data serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// State management error
    #[error("state error: {0}")]
    State(String),

    /// Checkpoint protocol violation (duplicate report, out-of-order id, ...)
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Transient error that may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Retry budget exhausted
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<ConnectorError>,
    },

    /// Fatal error that will not succeed on retry
    #[error("fatal error: {0}")]
    Fatal(String),

    /// A backoff wait or blocking call was interrupted
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    /// Check if this error is retryable.
    ///
    /// Only network-style failures qualify. Authentication, configuration,
    /// serialization and malformed batches fail immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::RateLimited(_)
                | Self::Timeout(_)
                | Self::Transient(_)
                | Self::Io(_)
        )
    }

    /// The remote system reported a label / transaction id collision
    pub fn is_identity_conflict(&self) -> bool {
        matches!(self, Self::IdentityConflict { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a checkpoint protocol error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an identity conflict error
    pub fn conflict(identity: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::IdentityConflict {
            identity: identity.into(),
            message: msg.into(),
        }
    }

    /// Create a prepare-time error for a plugin
    pub fn prepare(
        plugin: impl Into<String>,
        plugin_type: PluginType,
        msg: impl Into<String>,
    ) -> Self {
        Self::Prepare {
            plugin: plugin.into(),
            plugin_type,
            message: msg.into(),
        }
    }
}

/// Kind of plugin an error originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    Source,
    Sink,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::Source => write!(f, "source"),
            PluginType::Sink => write!(f, "sink"),
        }
    }
}
