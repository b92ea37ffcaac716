//! Connector specification types
//!
//! A connector declares what it can do as a set of [`Capability`] flags
//! rather than through a type hierarchy. The registry and the runtime read
//! the set to decide how to drive the connector.

use crate::config::DeliverySemantic;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Things a connector can do beyond the base contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Source terminates after its last split
    Bounded,
    /// Source can run indefinitely
    Unbounded,
    /// Sink writes inside external transactions and supports recovery
    Transactional,
    /// Sink stages work and needs an aggregated committer
    TwoPhaseCommit,
    /// Sink only supports bounded (batch) jobs
    BatchOnly,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Bounded => "bounded",
            Capability::Unbounded => "unbounded",
            Capability::Transactional => "transactional",
            Capability::TwoPhaseCommit => "two_phase_commit",
            Capability::BatchOnly => "batch_only",
        };
        write!(f, "{}", s)
    }
}

/// Connector specification describing its capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSpec {
    /// Unique connector name used as the registry key (e.g., "file", "console")
    pub connector_type: String,

    /// Semantic version
    pub version: String,

    /// Human-readable description
    pub description: Option<String>,

    /// JSON Schema for the connector's configuration
    pub config_schema: Option<serde_json::Value>,

    /// Declared capabilities
    pub capabilities: BTreeSet<Capability>,

    /// Delivery semantics the connector can honour
    pub semantics: Vec<DeliverySemantic>,

    /// Custom metadata
    pub metadata: HashMap<String, String>,
}

impl ConnectorSpec {
    pub fn new(connector_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            version: version.into(),
            description: None,
            config_schema: None,
            capabilities: BTreeSet::new(),
            semantics: vec![DeliverySemantic::AtLeastOnce],
            metadata: HashMap::new(),
        }
    }

    /// Create a builder for fluent construction
    pub fn builder(
        connector_type: impl Into<String>,
        version: impl Into<String>,
    ) -> ConnectorSpecBuilder {
        ConnectorSpecBuilder {
            spec: ConnectorSpec::new(connector_type, version),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports(&self, semantic: DeliverySemantic) -> bool {
        self.semantics.contains(&semantic)
    }
}

/// Builder for ConnectorSpec
#[derive(Debug)]
pub struct ConnectorSpecBuilder {
    spec: ConnectorSpec,
}

impl ConnectorSpecBuilder {
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.spec.description = Some(desc.into());
        self
    }

    /// Set config schema from a type implementing JsonSchema
    pub fn config_schema<T: JsonSchema>(mut self) -> Self {
        let schema = schemars::schema_for!(T);
        self.spec.config_schema = serde_json::to_value(schema).ok();
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.spec.capabilities.insert(capability);
        self
    }

    pub fn semantics(mut self, semantics: impl IntoIterator<Item = DeliverySemantic>) -> Self {
        self.spec.semantics = semantics.into_iter().collect();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ConnectorSpec {
        self.spec
    }
}
