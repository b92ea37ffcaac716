//! Built-in connectors
//!
//! ```text
//! sources: datagen, file
//! sinks:   console (at-least-once, batch writer), file (two-phase commit)
//! ```
//!
//! External systems plug in through the same registry by implementing
//! [`SourceFactory`] / [`SinkFactory`].

pub mod console;
pub mod datagen;
pub mod file;

pub use crate::registry::{ConnectorRegistry, SinkFactory, SourceFactory};

use std::sync::Arc;

/// Create a registry with every built-in connector
pub fn create_default_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();

    registry.register_source("datagen", Arc::new(datagen::DatagenSourceFactory));
    registry.register_source("file", Arc::new(file::FileSourceFactory));

    registry.register_sink("console", Arc::new(console::ConsoleSinkFactory));
    registry.register_sink("file", Arc::new(file::FileSinkFactory));

    registry
}
