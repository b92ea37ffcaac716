//! Splits: units of partitioned source work

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable description of one unit of source work.
///
/// Identity is [`SourceSplit::split_id`]; two splits with the same id are the
/// same work no matter which process discovered them.
pub trait SourceSplit:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    fn split_id(&self) -> String;
}

/// Whether a source terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundedness {
    /// Finite; the job completes after the last split
    Bounded,
    /// Continuous polling
    Unbounded,
}

/// Parallel reader instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReaderId(pub u32);

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader-{}", self.0)
    }
}

impl From<u32> for ReaderId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A split together with how far it has been read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: SourceSplit")]
pub struct SplitProgress<S> {
    pub split: S,
    /// Connector-defined resume position (record offset, line number, ...)
    pub position: u64,
}

impl<S: SourceSplit> SplitProgress<S> {
    /// A split that has not been read yet
    pub fn fresh(split: S) -> Self {
        Self { split, position: 0 }
    }

    pub fn at(split: S, position: u64) -> Self {
        Self { split, position }
    }

    pub fn split_id(&self) -> String {
        self.split.split_id()
    }
}
