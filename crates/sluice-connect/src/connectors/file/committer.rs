//! Moves staged files into place

use crate::error::{ConnectorError, ConnectorResult};
use crate::sink::AggregatedCommitter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Files staged by one writer for one checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCommitInfo {
    pub transaction_id: String,
    /// Directory holding the staged files; removed after commit or abort
    pub staging_dir: String,
    /// staged path -> target path
    pub needs_move: BTreeMap<String, String>,
}

/// Every writer's staged files for one checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAggregatedCommitInfo {
    /// Ordered by transaction id
    pub transactions: Vec<FileCommitInfo>,
}

/// Move `staged` to `target` unless a previous commit already did.
async fn move_if_absent(staged: &str, target: &str) -> ConnectorResult<bool> {
    match fs::metadata(staged).await {
        Ok(_) => {
            if let Some(parent) = Path::new(target).parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(staged, target).await?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if fs::try_exists(target).await? {
                Ok(false)
            } else {
                Err(ConnectorError::state(format!(
                    "staged file {} is gone and {} was never written",
                    staged, target
                )))
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_exists(dir: &str) -> ConnectorResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Aggregated committer of the file sink
#[derive(Debug, Clone, Default)]
pub struct FileCommitter;

impl FileCommitter {
    pub fn new() -> Self {
        Self
    }

    async fn commit_transaction(&self, info: &FileCommitInfo) -> ConnectorResult<()> {
        let mut moved = 0usize;
        for (staged, target) in &info.needs_move {
            if move_if_absent(staged, target).await? {
                moved += 1;
            }
        }
        remove_dir_if_exists(&info.staging_dir).await?;
        info!(
            transaction_id = %info.transaction_id,
            files = info.needs_move.len(),
            moved,
            "Committed staged files"
        );
        Ok(())
    }
}

#[async_trait]
impl AggregatedCommitter for FileCommitter {
    type CommitInfo = FileCommitInfo;
    type AggregatedCommitInfo = FileAggregatedCommitInfo;

    fn combine(&self, infos: Vec<FileCommitInfo>) -> ConnectorResult<FileAggregatedCommitInfo> {
        let mut by_id: BTreeMap<String, FileCommitInfo> = BTreeMap::new();
        for info in infos {
            match by_id.get_mut(&info.transaction_id) {
                Some(existing) => existing.needs_move.extend(info.needs_move),
                None => {
                    by_id.insert(info.transaction_id.clone(), info);
                }
            }
        }
        Ok(FileAggregatedCommitInfo {
            transactions: by_id.into_values().collect(),
        })
    }

    async fn commit(
        &self,
        infos: Vec<FileAggregatedCommitInfo>,
    ) -> ConnectorResult<Vec<FileAggregatedCommitInfo>> {
        let mut failed = Vec::new();
        for aggregated in infos {
            let mut remaining = Vec::new();
            for txn in aggregated.transactions {
                match self.commit_transaction(&txn).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        warn!(transaction_id = %txn.transaction_id, error = %e, "File commit failed, will retry");
                        remaining.push(txn);
                    }
                    Err(e) => return Err(e),
                }
            }
            if !remaining.is_empty() {
                failed.push(FileAggregatedCommitInfo {
                    transactions: remaining,
                });
            }
        }
        Ok(failed)
    }

    async fn abort(&self, infos: Vec<FileAggregatedCommitInfo>) -> ConnectorResult<()> {
        let dirs: Vec<String> = infos
            .into_iter()
            .flat_map(|a| a.transactions)
            .map(|t| t.staging_dir)
            .collect();
        let results = futures::future::join_all(dirs.iter().map(|d| remove_dir_if_exists(d))).await;
        for (dir, result) in dirs.iter().zip(&results) {
            match result {
                Ok(()) => debug!(staging_dir = %dir, "Discarded staged files"),
                Err(e) => warn!(staging_dir = %dir, error = %e, "Failed to discard staged files"),
            }
        }
        results.into_iter().collect::<ConnectorResult<Vec<()>>>()?;
        Ok(())
    }
}
