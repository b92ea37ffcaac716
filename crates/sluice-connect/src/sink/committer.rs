//! Aggregated commit
//!
//! Each writer emits at most one commit info per checkpoint. The
//! [`CommitCoordinator`] collects them from every writer and only then
//! combines them and performs the single externally visible commit.
//! Commits must be idempotent: a repeated commit of the same aggregated
//! info after a crash must leave the external system unchanged.

use super::writer::CheckpointData;
use crate::error::{ConnectorError, ConnectorResult};
use crate::metrics;
use crate::retry::{self, RetryDecision, RetryPolicy};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait AggregatedCommitter: Send + Sync {
    type CommitInfo: CheckpointData;
    type AggregatedCommitInfo: CheckpointData;

    /// Merge every writer's commit info for one checkpoint
    fn combine(&self, infos: Vec<Self::CommitInfo>) -> ConnectorResult<Self::AggregatedCommitInfo>;

    /// Make the aggregated infos visible.
    ///
    /// Returns the infos that could not be committed yet and should be retried.
    /// Non-retryable failures are returned as errors.
    async fn commit(
        &self,
        infos: Vec<Self::AggregatedCommitInfo>,
    ) -> ConnectorResult<Vec<Self::AggregatedCommitInfo>>;

    /// Discard staged work; committed data is never touched
    async fn abort(&self, infos: Vec<Self::AggregatedCommitInfo>) -> ConnectorResult<()>;

    async fn close(&self) -> ConnectorResult<()> {
        Ok(())
    }
}

/// Committer for sinks whose writes are visible as soon as they are flushed
#[derive(Debug)]
pub struct NoopCommitter<I>(PhantomData<fn() -> I>);

impl<I> Default for NoopCommitter<I> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<I: CheckpointData> AggregatedCommitter for NoopCommitter<I> {
    type CommitInfo = I;
    type AggregatedCommitInfo = Vec<I>;

    fn combine(&self, infos: Vec<I>) -> ConnectorResult<Vec<I>> {
        Ok(infos)
    }

    async fn commit(&self, _infos: Vec<Vec<I>>) -> ConnectorResult<Vec<Vec<I>>> {
        Ok(Vec::new())
    }

    async fn abort(&self, _infos: Vec<Vec<I>>) -> ConnectorResult<()> {
        Ok(())
    }
}

/// Where a checkpoint stands after a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    /// Still waiting on this many writers
    Waiting(u32),
    /// Every writer has reported
    Complete,
}

#[derive(Debug)]
struct PendingCheckpoint<I> {
    reports: BTreeMap<u32, Option<I>>,
}

/// Rendezvous between parallel writers and one [`AggregatedCommitter`]
pub struct CommitCoordinator<C: AggregatedCommitter> {
    name: String,
    committer: C,
    parallelism: u32,
    policy: RetryPolicy,
    cancel: CancellationToken,
    pending: BTreeMap<u64, PendingCheckpoint<C::CommitInfo>>,
    /// Committed ids at or above `watermark`
    committed: BTreeSet<u64>,
    /// Aborted ids at or above `watermark`
    aborted: BTreeSet<u64>,
    /// Latest committed checkpoint; older finished ids are forgotten
    watermark: u64,
}

impl<C: AggregatedCommitter> CommitCoordinator<C> {
    pub fn new(
        name: impl Into<String>,
        committer: C,
        parallelism: u32,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> ConnectorResult<Self> {
        if parallelism == 0 {
            return Err(ConnectorError::config("commit coordinator needs at least one writer"));
        }
        Ok(Self {
            name: name.into(),
            committer,
            parallelism,
            policy,
            cancel,
            pending: BTreeMap::new(),
            committed: BTreeSet::new(),
            aborted: BTreeSet::new(),
            watermark: 0,
        })
    }

    pub fn committer(&self) -> &C {
        &self.committer
    }

    /// Whether `checkpoint_id` is committed. Ids older than the latest
    /// committed checkpoint are no longer tracked and report `false`.
    pub fn is_committed(&self, checkpoint_id: u64) -> bool {
        self.committed.contains(&checkpoint_id)
    }

    fn is_forgotten(&self, checkpoint_id: u64) -> bool {
        checkpoint_id < self.watermark && !self.pending.contains_key(&checkpoint_id)
    }

    fn mark_committed(&mut self, checkpoint_id: u64) {
        self.pending.remove(&checkpoint_id);
        self.committed.insert(checkpoint_id);
        if checkpoint_id > self.watermark {
            self.watermark = checkpoint_id;
            let watermark = self.watermark;
            self.committed.retain(|&id| id >= watermark);
            self.aborted.retain(|&id| id >= watermark);
        }
    }

    /// Record one writer's prepare result for a checkpoint
    pub fn report(
        &mut self,
        checkpoint_id: u64,
        subtask: u32,
        info: Option<C::CommitInfo>,
    ) -> ConnectorResult<ReportStatus> {
        if subtask >= self.parallelism {
            return Err(ConnectorError::checkpoint(format!(
                "writer {} is outside parallelism {}",
                subtask, self.parallelism
            )));
        }
        if self.committed.contains(&checkpoint_id) {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} is already committed",
                checkpoint_id
            )));
        }
        if self.aborted.contains(&checkpoint_id) {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} was aborted",
                checkpoint_id
            )));
        }
        if self.is_forgotten(checkpoint_id) {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} is older than committed checkpoint {}",
                checkpoint_id, self.watermark
            )));
        }

        let entry = self
            .pending
            .entry(checkpoint_id)
            .or_insert_with(|| PendingCheckpoint {
                reports: BTreeMap::new(),
            });
        if entry.reports.contains_key(&subtask) {
            return Err(ConnectorError::checkpoint(format!(
                "writer {} already reported for checkpoint {}",
                subtask, checkpoint_id
            )));
        }
        entry.reports.insert(subtask, info);

        let reported = entry.reports.len() as u32;
        debug!(
            connector = %self.name,
            checkpoint_id,
            subtask,
            reported,
            parallelism = self.parallelism,
            "Commit info reported"
        );
        if reported == self.parallelism {
            Ok(ReportStatus::Complete)
        } else {
            Ok(ReportStatus::Waiting(self.parallelism - reported))
        }
    }

    /// Combine and commit a checkpoint every writer has reported for.
    ///
    /// Returns the aggregated info that was committed, `None` when no writer
    /// had anything to commit. Exhausting the retry budget fails the checkpoint;
    /// its reports are kept so it can be committed again or aborted.
    pub async fn commit_checkpoint(
        &mut self,
        checkpoint_id: u64,
    ) -> ConnectorResult<Option<C::AggregatedCommitInfo>> {
        if self.committed.contains(&checkpoint_id) {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} is already committed",
                checkpoint_id
            )));
        }
        let reported = self
            .pending
            .get(&checkpoint_id)
            .map(|p| p.reports.len() as u32)
            .unwrap_or(0);
        if reported < self.parallelism {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} has {} of {} commit infos",
                checkpoint_id, reported, self.parallelism
            )));
        }

        let infos: Vec<C::CommitInfo> = self
            .pending
            .get(&checkpoint_id)
            .map(|p| p.reports.values().flatten().cloned().collect())
            .unwrap_or_default();
        if infos.is_empty() {
            self.mark_committed(checkpoint_id);
            debug!(connector = %self.name, checkpoint_id, "Nothing to commit");
            return Ok(None);
        }

        let aggregated = self.committer.combine(infos)?;
        match self.commit_with_retry(vec![aggregated.clone()]).await {
            Ok(()) => {
                self.mark_committed(checkpoint_id);
                metrics::record_commit(&self.name, true);
                info!(connector = %self.name, checkpoint_id, "Checkpoint committed");
                Ok(Some(aggregated))
            }
            Err(e) => {
                metrics::record_commit(&self.name, false);
                warn!(connector = %self.name, checkpoint_id, error = %e, "Checkpoint commit failed");
                Err(e)
            }
        }
    }

    /// Re-commit aggregated infos persisted before a restart
    pub async fn restore_commit(&self, infos: Vec<C::AggregatedCommitInfo>) -> ConnectorResult<()> {
        if infos.is_empty() {
            return Ok(());
        }
        info!(connector = %self.name, count = infos.len(), "Re-committing restored checkpoints");
        self.commit_with_retry(infos).await
    }

    /// Abort an in-flight checkpoint
    pub async fn abort_checkpoint(&mut self, checkpoint_id: u64) -> ConnectorResult<()> {
        if self.committed.contains(&checkpoint_id) {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} is committed and cannot be aborted",
                checkpoint_id
            )));
        }
        if !self.is_forgotten(checkpoint_id) {
            self.aborted.insert(checkpoint_id);
        }
        let infos: Vec<C::CommitInfo> = self
            .pending
            .remove(&checkpoint_id)
            .map(|p| p.reports.into_values().flatten().collect())
            .unwrap_or_default();
        warn!(connector = %self.name, checkpoint_id, reported = infos.len(), "Aborting checkpoint");
        if infos.is_empty() {
            return Ok(());
        }
        let aggregated = self.committer.combine(infos)?;
        self.committer.abort(vec![aggregated]).await
    }

    pub async fn close(&mut self) -> ConnectorResult<()> {
        if !self.pending.is_empty() {
            warn!(
                connector = %self.name,
                checkpoints = ?self.pending.keys().collect::<Vec<_>>(),
                "Closing with uncommitted checkpoints"
            );
        }
        self.committer.close().await
    }

    async fn commit_with_retry(&self, mut infos: Vec<C::AggregatedCommitInfo>) -> ConnectorResult<()> {
        let mut attempts = self.policy.start(format!("{} commit", self.name));
        loop {
            let outcome = match self.committer.commit(infos).await {
                Ok(remaining) if remaining.is_empty() => return Ok(()),
                Ok(remaining) => {
                    let count = remaining.len();
                    infos = remaining;
                    ConnectorError::transient(format!("{} commit infos not yet committed", count))
                }
                Err(e) => return Err(e),
            };
            match attempts.on_failure(outcome) {
                RetryDecision::Backoff(delay) => retry::backoff(delay, &self.cancel).await?,
                RetryDecision::RegenerateIdentity => {}
                RetryDecision::Fail(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet as Set;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Staged(String);

    /// Moves staged names into a visible set, idempotently
    #[derive(Default, Clone)]
    struct SetCommitter {
        visible: Arc<Mutex<Set<String>>>,
        aborted: Arc<Mutex<Vec<String>>>,
        commit_calls: Arc<Mutex<u32>>,
        flaky_calls: u32,
    }

    #[async_trait]
    impl AggregatedCommitter for SetCommitter {
        type CommitInfo = Staged;
        type AggregatedCommitInfo = Vec<String>;

        fn combine(&self, infos: Vec<Staged>) -> ConnectorResult<Vec<String>> {
            let mut names: Vec<String> = infos.into_iter().map(|s| s.0).collect();
            names.sort();
            Ok(names)
        }

        async fn commit(&self, infos: Vec<Vec<String>>) -> ConnectorResult<Vec<Vec<String>>> {
            let call = {
                let mut calls = self.commit_calls.lock();
                *calls += 1;
                *calls
            };
            if call <= self.flaky_calls {
                return Ok(infos);
            }
            let mut visible = self.visible.lock();
            for names in infos {
                visible.extend(names);
            }
            Ok(Vec::new())
        }

        async fn abort(&self, infos: Vec<Vec<String>>) -> ConnectorResult<()> {
            self.aborted.lock().extend(infos.into_iter().flatten());
            Ok(())
        }
    }

    fn coordinator(committer: SetCommitter, parallelism: u32) -> CommitCoordinator<SetCommitter> {
        CommitCoordinator::new(
            "test",
            committer,
            parallelism,
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Backoff::Fixed(Duration::from_millis(5))),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_commit_waits_for_all_writers() {
        let committer = SetCommitter::default();
        let mut c = coordinator(committer.clone(), 2);

        assert_eq!(
            c.report(1, 0, Some(Staged("a".into()))).unwrap(),
            ReportStatus::Waiting(1)
        );
        assert!(c.commit_checkpoint(1).await.is_err());
        assert!(committer.visible.lock().is_empty());

        assert_eq!(
            c.report(1, 1, Some(Staged("b".into()))).unwrap(),
            ReportStatus::Complete
        );
        let committed = c.commit_checkpoint(1).await.unwrap();
        assert_eq!(committed, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(c.is_committed(1));
        assert_eq!(committer.visible.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_late_reports_rejected() {
        let mut c = coordinator(SetCommitter::default(), 1);
        c.report(1, 0, None).unwrap();
        assert!(c.report(1, 0, None).is_err());
        assert!(c.report(1, 5, None).is_err());

        assert_eq!(c.commit_checkpoint(1).await.unwrap(), None);
        assert!(c.report(1, 0, None).is_err());
        assert!(c.abort_checkpoint(1).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_forwards_reported_infos() {
        let committer = SetCommitter::default();
        let mut c = coordinator(committer.clone(), 2);
        c.report(3, 0, Some(Staged("x".into()))).unwrap();
        c.abort_checkpoint(3).await.unwrap();

        assert_eq!(*committer.aborted.lock(), vec!["x".to_string()]);
        assert!(c.report(3, 1, None).is_err());
        assert!(committer.visible.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_commit_retried() {
        let committer = SetCommitter {
            flaky_calls: 2,
            ..Default::default()
        };
        let mut c = coordinator(committer.clone(), 1);
        c.report(1, 0, Some(Staged("a".into()))).unwrap();
        c.commit_checkpoint(1).await.unwrap();
        assert_eq!(*committer.commit_calls.lock(), 3);
        assert!(committer.visible.lock().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_exhaustion_fails_checkpoint() {
        let committer = SetCommitter {
            flaky_calls: 10,
            ..Default::default()
        };
        let mut c = coordinator(committer.clone(), 1);
        c.report(1, 0, Some(Staged("a".into()))).unwrap();
        let err = c.commit_checkpoint(1).await.unwrap_err();
        assert!(matches!(err, ConnectorError::RetriesExhausted { attempts: 3, .. }));
        assert!(!c.is_committed(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_keeps_infos_for_abort() {
        let committer = SetCommitter {
            flaky_calls: 3,
            ..Default::default()
        };
        let mut c = coordinator(committer.clone(), 1);
        c.report(1, 0, Some(Staged("a".into()))).unwrap();
        assert!(c.commit_checkpoint(1).await.is_err());

        c.abort_checkpoint(1).await.unwrap();
        assert_eq!(*committer.aborted.lock(), vec!["a".to_string()]);
        assert!(committer.visible.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_can_be_retried() {
        let committer = SetCommitter {
            flaky_calls: 3,
            ..Default::default()
        };
        let mut c = coordinator(committer.clone(), 1);
        c.report(1, 0, Some(Staged("a".into()))).unwrap();
        assert!(c.commit_checkpoint(1).await.is_err());

        let committed = c.commit_checkpoint(1).await.unwrap();
        assert_eq!(committed, Some(vec!["a".to_string()]));
        assert!(c.is_committed(1));
        assert!(c.pending.is_empty());
    }

    #[tokio::test]
    async fn test_finished_checkpoints_are_pruned() {
        let mut c = coordinator(SetCommitter::default(), 1);
        for id in 1..=50u64 {
            if id % 5 == 0 {
                c.report(id, 0, Some(Staged(id.to_string()))).unwrap();
                c.abort_checkpoint(id).await.unwrap();
            } else {
                c.report(id, 0, Some(Staged(id.to_string()))).unwrap();
                c.commit_checkpoint(id).await.unwrap();
            }
        }
        assert_eq!(c.committed.len(), 1);
        assert!(c.aborted.len() <= 1);
        assert!(c.is_committed(49));
        // a report for a forgotten checkpoint is still rejected
        assert!(c.report(3, 0, None).is_err());
    }

    #[tokio::test]
    async fn test_restore_commit_is_idempotent() {
        let committer = SetCommitter::default();
        let c = coordinator(committer.clone(), 1);
        let agg = vec!["a".to_string()];
        c.restore_commit(vec![agg.clone()]).await.unwrap();
        let once = committer.visible.lock().clone();
        c.restore_commit(vec![agg]).await.unwrap();
        assert_eq!(*committer.visible.lock(), once);
    }
}
