//! Transactional writer and committer
//!
//! For external systems with native transactions. Every checkpoint gets its
//! own transaction whose id is derived from the checkpoint id:
//! `<prefix>-<checkpoint>`. After `snapshot_state(c)` the writer immediately
//! begins `<prefix>-<c+1>`, so rows arriving while checkpoint `c` is being
//! acknowledged never land in the transaction being committed.
//!
//! Each parallel writer owns its own id space: on first run the prefix is
//! the configured (or random) base followed by the subtask index, e.g.
//! `orders-2`, and it is persisted in the writer state from then on.
//!
//! On restart from state `{prefix, c}` the writer aborts every transaction
//! `<prefix>-<n>` with `n > c` that a dead process may have left open, then
//! begins `<prefix>-<c+1>`.

use super::committer::AggregatedCommitter;
use super::writer::{SinkWriter, SinkWriterContext};
use crate::config::{delivery_semantic, DeliverySemantic, ReadonlyConfig, RetrySettings};
use crate::error::{ConnectorError, ConnectorResult};
use crate::format::RowSerializer;
use crate::metrics;
use crate::retry::{self, RetryPolicy};
use crate::types::{Row, RowType};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Random prefixes are drawn from `0..PREFIX_RANGE`
const PREFIX_RANGE: u32 = 10_000;

/// Upper bound on ids probed during recovery
const MAX_RECOVERY_PROBES: u64 = 100_000;

/// Deterministic transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    pub prefix: String,
    pub checkpoint_id: u64,
}

impl TransactionId {
    pub fn new(prefix: impl Into<String>, checkpoint_id: u64) -> Self {
        Self {
            prefix: prefix.into(),
            checkpoint_id,
        }
    }

    /// Parse `<prefix>-<checkpoint>`; the prefix itself may contain dashes
    pub fn parse(s: &str) -> Option<Self> {
        let (prefix, id) = s.rsplit_once('-')?;
        if prefix.is_empty() {
            return None;
        }
        Some(Self::new(prefix, id.parse().ok()?))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.checkpoint_id)
    }
}

/// Resolve the transaction prefix for a first run
pub fn resolve_prefix(configured: Option<&str>) -> String {
    match configured {
        Some(p) if !p.trim().is_empty() => p.to_string(),
        _ => format!(
            "Sluice{:04}",
            rand::thread_rng().gen_range(0..PREFIX_RANGE)
        ),
    }
}

/// Prefix of one writer instance: `<base>-<subtask>`
pub fn instance_prefix(base: &str, subtask_index: u32) -> String {
    format!("{}-{}", base, subtask_index)
}

/// Result of aborting a transaction by id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// An open transaction was rolled back
    Aborted,
    /// No transaction with that id was ever opened
    Unknown,
    /// The transaction was committed before; nothing changed
    AlreadyCommitted,
}

/// A serialized row on its way to the external system
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    /// Routing key, e.g. the partition key of a topic
    pub key: Option<String>,
    pub payload: Bytes,
}

/// Client of a transactional external system
#[async_trait]
pub trait TransactionalSender: Send + Sync + 'static {
    async fn begin(&self, txn: &TransactionId) -> ConnectorResult<()>;

    /// Send inside `txn`, or untransacted when `None`
    async fn send(&self, txn: Option<&TransactionId>, record: OutgoingRecord)
        -> ConnectorResult<()>;

    /// Wait until everything sent in `txn` is acknowledged
    async fn flush(&self, txn: Option<&TransactionId>) -> ConnectorResult<()>;

    /// Commit by id; committing an already committed id is a no-op
    async fn commit(&self, txn: &TransactionId) -> ConnectorResult<()>;

    async fn abort(&self, txn: &TransactionId) -> ConnectorResult<AbortOutcome>;

    async fn close(&self) -> ConnectorResult<()>;
}

/// Commit token of one writer for one checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCommitInfo {
    pub transaction_id: TransactionId,
}

/// All transactions of one checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAggregatedCommitInfo {
    pub transaction_ids: Vec<TransactionId>,
}

/// Persisted writer state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionalSinkState {
    pub transaction_prefix: String,
    pub checkpoint_id: u64,
}

/// Settings of a [`TransactionalSinkWriter`]
#[derive(Debug, Clone)]
pub struct TransactionalWriterConfig {
    /// Connector name, used in logs and metrics
    pub name: String,
    pub semantic: DeliverySemantic,
    /// Fixed base prefix; a random one is chosen on first run otherwise.
    /// Writers append their subtask index.
    pub transaction_prefix: Option<String>,
    pub retry: RetryPolicy,
    /// Recovery stops after this many consecutive unknown ids
    pub recovery_probe_window: u32,
    /// Field name (or constant) used as the routing key
    pub partition_key: Option<String>,
    pub row_type: Option<RowType>,
}

impl TransactionalWriterConfig {
    pub fn new(name: impl Into<String>, semantic: DeliverySemantic) -> Self {
        Self {
            name: name.into(),
            semantic,
            transaction_prefix: None,
            retry: RetryPolicy::default(),
            recovery_probe_window: 3,
            partition_key: None,
            row_type: None,
        }
    }

    /// Read `semantics`, `transaction_prefix`, `partition_key` and retry settings
    pub fn from_config(name: impl Into<String>, config: &ReadonlyConfig) -> ConnectorResult<Self> {
        Ok(Self {
            name: name.into(),
            semantic: delivery_semantic(config)?,
            transaction_prefix: config.get("transaction_prefix")?,
            retry: RetryPolicy::from_settings(&RetrySettings::from_config(config)?),
            recovery_probe_window: config.get_or("recovery_probe_window", 3)?,
            partition_key: config.get("partition_key")?,
            row_type: config.get("schema")?,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.transaction_prefix = Some(prefix.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_recovery_probe_window(mut self, window: u32) -> Self {
        self.recovery_probe_window = window.max(1);
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>, row_type: Option<RowType>) -> Self {
        self.partition_key = Some(key.into());
        self.row_type = row_type;
        self
    }
}

/// How the routing key is derived from a row
#[derive(Debug, Clone)]
enum KeyExtractor {
    None,
    Field(usize),
    Constant(String),
}

impl KeyExtractor {
    fn new(partition_key: Option<&str>, row_type: Option<&RowType>) -> Self {
        match partition_key {
            None => KeyExtractor::None,
            Some(key) => match row_type.and_then(|rt| rt.index_of(key)) {
                Some(index) => KeyExtractor::Field(index),
                None => KeyExtractor::Constant(key.to_string()),
            },
        }
    }

    fn extract(&self, row: &Row) -> Option<String> {
        match self {
            KeyExtractor::None => None,
            KeyExtractor::Constant(k) => Some(k.clone()),
            KeyExtractor::Field(i) => row
                .get(*i)
                .filter(|v| !v.is_null())
                .map(|v| v.to_string()),
        }
    }
}

/// Writer over a [`TransactionalSender`]
pub struct TransactionalSinkWriter<T: TransactionalSender> {
    sender: Arc<T>,
    serializer: Arc<dyn RowSerializer>,
    name: String,
    semantic: DeliverySemantic,
    policy: RetryPolicy,
    cancel: CancellationToken,
    key: KeyExtractor,
    prefix: String,
    last_checkpoint_id: u64,
    current: Option<TransactionId>,
    prepared: Option<TransactionId>,
    closed: bool,
}

impl<T: TransactionalSender> TransactionalSinkWriter<T> {
    /// Create a writer, recovering from `states` when present.
    ///
    /// With exactly-once delivery this aborts lingering transactions from a
    /// previous run and begins the first transaction before returning.
    pub async fn open(
        sender: Arc<T>,
        serializer: Arc<dyn RowSerializer>,
        config: TransactionalWriterConfig,
        states: Vec<TransactionalSinkState>,
        context: &SinkWriterContext,
    ) -> ConnectorResult<Self> {
        let restored = states.first();
        let prefix = match restored {
            Some(state) => state.transaction_prefix.clone(),
            None => instance_prefix(
                &resolve_prefix(config.transaction_prefix.as_deref()),
                context.subtask_index,
            ),
        };
        let last_checkpoint_id = restored.map(|s| s.checkpoint_id).unwrap_or(0);

        let mut writer = Self {
            sender,
            serializer,
            key: KeyExtractor::new(config.partition_key.as_deref(), config.row_type.as_ref()),
            name: config.name,
            semantic: config.semantic,
            policy: config.retry,
            cancel: context.cancel.clone(),
            prefix,
            last_checkpoint_id,
            current: None,
            prepared: None,
            closed: false,
        };

        if writer.is_transactional() {
            if restored.is_some() {
                writer
                    .abort_lingering(last_checkpoint_id + 1, config.recovery_probe_window.max(1))
                    .await?;
            }
            writer.begin(last_checkpoint_id + 1).await?;
        }
        info!(
            connector = %writer.name,
            subtask = context.subtask_index,
            prefix = %writer.prefix,
            semantic = %writer.semantic,
            last_checkpoint_id,
            "Transactional writer opened"
        );
        Ok(writer)
    }

    fn is_transactional(&self) -> bool {
        self.semantic == DeliverySemantic::ExactlyOnce
    }

    pub fn transaction_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn current_transaction(&self) -> Option<&TransactionId> {
        self.current.as_ref()
    }

    pub fn last_checkpoint_id(&self) -> u64 {
        self.last_checkpoint_id
    }

    fn ensure_open(&self) -> ConnectorResult<()> {
        if self.closed {
            return Err(ConnectorError::state("sink writer is closed"));
        }
        Ok(())
    }

    async fn begin(&mut self, checkpoint_id: u64) -> ConnectorResult<()> {
        let txn = TransactionId::new(self.prefix.clone(), checkpoint_id);
        let sender = &self.sender;
        retry::retry(&self.policy, "begin transaction", &self.cancel, |_| {
            sender.begin(&txn)
        })
        .await?;
        metrics::record_transaction_begun(&self.name);
        debug!(connector = %self.name, transaction_id = %txn, "Transaction begun");
        self.current = Some(txn);
        Ok(())
    }

    async fn abort_one(&self, txn: &TransactionId) -> ConnectorResult<AbortOutcome> {
        let sender = &self.sender;
        retry::retry(&self.policy, "abort transaction", &self.cancel, |_| {
            sender.abort(txn)
        })
        .await
    }

    /// Abort `<prefix>-<from>`, `<prefix>-<from+1>`, ... until `window`
    /// consecutive ids turn out never to have been opened.
    async fn abort_lingering(&self, from: u64, window: u32) -> ConnectorResult<()> {
        let mut unknown_run = 0u32;
        let mut aborted = 0usize;
        let mut id = from;
        while unknown_run < window && id < from.saturating_add(MAX_RECOVERY_PROBES) {
            let txn = TransactionId::new(self.prefix.clone(), id);
            match self.abort_one(&txn).await? {
                AbortOutcome::Aborted => {
                    unknown_run = 0;
                    aborted += 1;
                    info!(connector = %self.name, transaction_id = %txn, "Aborted lingering transaction");
                }
                AbortOutcome::Unknown => unknown_run += 1,
                AbortOutcome::AlreadyCommitted => {
                    unknown_run = 0;
                    warn!(
                        connector = %self.name,
                        transaction_id = %txn,
                        "Transaction past the restored checkpoint is already committed"
                    );
                }
            }
            id += 1;
        }
        metrics::record_transaction_aborted(&self.name, aborted);
        info!(
            connector = %self.name,
            prefix = %self.prefix,
            from,
            aborted,
            "Recovery finished"
        );
        Ok(())
    }

    fn current_for_send(&self) -> ConnectorResult<Option<&TransactionId>> {
        if !self.is_transactional() {
            return Ok(None);
        }
        self.current
            .as_ref()
            .map(Some)
            .ok_or_else(|| ConnectorError::state("no open transaction"))
    }

    async fn flush_current(&self) -> ConnectorResult<()> {
        let txn = self.current_for_send()?;
        let sender = &self.sender;
        retry::retry(&self.policy, "flush", &self.cancel, |_| sender.flush(txn)).await
    }
}

#[async_trait]
impl<T: TransactionalSender> SinkWriter for TransactionalSinkWriter<T> {
    type CommitInfo = TransactionCommitInfo;
    type State = TransactionalSinkState;

    async fn write(&mut self, row: Row) -> ConnectorResult<()> {
        self.ensure_open()?;
        let record = OutgoingRecord {
            key: self.key.extract(&row),
            payload: Bytes::from(self.serializer.serialize(&row)?),
        };
        let txn = self.current_for_send()?;
        let sender = &self.sender;
        retry::retry(&self.policy, "send", &self.cancel, |_| {
            sender.send(txn, record.clone())
        })
        .await
    }

    async fn prepare_commit(
        &mut self,
        checkpoint_id: u64,
    ) -> ConnectorResult<Option<TransactionCommitInfo>> {
        self.ensure_open()?;
        self.flush_current().await?;
        if !self.is_transactional() {
            return Ok(None);
        }
        let txn = self
            .current
            .clone()
            .ok_or_else(|| ConnectorError::state("no open transaction"))?;
        debug!(connector = %self.name, checkpoint_id, transaction_id = %txn, "Transaction prepared");
        self.prepared = Some(txn.clone());
        Ok(Some(TransactionCommitInfo {
            transaction_id: txn,
        }))
    }

    async fn snapshot_state(
        &mut self,
        checkpoint_id: u64,
    ) -> ConnectorResult<Vec<TransactionalSinkState>> {
        self.ensure_open()?;
        if checkpoint_id <= self.last_checkpoint_id {
            return Err(ConnectorError::checkpoint(format!(
                "checkpoint {} does not follow {}",
                checkpoint_id, self.last_checkpoint_id
            )));
        }
        if self.is_transactional() && self.prepared != self.current {
            return Err(ConnectorError::checkpoint(format!(
                "snapshot of checkpoint {} before its transaction was prepared",
                checkpoint_id
            )));
        }

        let state = TransactionalSinkState {
            transaction_prefix: self.prefix.clone(),
            checkpoint_id,
        };
        self.last_checkpoint_id = checkpoint_id;
        if self.is_transactional() {
            self.begin(checkpoint_id + 1).await?;
        }
        Ok(vec![state])
    }

    async fn abort_prepare(&mut self) -> ConnectorResult<()> {
        let Some(txn) = self.prepared.take() else {
            return Ok(());
        };
        let outcome = self.abort_one(&txn).await?;
        metrics::record_transaction_aborted(&self.name, 1);
        warn!(connector = %self.name, transaction_id = %txn, ?outcome, "Prepared transaction aborted");
        if self.current.as_ref() == Some(&txn) {
            // the aborted transaction was still the open one; reopen it empty
            self.begin(txn.checkpoint_id).await?;
        }
        Ok(())
    }

    async fn notify_checkpoint_complete(&mut self, checkpoint_id: u64) -> ConnectorResult<()> {
        if self
            .prepared
            .as_ref()
            .is_some_and(|p| Some(p) != self.current.as_ref())
        {
            self.prepared = None;
        }
        debug!(connector = %self.name, checkpoint_id, "Checkpoint complete");
        Ok(())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.flush_current().await;
        self.closed = true;

        // the transaction opened after the last snapshot holds nothing committed
        if let Some(txn) = self.current.take() {
            if self.prepared.as_ref() != Some(&txn) {
                if let Err(e) = self.abort_one(&txn).await {
                    warn!(connector = %self.name, transaction_id = %txn, error = %e, "Failed to abort open transaction on close");
                }
            }
        }
        if let Err(e) = self.sender.close().await {
            warn!(connector = %self.name, error = %e, "Failed to close sender");
        }
        flushed
    }
}

/// Commits the transactions of every writer of a checkpoint
pub struct TransactionCommitter<T: TransactionalSender> {
    sender: Arc<T>,
    name: String,
}

impl<T: TransactionalSender> TransactionCommitter<T> {
    pub fn new(name: impl Into<String>, sender: Arc<T>) -> Self {
        Self {
            sender,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<T: TransactionalSender> AggregatedCommitter for TransactionCommitter<T> {
    type CommitInfo = TransactionCommitInfo;
    type AggregatedCommitInfo = TransactionAggregatedCommitInfo;

    fn combine(
        &self,
        infos: Vec<TransactionCommitInfo>,
    ) -> ConnectorResult<TransactionAggregatedCommitInfo> {
        let mut transaction_ids: Vec<TransactionId> =
            infos.into_iter().map(|i| i.transaction_id).collect();
        transaction_ids.sort();
        transaction_ids.dedup();
        Ok(TransactionAggregatedCommitInfo { transaction_ids })
    }

    async fn commit(
        &self,
        infos: Vec<TransactionAggregatedCommitInfo>,
    ) -> ConnectorResult<Vec<TransactionAggregatedCommitInfo>> {
        let mut failed = Vec::new();
        for info in infos {
            let mut remaining = Vec::new();
            for txn in info.transaction_ids {
                match self.sender.commit(&txn).await {
                    Ok(()) => debug!(connector = %self.name, transaction_id = %txn, "Transaction committed"),
                    Err(e) if e.is_retryable() => {
                        warn!(connector = %self.name, transaction_id = %txn, error = %e, "Commit failed, will retry");
                        remaining.push(txn);
                    }
                    Err(e) => return Err(e),
                }
            }
            if !remaining.is_empty() {
                failed.push(TransactionAggregatedCommitInfo {
                    transaction_ids: remaining,
                });
            }
        }
        Ok(failed)
    }

    async fn abort(&self, infos: Vec<TransactionAggregatedCommitInfo>) -> ConnectorResult<()> {
        for txn in infos.into_iter().flat_map(|i| i.transaction_ids) {
            match self.sender.abort(&txn).await? {
                AbortOutcome::AlreadyCommitted => warn!(
                    connector = %self.name,
                    transaction_id = %txn,
                    "Cannot abort a committed transaction"
                ),
                outcome => debug!(connector = %self.name, transaction_id = %txn, ?outcome, "Transaction aborted"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::JsonRowSerializer;
    use crate::row;
    use crate::testing::{MockTransactionStore, TxnStatus};
    use crate::types::FieldType;

    async fn open(
        store: &Arc<MockTransactionStore>,
        prefix: Option<&str>,
        states: Vec<TransactionalSinkState>,
    ) -> TransactionalSinkWriter<MockTransactionStore> {
        let mut config = TransactionalWriterConfig::new("test", DeliverySemantic::ExactlyOnce);
        if let Some(p) = prefix {
            config = config.with_prefix(p);
        }
        TransactionalSinkWriter::open(
            store.clone(),
            Arc::new(JsonRowSerializer::default()),
            config,
            states,
            &SinkWriterContext::new("job", 0, 1),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_transaction_id_format() {
        let txn = TransactionId::new("P", 6);
        assert_eq!(txn.to_string(), "P-6");
        assert_eq!(TransactionId::parse("my-job-12"), Some(TransactionId::new("my-job", 12)));
        assert_eq!(TransactionId::parse("nodash"), None);
    }

    #[test]
    fn test_instance_prefix() {
        assert_eq!(instance_prefix("orders", 3), "orders-3");
        let txn = TransactionId::new(instance_prefix("orders", 3), 7);
        assert_eq!(TransactionId::parse(&txn.to_string()), Some(txn));
    }

    #[test]
    fn test_random_prefix_shape() {
        let p = resolve_prefix(None);
        assert!(p.starts_with("Sluice"));
        assert_eq!(p.len(), "Sluice".len() + 4);
        assert_eq!(resolve_prefix(Some("mine")), "mine");
        assert!(resolve_prefix(Some("  ")).starts_with("Sluice"));
    }

    #[tokio::test]
    async fn test_fresh_writer_begins_first_transaction() {
        let store = Arc::new(MockTransactionStore::new());
        let w = open(&store, Some("P"), vec![]).await;
        assert_eq!(w.current_transaction(), Some(&TransactionId::new("P-0", 1)));
        assert!(store.aborted().is_empty());
    }

    #[tokio::test]
    async fn test_restart_aborts_superseded_and_begins_next() {
        let store = Arc::new(MockTransactionStore::new());
        // a dead writer opened P-6 and P-7 after checkpoint 5
        store.open_externally("P-6");
        store.open_externally("P-7");

        let restored = vec![TransactionalSinkState {
            transaction_prefix: "P".into(),
            checkpoint_id: 5,
        }];
        let w = open(&store, Some("ignored"), restored).await;

        assert_eq!(store.aborted(), vec!["P-6".to_string(), "P-7".to_string()]);
        assert_eq!(store.begun(), vec!["P-6".to_string()]);
        assert_eq!(w.current_transaction(), Some(&TransactionId::new("P", 6)));
        assert_eq!(w.transaction_prefix(), "P");
        assert_eq!(store.status("P-6"), Some(TxnStatus::Open));
    }

    #[tokio::test]
    async fn test_checkpoint_flow_orders_transactions() {
        let store = Arc::new(MockTransactionStore::new());
        let mut w = open(&store, Some("P"), vec![]).await;

        w.write(row![1i64]).await.unwrap();
        let info = w.prepare_commit(1).await.unwrap().unwrap();
        assert_eq!(info.transaction_id, TransactionId::new("P-0", 1));
        // the next transaction is not begun before the snapshot
        assert_eq!(store.begun(), vec!["P-0-1".to_string()]);

        let state = w.snapshot_state(1).await.unwrap();
        assert_eq!(state[0].checkpoint_id, 1);
        assert_eq!(store.begun(), vec!["P-0-1".to_string(), "P-0-2".to_string()]);

        // rows after the snapshot go to P-2
        w.write(row![2i64]).await.unwrap();
        assert_eq!(store.records("P-0-1").len(), 1);
        assert_eq!(store.records("P-0-2").len(), 1);

        assert!(w.snapshot_state(1).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_requires_prepare() {
        let store = Arc::new(MockTransactionStore::new());
        let mut w = open(&store, Some("P"), vec![]).await;
        assert!(matches!(
            w.snapshot_state(1).await,
            Err(ConnectorError::Checkpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_prepare_rolls_back_prepared_only() {
        let store = Arc::new(MockTransactionStore::new());
        let committer = TransactionCommitter::new("test", store.clone());
        let mut w = open(&store, Some("P"), vec![]).await;

        w.write(row![1i64]).await.unwrap();
        let first = w.prepare_commit(1).await.unwrap().unwrap();
        w.snapshot_state(1).await.unwrap();
        let agg = committer.combine(vec![first]).unwrap();
        assert!(committer.commit(vec![agg]).await.unwrap().is_empty());
        w.notify_checkpoint_complete(1).await.unwrap();

        w.write(row![2i64]).await.unwrap();
        w.prepare_commit(2).await.unwrap();
        w.abort_prepare().await.unwrap();

        assert_eq!(store.status("P-0-1"), Some(TxnStatus::Committed));
        // P-2 was prepared and still open: aborted, then reopened empty
        assert_eq!(store.status("P-0-2"), Some(TxnStatus::Open));
        assert!(store.records("P-0-2").is_empty());
        assert!(store.aborted().contains(&"P-0-2".to_string()));
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = Arc::new(MockTransactionStore::new());
        let committer = TransactionCommitter::new("test", store.clone());
        let mut w = open(&store, Some("P"), vec![]).await;
        w.write(row![1i64]).await.unwrap();
        let info = w.prepare_commit(1).await.unwrap().unwrap();

        let agg = committer.combine(vec![info.clone(), info]).unwrap();
        assert_eq!(agg.transaction_ids.len(), 1);
        committer.commit(vec![agg.clone()]).await.unwrap();
        let after_first = store.committed_records();
        committer.commit(vec![agg]).await.unwrap();
        assert_eq!(store.committed_records(), after_first);
        assert_eq!(after_first.len(), 1);
    }

    #[tokio::test]
    async fn test_at_least_once_sends_untransacted() {
        let store = Arc::new(MockTransactionStore::new());
        let mut w = TransactionalSinkWriter::open(
            store.clone(),
            Arc::new(JsonRowSerializer::default()),
            TransactionalWriterConfig::new("test", DeliverySemantic::AtLeastOnce),
            vec![],
            &SinkWriterContext::new("job", 0, 1),
        )
        .await
        .unwrap();
        w.write(row![1i64]).await.unwrap();
        assert!(w.prepare_commit(1).await.unwrap().is_none());
        assert!(store.begun().is_empty());
        assert_eq!(store.untransacted_records().len(), 1);
    }

    #[tokio::test]
    async fn test_partition_key_extraction() {
        let store = Arc::new(MockTransactionStore::new());
        let rt = RowType::new()
            .field("id", FieldType::Int)
            .field("region", FieldType::String);
        let config = TransactionalWriterConfig::new("test", DeliverySemantic::ExactlyOnce)
            .with_prefix("P")
            .with_partition_key("region", Some(rt));
        let mut w = TransactionalSinkWriter::open(
            store.clone(),
            Arc::new(JsonRowSerializer::default()),
            config,
            vec![],
            &SinkWriterContext::new("job", 0, 1),
        )
        .await
        .unwrap();
        w.write(row![1i64, "eu"]).await.unwrap();
        assert_eq!(store.records("P-0-1")[0].key.as_deref(), Some("eu"));
    }

    #[tokio::test]
    async fn test_close_aborts_empty_follow_up_transaction() {
        let store = Arc::new(MockTransactionStore::new());
        let mut w = open(&store, Some("P"), vec![]).await;
        w.write(row![1i64]).await.unwrap();
        w.prepare_commit(1).await.unwrap();
        w.snapshot_state(1).await.unwrap();
        w.close().await.unwrap();

        assert_eq!(store.status("P-0-1"), Some(TxnStatus::Open));
        assert_eq!(store.status("P-0-2"), Some(TxnStatus::Aborted));
        assert!(store.is_closed());
    }
}
