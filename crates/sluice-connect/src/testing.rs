//! In-memory doubles of external systems
//!
//! Used by the unit and integration tests, and handy for exercising a
//! pipeline without a real database or broker.

use crate::error::{ConnectorError, ConnectorResult};
use crate::sink::batch::BatchLoadClient;
use crate::sink::buffer::Batch;
use crate::sink::transactional::{
    AbortOutcome, OutgoingRecord, TransactionId, TransactionalSender,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

/// Failure a mock returns instead of succeeding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Retryable, e.g. a dropped connection
    Transient,
    /// The label was already used
    LabelConflict,
    /// Not retryable
    Auth,
}

impl ScriptedFailure {
    fn to_error(self, label: &str) -> ConnectorError {
        match self {
            ScriptedFailure::Transient => ConnectorError::transient("connection reset"),
            ScriptedFailure::LabelConflict => {
                ConnectorError::conflict(label, "label already exists")
            }
            ScriptedFailure::Auth => ConnectorError::Auth("access denied".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct LoadState {
    scripted: VecDeque<ScriptedFailure>,
    always: Option<ScriptedFailure>,
    fail_close: bool,
    attempted: Vec<String>,
    loaded: Vec<(String, Batch)>,
    used_labels: HashSet<String>,
    closed: bool,
}

/// [`BatchLoadClient`] that records every load.
///
/// Rejects a label it has already accepted, like a stream-load endpoint.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockLoadClient {
    state: Arc<Mutex<LoadState>>,
}

impl MockLoadClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next unscripted load (builder pattern)
    pub fn fail_next(self, failure: ScriptedFailure) -> Self {
        self.state.lock().scripted.push_back(failure);
        self
    }

    /// Fail every load
    pub fn always_fail(self, failure: ScriptedFailure) -> Self {
        self.state.lock().always = Some(failure);
        self
    }

    pub fn fail_close(self) -> Self {
        self.state.lock().fail_close = true;
        self
    }

    /// Number of load calls, successful or not
    pub fn load_calls(&self) -> usize {
        self.state.lock().attempted.len()
    }

    pub fn attempted_labels(&self) -> Vec<String> {
        self.state.lock().attempted.clone()
    }

    pub fn loaded_batches(&self) -> Vec<Batch> {
        self.state.lock().loaded.iter().map(|(_, b)| b.clone()).collect()
    }

    pub fn loaded_labels(&self) -> Vec<String> {
        self.state.lock().loaded.iter().map(|(l, _)| l.clone()).collect()
    }

    /// Every loaded row, in load order
    pub fn loaded_rows(&self) -> Vec<bytes::Bytes> {
        self.state
            .lock()
            .loaded
            .iter()
            .flat_map(|(_, b)| b.rows.iter().cloned())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl BatchLoadClient for MockLoadClient {
    async fn load(&self, label: &str, batch: &Batch) -> ConnectorResult<()> {
        let mut state = self.state.lock();
        state.attempted.push(label.to_string());
        if let Some(failure) = state.always {
            return Err(failure.to_error(label));
        }
        if let Some(failure) = state.scripted.pop_front() {
            return Err(failure.to_error(label));
        }
        if !state.used_labels.insert(label.to_string()) {
            return Err(ScriptedFailure::LabelConflict.to_error(label));
        }
        state.loaded.push((label.to_string(), batch.clone()));
        Ok(())
    }

    async fn close(&self) -> ConnectorResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        if state.fail_close {
            return Err(ConnectorError::connection("close failed"));
        }
        Ok(())
    }
}

/// Lifecycle of a transaction in [`MockTransactionStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Open,
    Committed,
    Aborted,
}

#[derive(Debug, Default)]
struct TxnState {
    status: BTreeMap<String, TxnStatus>,
    records: BTreeMap<String, Vec<OutgoingRecord>>,
    committed: Vec<OutgoingRecord>,
    untransacted: Vec<OutgoingRecord>,
    begun: Vec<String>,
    aborted: Vec<String>,
    commit_failures: VecDeque<ScriptedFailure>,
    closed: bool,
}

/// Transactional store keyed by transaction id.
///
/// Commit by id is idempotent. Aborting an id that was never opened reports
/// [`AbortOutcome::Unknown`]. Reopening an aborted id starts it empty.
#[derive(Debug, Default)]
pub struct MockTransactionStore {
    state: Mutex<TxnState>,
}

impl MockTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a transaction left open by a previous process
    pub fn open_externally(&self, txn: &str) {
        let mut state = self.state.lock();
        state.status.insert(txn.to_string(), TxnStatus::Open);
        state.records.entry(txn.to_string()).or_default();
    }

    /// Fail the next commit call
    pub fn fail_next_commit(&self, failure: ScriptedFailure) {
        self.state.lock().commit_failures.push_back(failure);
    }

    pub fn status(&self, txn: &str) -> Option<TxnStatus> {
        self.state.lock().status.get(txn).copied()
    }

    /// Records sent in `txn` that are not yet committed or aborted
    pub fn records(&self, txn: &str) -> Vec<OutgoingRecord> {
        self.state.lock().records.get(txn).cloned().unwrap_or_default()
    }

    /// Records visible to readers
    pub fn committed_records(&self) -> Vec<OutgoingRecord> {
        self.state.lock().committed.clone()
    }

    pub fn untransacted_records(&self) -> Vec<OutgoingRecord> {
        self.state.lock().untransacted.clone()
    }

    /// Ids begun by writers, in order
    pub fn begun(&self) -> Vec<String> {
        self.state.lock().begun.clone()
    }

    /// Ids that were open when aborted, in order
    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().aborted.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl TransactionalSender for MockTransactionStore {
    async fn begin(&self, txn: &TransactionId) -> ConnectorResult<()> {
        let key = txn.to_string();
        let mut state = self.state.lock();
        if state.status.get(&key) == Some(&TxnStatus::Committed) {
            return Err(ConnectorError::conflict(key, "transaction already committed"));
        }
        state.status.insert(key.clone(), TxnStatus::Open);
        state.records.insert(key.clone(), Vec::new());
        state.begun.push(key);
        Ok(())
    }

    async fn send(
        &self,
        txn: Option<&TransactionId>,
        record: OutgoingRecord,
    ) -> ConnectorResult<()> {
        let mut state = self.state.lock();
        match txn {
            None => {
                state.untransacted.push(record);
                Ok(())
            }
            Some(txn) => {
                let key = txn.to_string();
                if state.status.get(&key) != Some(&TxnStatus::Open) {
                    return Err(ConnectorError::state(format!(
                        "transaction {} is not open",
                        key
                    )));
                }
                state.records.entry(key).or_default().push(record);
                Ok(())
            }
        }
    }

    async fn flush(&self, _txn: Option<&TransactionId>) -> ConnectorResult<()> {
        Ok(())
    }

    async fn commit(&self, txn: &TransactionId) -> ConnectorResult<()> {
        let key = txn.to_string();
        let mut state = self.state.lock();
        if let Some(failure) = state.commit_failures.pop_front() {
            return Err(failure.to_error(&key));
        }
        match state.status.get(&key).copied() {
            Some(TxnStatus::Committed) => Ok(()),
            Some(TxnStatus::Open) => {
                let records = state.records.remove(&key).unwrap_or_default();
                state.committed.extend(records);
                state.status.insert(key, TxnStatus::Committed);
                Ok(())
            }
            Some(TxnStatus::Aborted) => Err(ConnectorError::state(format!(
                "transaction {} was aborted",
                key
            ))),
            None => Err(ConnectorError::state(format!(
                "unknown transaction {}",
                key
            ))),
        }
    }

    async fn abort(&self, txn: &TransactionId) -> ConnectorResult<AbortOutcome> {
        let key = txn.to_string();
        let mut state = self.state.lock();
        match state.status.get(&key).copied() {
            None => Ok(AbortOutcome::Unknown),
            Some(TxnStatus::Committed) => Ok(AbortOutcome::AlreadyCommitted),
            Some(TxnStatus::Aborted) => Ok(AbortOutcome::Aborted),
            Some(TxnStatus::Open) => {
                state.records.remove(&key);
                state.status.insert(key.clone(), TxnStatus::Aborted);
                state.aborted.push(key);
                Ok(AbortOutcome::Aborted)
            }
        }
    }

    async fn close(&self) -> ConnectorResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
