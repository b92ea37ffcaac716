//! Buffered bulk-load writer
//!
//! For systems that ingest whole batches (stream load, bulk index APIs).
//! Rows are buffered until `max_rows` or `max_bytes` is reached, or until the
//! background interval fires, then loaded in one call under a batch label.
//!
//! The label stays the same across retries of a batch so the external system
//! can deduplicate a load whose response was lost. It is replaced only when
//! the system reports it as already taken.
//!
//! A single async mutex guards the buffer: the interval task and the
//! synchronous `write`/`flush`/`prepare_commit` calls never flush at the same
//! time. A failure in the interval task is stored and returned by the next
//! synchronous call.

use super::buffer::{Batch, BatchBuffer};
use super::writer::SinkWriter;
use crate::config::{BatchSettings, ReadonlyConfig, RetrySettings};
use crate::error::{ConnectorError, ConnectorResult};
use crate::format::RowSerializer;
use crate::metrics;
use crate::retry::{self, RetryDecision, RetryPolicy};
use crate::types::Row;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External system accepting labelled batches
#[async_trait]
pub trait BatchLoadClient: Send + Sync + 'static {
    /// Load `batch` under `label`.
    ///
    /// A label the system has already accepted must be reported as
    /// [`ConnectorError::IdentityConflict`].
    async fn load(&self, label: &str, batch: &Batch) -> ConnectorResult<()>;

    /// Release connections
    async fn close(&self) -> ConnectorResult<()>;
}

/// Settings of a [`BatchSinkWriter`]
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Connector name, used in logs and metrics
    pub name: String,
    pub batch: BatchSettings,
    pub retry: RetryPolicy,
    /// Batch labels are `<label_prefix>_<uuid>`
    pub label_prefix: String,
}

impl BatchWriterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch: BatchSettings::default(),
            retry: RetryPolicy::default(),
            label_prefix: "sluice".to_string(),
        }
    }

    /// Read batch, retry and `label_prefix` settings
    pub fn from_config(name: impl Into<String>, config: &ReadonlyConfig) -> ConnectorResult<Self> {
        Ok(Self {
            name: name.into(),
            batch: BatchSettings::from_config(config)?,
            retry: RetryPolicy::from_settings(&RetrySettings::from_config(config)?),
            label_prefix: config.get_or("label_prefix", "sluice".to_string())?,
        })
    }

    pub fn with_batch(mut self, batch: BatchSettings) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }
}

#[derive(Debug)]
struct BackgroundFailure {
    error: Option<ConnectorError>,
    message: String,
}

#[derive(Debug)]
struct FlushState {
    buffer: BatchBuffer,
    failure: Option<BackgroundFailure>,
    closed: bool,
}

impl FlushState {
    /// Surface a stored background failure. The first caller gets the
    /// original error, later callers a fatal error carrying its message.
    fn check_failure(&mut self) -> ConnectorResult<()> {
        match &mut self.failure {
            None => Ok(()),
            Some(failure) => Err(failure.error.take().unwrap_or_else(|| {
                ConnectorError::fatal(format!(
                    "writer failed in background flush: {}",
                    failure.message
                ))
            })),
        }
    }

    fn ensure_open(&self) -> ConnectorResult<()> {
        if self.closed {
            return Err(ConnectorError::state("sink writer is closed"));
        }
        Ok(())
    }
}

struct Inner<C> {
    state: Mutex<FlushState>,
    client: C,
    name: String,
    label_prefix: String,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<C: BatchLoadClient> Inner<C> {
    fn new_label(&self) -> String {
        format!("{}_{}", self.label_prefix, uuid::Uuid::new_v4())
    }

    async fn flush_locked(&self, state: &mut FlushState, reason: &'static str) -> ConnectorResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }

        let batch = state.buffer.snapshot();
        let started = Instant::now();
        let mut label = self.new_label();
        let mut attempts = self.policy.start(format!("{} flush", self.name));

        loop {
            match self.client.load(&label, &batch).await {
                Ok(()) => break,
                Err(e) => match attempts.on_failure(e) {
                    RetryDecision::Backoff(delay) => {
                        metrics::record_retry(&self.name, "flush");
                        retry::backoff(delay, &self.cancel).await?;
                    }
                    RetryDecision::RegenerateIdentity => {
                        metrics::record_conflict(&self.name);
                        let fresh = self.new_label();
                        warn!(
                            connector = %self.name,
                            old_label = %label,
                            new_label = %fresh,
                            "Batch label already in use, regenerating"
                        );
                        label = fresh;
                    }
                    RetryDecision::Fail(e) => {
                        metrics::record_flush_failure(&self.name);
                        error!(
                            connector = %self.name,
                            label = %label,
                            rows = batch.len(),
                            error = %e,
                            "Flush failed"
                        );
                        return Err(e);
                    }
                },
            }
        }

        state.buffer.clear();
        let elapsed = started.elapsed();
        metrics::record_flush(&self.name, batch.len(), batch.total_bytes, elapsed);
        debug!(
            connector = %self.name,
            label = %label,
            rows = batch.len(),
            bytes = batch.total_bytes,
            reason,
            elapsed_ms = elapsed.as_millis() as u64,
            "Flushed batch"
        );
        Ok(())
    }
}

/// At-least-once writer over a [`BatchLoadClient`]
pub struct BatchSinkWriter<C: BatchLoadClient> {
    inner: Arc<Inner<C>>,
    serializer: Arc<dyn RowSerializer>,
    timer: Option<JoinHandle<()>>,
    timer_stop: CancellationToken,
}

impl<C: BatchLoadClient> BatchSinkWriter<C> {
    /// Create the writer and, if `interval_ms > 0`, start the interval flush task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        client: C,
        serializer: Arc<dyn RowSerializer>,
        config: BatchWriterConfig,
        cancel: CancellationToken,
    ) -> Self {
        let interval = config.batch.interval();
        let inner = Arc::new(Inner {
            state: Mutex::new(FlushState {
                buffer: BatchBuffer::new(&config.batch),
                failure: None,
                closed: false,
            }),
            client,
            name: config.name,
            label_prefix: config.label_prefix,
            policy: config.retry,
            cancel: cancel.clone(),
        });
        let timer_stop = cancel.child_token();
        let timer = interval.map(|every| spawn_interval_flush(inner.clone(), every, timer_stop.clone()));

        Self {
            inner,
            serializer,
            timer,
            timer_stop,
        }
    }

    /// Flush buffered rows now
    pub async fn flush(&self) -> ConnectorResult<()> {
        let mut state = self.inner.state.lock().await;
        state.check_failure()?;
        state.ensure_open()?;
        self.inner.flush_locked(&mut state, "explicit").await
    }

    pub async fn buffered_rows(&self) -> usize {
        self.inner.state.lock().await.buffer.len()
    }

    pub fn client(&self) -> &C {
        &self.inner.client
    }

    async fn stop_timer(&mut self) {
        self.timer_stop.cancel();
        if let Some(handle) = self.timer.take() {
            if let Err(e) = handle.await {
                warn!(connector = %self.inner.name, error = %e, "Interval flush task ended abnormally");
            }
        }
    }
}

impl<C: BatchLoadClient> Drop for BatchSinkWriter<C> {
    fn drop(&mut self) {
        self.timer_stop.cancel();
    }
}

fn spawn_interval_flush<C: BatchLoadClient>(
    inner: Arc<Inner<C>>,
    every: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let mut state = inner.state.lock().await;
            if state.closed || state.failure.is_some() {
                continue;
            }
            if let Err(e) = inner.flush_locked(&mut state, "interval").await {
                error!(connector = %inner.name, error = %e, "Interval flush failed, failing writer on next call");
                state.failure = Some(BackgroundFailure {
                    message: e.to_string(),
                    error: Some(e),
                });
            }
        }
    })
}

#[async_trait]
impl<C: BatchLoadClient> SinkWriter for BatchSinkWriter<C> {
    type CommitInfo = ();
    type State = ();

    async fn write(&mut self, row: Row) -> ConnectorResult<()> {
        let bytes = self.serializer.serialize(&row)?;
        let mut state = self.inner.state.lock().await;
        state.check_failure()?;
        state.ensure_open()?;
        if state.buffer.push(bytes) {
            self.inner.flush_locked(&mut state, "threshold").await?;
        }
        Ok(())
    }

    async fn prepare_commit(&mut self, _checkpoint_id: u64) -> ConnectorResult<Option<()>> {
        self.flush().await?;
        Ok(None)
    }

    async fn snapshot_state(&mut self, _checkpoint_id: u64) -> ConnectorResult<Vec<()>> {
        let mut state = self.inner.state.lock().await;
        state.check_failure()?;
        Ok(Vec::new())
    }

    async fn abort_prepare(&mut self) -> ConnectorResult<()> {
        // loads are already visible; nothing staged to roll back
        Ok(())
    }

    async fn close(&mut self) -> ConnectorResult<()> {
        self.stop_timer().await;

        let flushed = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Ok(());
            }
            let result = match state.check_failure() {
                Ok(()) => self.inner.flush_locked(&mut state, "close").await,
                Err(e) => Err(e),
            };
            state.closed = true;
            result
        };

        if let Err(e) = self.inner.client.close().await {
            warn!(connector = %self.inner.name, error = %e, "Failed to close client");
        }
        if flushed.is_ok() {
            info!(connector = %self.inner.name, "Sink writer closed");
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::JsonRowSerializer;
    use crate::retry::Backoff;
    use crate::row;
    use crate::testing::{MockLoadClient, ScriptedFailure};

    fn config(max_rows: usize, interval_ms: u64) -> BatchWriterConfig {
        BatchWriterConfig::new("test")
            .with_batch(BatchSettings {
                max_rows,
                max_bytes: 1024 * 1024,
                interval_ms,
            })
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(3)
                    .with_backoff(Backoff::Fixed(Duration::from_millis(10))),
            )
    }

    fn writer(client: MockLoadClient, cfg: BatchWriterConfig) -> BatchSinkWriter<MockLoadClient> {
        BatchSinkWriter::new(
            client,
            Arc::new(JsonRowSerializer::default()),
            cfg,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_no_flush_below_threshold() {
        let client = MockLoadClient::new();
        let mut w = writer(client.clone(), config(10, 0));
        for i in 0..9i64 {
            w.write(row![i]).await.unwrap();
        }
        assert_eq!(client.load_calls(), 0);
        assert_eq!(w.buffered_rows().await, 9);
    }

    #[tokio::test]
    async fn test_threshold_flush_then_close_flushes_rest() {
        let client = MockLoadClient::new();
        let mut w = writer(client.clone(), config(3, 0));

        w.write(row![1i64]).await.unwrap();
        w.write(row![2i64]).await.unwrap();
        assert_eq!(client.load_calls(), 0);
        w.write(row![3i64]).await.unwrap();
        assert_eq!(client.load_calls(), 1);
        w.write(row![4i64]).await.unwrap();
        assert_eq!(client.load_calls(), 1);
        assert_eq!(w.buffered_rows().await, 1);

        w.close().await.unwrap();
        let loads = client.loaded_batches();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].len(), 3);
        assert_eq!(loads[1].len(), 1);
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_stable_across_retries() {
        let client = MockLoadClient::new()
            .fail_next(ScriptedFailure::Transient)
            .fail_next(ScriptedFailure::Transient);
        let mut w = writer(client.clone(), config(1, 0));
        w.write(row![1i64]).await.unwrap();

        let labels = client.attempted_labels();
        assert_eq!(labels.len(), 3);
        assert!(labels.iter().all(|l| l == &labels[0]));
        assert!(labels[0].starts_with("sluice_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_regenerated_on_conflict_only() {
        let client = MockLoadClient::new()
            .fail_next(ScriptedFailure::Transient)
            .fail_next(ScriptedFailure::LabelConflict)
            .fail_next(ScriptedFailure::Transient);
        let mut w = writer(client.clone(), config(1, 0));
        w.write(row![1i64]).await.unwrap();

        let labels = client.attempted_labels();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels[0], labels[1]);
        assert_ne!(labels[1], labels[2]);
        assert_eq!(labels[2], labels[3]);
        assert_eq!(client.loaded_batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fatal_once() {
        let client = MockLoadClient::new().always_fail(ScriptedFailure::Transient);
        let mut w = writer(client.clone(), config(1, 0));
        let err = w.write(row![1i64]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(client.load_calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let client = MockLoadClient::new().always_fail(ScriptedFailure::Auth);
        let mut w = writer(client.clone(), config(1, 0));
        let err = w.write(row![1i64]).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Auth(_)));
        assert_eq!(client.load_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush() {
        let client = MockLoadClient::new();
        let mut w = writer(client.clone(), config(100, 1000));
        w.write(row![1i64]).await.unwrap();
        assert_eq!(client.load_calls(), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(client.load_calls(), 1);
        assert_eq!(w.buffered_rows().await, 0);
        w.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_failure_surfaces_on_next_call() {
        let client = MockLoadClient::new().always_fail(ScriptedFailure::Auth);
        let mut w = writer(client.clone(), config(100, 1000));
        w.write(row![1i64]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(client.load_calls(), 1);

        let first = w.write(row![2i64]).await.unwrap_err();
        assert!(matches!(first, ConnectorError::Auth(_)));
        let second = w.prepare_commit(1).await.unwrap_err();
        assert!(matches!(second, ConnectorError::Fatal(_)));
        // the interval task stops trying once failed
        assert_eq!(client.load_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_mask_flush() {
        let client = MockLoadClient::new().fail_close();
        let mut w = writer(client.clone(), config(10, 0));
        w.write(row![1i64]).await.unwrap();
        w.close().await.unwrap();
        assert_eq!(client.loaded_batches().len(), 1);

        assert!(w.write(row![2i64]).await.is_err());
    }

    #[tokio::test]
    async fn test_prepare_commit_flushes_and_has_no_commit_info() {
        let client = MockLoadClient::new();
        let mut w = writer(client.clone(), config(10, 0));
        w.write(row![1i64]).await.unwrap();
        assert!(w.prepare_commit(1).await.unwrap().is_none());
        assert_eq!(client.load_calls(), 1);
        assert!(w.snapshot_state(1).await.unwrap().is_empty());
    }
}
