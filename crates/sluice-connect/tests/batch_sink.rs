//! At-least-once batch loading against a label-deduplicating store.

use sluice_connect::config::{BatchSettings, ReadonlyConfig};
use sluice_connect::format::DelimitedRowSerializer;
use sluice_connect::row;
use sluice_connect::sink::{BatchSinkWriter, BatchWriterConfig, SinkWriter};
use sluice_connect::testing::{MockLoadClient, ScriptedFailure};
use sluice_connect::{ConnectorError, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn writer(client: MockLoadClient, max_rows: usize) -> BatchSinkWriter<MockLoadClient> {
    let config = BatchWriterConfig::new("store")
        .with_batch(BatchSettings {
            max_rows,
            interval_ms: 0,
            ..Default::default()
        })
        .with_retry(RetryPolicy::exponential(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
        ))
        .with_label_prefix("job");
    BatchSinkWriter::new(
        client,
        Arc::new(DelimitedRowSerializer::csv()),
        config,
        CancellationToken::new(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_loads_every_row_once() {
    let client = MockLoadClient::new()
        .fail_next(ScriptedFailure::Transient)
        .fail_next(ScriptedFailure::LabelConflict);
    let mut w = writer(client.clone(), 3);

    for i in 0..7i64 {
        w.write(row![i, "x"]).await.unwrap();
    }
    assert!(w.prepare_commit(1).await.unwrap().is_none());
    assert!(w.snapshot_state(1).await.unwrap().is_empty());
    w.close().await.unwrap();

    let rows: Vec<String> = client
        .loaded_rows()
        .iter()
        .map(|b| String::from_utf8(b.to_vec()).unwrap())
        .collect();
    assert_eq!(rows.len(), 7);
    assert_eq!(rows[0], "0,x");
    assert_eq!(client.loaded_batches().len(), 3);

    let labels = client.loaded_labels();
    assert!(labels.iter().all(|l| l.starts_with("job_")));
    let attempted = client.attempted_labels();
    // retry after a transient error reuses the label, a conflict replaces it
    assert_eq!(attempted[0], attempted[1]);
    assert_ne!(attempted[1], attempted[2]);
    assert!(client.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_checkpoint() {
    let client = MockLoadClient::new().always_fail(ScriptedFailure::Transient);
    let mut w = writer(client.clone(), 100);
    w.write(row![1i64, "x"]).await.unwrap();

    let err = w.prepare_commit(1).await.unwrap_err();
    assert!(matches!(err, ConnectorError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(client.load_calls(), 3);
    assert!(client.loaded_rows().is_empty());
}

#[tokio::test]
async fn test_settings_from_yaml() {
    let config = ReadonlyConfig::from_yaml("max_rows: 2\ninterval_ms: 0\nlabel_prefix: nightly\n")
        .unwrap();
    let settings = BatchWriterConfig::from_config("store", &config).unwrap();
    assert_eq!(settings.batch.max_rows, 2);
    assert_eq!(settings.label_prefix, "nightly");

    let client = MockLoadClient::new();
    let mut w = BatchSinkWriter::new(
        client.clone(),
        Arc::new(DelimitedRowSerializer::csv()),
        settings,
        CancellationToken::new(),
    );
    w.write(row![1i64]).await.unwrap();
    w.write(row![2i64]).await.unwrap();
    assert_eq!(client.loaded_labels().len(), 1);
    assert!(client.loaded_labels()[0].starts_with("nightly_"));
    w.close().await.unwrap();
}
