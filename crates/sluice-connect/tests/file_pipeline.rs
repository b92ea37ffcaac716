//! Datagen → file sink through the type-erased registry API, including a
//! crash between prepare and commit.

use bytes::Bytes;
use sluice_connect::connectors::create_default_registry;
use sluice_connect::registry::{AnyAggregatedCommitter, AnySink, AnySinkWriter, AnySource};
use sluice_connect::sink::SinkWriterContext;
use sluice_connect::source::{ReadStatus, ReaderId};
use sluice_connect::types::Row;
use sluice_connect::ReadonlyConfig;
use serde_json::json;
use std::path::Path;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn file_sink(dir: &Path) -> Box<dyn AnySink> {
    let config = ReadonlyConfig::from_json(json!({
        "path": dir.to_string_lossy(),
        "format": "csv",
    }))
    .unwrap();
    create_default_registry().sink("file", &config).unwrap()
}

async fn generate(rows_per_split: u64) -> Vec<Row> {
    let config = ReadonlyConfig::from_json(json!({
        "splits": 2,
        "rows_per_split": rows_per_split,
        "batch_size": 2,
    }))
    .unwrap();
    let source: Box<dyn AnySource> = create_default_registry().source("datagen", &config).unwrap();
    let mut enumerator = source.create_enumerator_raw(1, None).unwrap();
    let mut reader = source
        .create_reader_raw(ReaderId(0), CancellationToken::new())
        .await
        .unwrap();
    enumerator.register_reader_raw(ReaderId(0)).unwrap();
    for (_, splits) in enumerator.discover_and_assign_raw().await.unwrap() {
        reader.add_splits_raw(splits).unwrap();
    }
    assert!(enumerator.has_no_more_splits_raw(ReaderId(0)));
    reader.handle_no_more_splits_raw();

    let mut rows = Vec::new();
    while reader.poll_next_raw(&mut rows).await.unwrap() != ReadStatus::EndOfInput {}
    reader.close_raw().await.unwrap();
    rows
}

fn committed_lines(dir: &Path) -> Vec<String> {
    let mut lines = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_file() {
            let content = std::fs::read_to_string(&path).unwrap();
            lines.extend(content.lines().map(str::to_string));
        }
    }
    lines.sort();
    lines
}

async fn commit(committer: &dyn AnyAggregatedCommitter, infos: Vec<Bytes>) {
    let aggregated = committer.combine_raw(infos).unwrap();
    assert!(committer.commit_raw(vec![aggregated]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_generated_rows_committed_once() {
    let dir = TempDir::new().unwrap();
    let rows = generate(3).await;
    assert_eq!(rows.len(), 6);

    let sink = file_sink(dir.path());
    let committer = sink.create_committer_raw().unwrap().unwrap();
    let mut w0 = sink
        .create_writer_raw(SinkWriterContext::new("job", 0, 2), vec![])
        .await
        .unwrap();
    let mut w1 = sink
        .create_writer_raw(SinkWriterContext::new("job", 1, 2), vec![])
        .await
        .unwrap();
    for (i, row) in rows.into_iter().enumerate() {
        let writer = if i % 2 == 0 { &mut w0 } else { &mut w1 };
        writer.write_raw(row).await.unwrap();
    }

    let mut infos = Vec::new();
    for writer in [&mut w0, &mut w1] {
        infos.extend(writer.prepare_commit_raw(1).await.unwrap());
        writer.snapshot_state_raw(1).await.unwrap();
    }
    assert!(committed_lines(dir.path()).is_empty());

    commit(committer.as_ref(), infos).await;
    w0.notify_checkpoint_complete_raw(1).await.unwrap();
    w1.notify_checkpoint_complete_raw(1).await.unwrap();
    w0.close_raw().await.unwrap();
    w1.close_raw().await.unwrap();

    let lines = committed_lines(dir.path());
    assert_eq!(lines.len(), 6);
    assert!(lines.contains(&"0,0,datagen-0-0".to_string()));
    assert!(lines.contains(&"1,2,datagen-1-2".to_string()));
    assert!(!dir.path().join(".sluice_tmp/T_job_0_2").exists());
}

#[tokio::test]
async fn test_restart_between_snapshot_and_commit() {
    let dir = TempDir::new().unwrap();
    let sink = file_sink(dir.path());
    let committer = sink.create_committer_raw().unwrap().unwrap();

    let mut writer = sink
        .create_writer_raw(SinkWriterContext::new("job", 0, 1), vec![])
        .await
        .unwrap();
    for row in generate(1).await {
        writer.write_raw(row).await.unwrap();
    }
    let info = writer.prepare_commit_raw(1).await.unwrap().unwrap();
    let states = writer.snapshot_state_raw(1).await.unwrap();
    // rows after the snapshot are never checkpointed
    for row in generate(1).await {
        writer.write_raw(row).await.unwrap();
    }
    drop(writer);

    let mut restored = sink
        .create_writer_raw(SinkWriterContext::new("job", 0, 1), states)
        .await
        .unwrap();
    assert!(!dir.path().join(".sluice_tmp/T_job_0_2").exists());

    commit(committer.as_ref(), vec![info.clone()]).await;
    // a replay of the same commit is harmless
    commit(committer.as_ref(), vec![info]).await;
    assert_eq!(committed_lines(dir.path()).len(), 2);

    assert!(restored.prepare_commit_raw(2).await.unwrap().is_none());
    restored.close_raw().await.unwrap();
}

#[tokio::test]
async fn test_aborted_checkpoint_leaves_nothing() {
    let dir = TempDir::new().unwrap();
    let sink = file_sink(dir.path());
    let committer = sink.create_committer_raw().unwrap().unwrap();
    let mut writer = sink
        .create_writer_raw(SinkWriterContext::new("job", 0, 1), vec![])
        .await
        .unwrap();
    for row in generate(2).await {
        writer.write_raw(row).await.unwrap();
    }
    let info = writer.prepare_commit_raw(1).await.unwrap().unwrap();
    let aggregated = committer.combine_raw(vec![info]).unwrap();
    committer.abort_raw(vec![aggregated]).await.unwrap();
    writer.abort_prepare_raw().await.unwrap();
    writer.close_raw().await.unwrap();

    assert!(committed_lines(dir.path()).is_empty());
    assert!(!dir.path().join(".sluice_tmp/T_job_0_1").exists());
}
