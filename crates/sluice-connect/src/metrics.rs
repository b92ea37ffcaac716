//! Connector metrics
//!
//! Recorded through the `metrics` facade. Installing an exporter (Prometheus,
//! statsd, ...) is left to the host process; without one these calls are no-ops.

use std::time::Duration;

pub const ROWS_WRITTEN: &str = "sluice_sink_rows_written_total";
pub const BYTES_WRITTEN: &str = "sluice_sink_bytes_written_total";
pub const FLUSHES: &str = "sluice_sink_flushes_total";
pub const FLUSH_RETRIES: &str = "sluice_sink_flush_retries_total";
pub const FLUSH_FAILURES: &str = "sluice_sink_flush_failures_total";
pub const FLUSH_DURATION: &str = "sluice_sink_flush_duration_seconds";
pub const IDENTITY_CONFLICTS: &str = "sluice_sink_identity_conflicts_total";
pub const TRANSACTIONS_BEGUN: &str = "sluice_transactions_begun_total";
pub const TRANSACTIONS_ABORTED: &str = "sluice_transactions_aborted_total";
pub const COMMITS: &str = "sluice_commits_total";
pub const COMMIT_FAILURES: &str = "sluice_commit_failures_total";
pub const ROWS_READ: &str = "sluice_source_rows_read_total";
pub const SPLITS_ASSIGNED: &str = "sluice_source_splits_assigned_total";

pub fn record_flush(connector: &str, rows: usize, bytes: usize, elapsed: Duration) {
    ::metrics::counter!(FLUSHES, "connector" => connector.to_string()).increment(1);
    ::metrics::counter!(ROWS_WRITTEN, "connector" => connector.to_string()).increment(rows as u64);
    ::metrics::counter!(BYTES_WRITTEN, "connector" => connector.to_string())
        .increment(bytes as u64);
    ::metrics::histogram!(FLUSH_DURATION, "connector" => connector.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_retry(connector: &str, operation: &str) {
    ::metrics::counter!(
        FLUSH_RETRIES,
        "connector" => connector.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_flush_failure(connector: &str) {
    ::metrics::counter!(FLUSH_FAILURES, "connector" => connector.to_string()).increment(1);
}

pub fn record_conflict(connector: &str) {
    ::metrics::counter!(IDENTITY_CONFLICTS, "connector" => connector.to_string()).increment(1);
}

pub fn record_transaction_begun(connector: &str) {
    ::metrics::counter!(TRANSACTIONS_BEGUN, "connector" => connector.to_string()).increment(1);
}

pub fn record_transaction_aborted(connector: &str, count: usize) {
    ::metrics::counter!(TRANSACTIONS_ABORTED, "connector" => connector.to_string())
        .increment(count as u64);
}

pub fn record_commit(connector: &str, ok: bool) {
    let name = if ok { COMMITS } else { COMMIT_FAILURES };
    ::metrics::counter!(name, "connector" => connector.to_string()).increment(1);
}

pub fn record_rows_read(connector: &str, rows: usize) {
    ::metrics::counter!(ROWS_READ, "connector" => connector.to_string()).increment(rows as u64);
}

pub fn record_splits_assigned(connector: &str, count: usize) {
    ::metrics::counter!(SPLITS_ASSIGNED, "connector" => connector.to_string())
        .increment(count as u64);
}
