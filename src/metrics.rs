//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Replay run outcomes and durations
//! - Diff files and manifests consumed
//! - Applied, skipped, and absent operations
//! - Lock contention
//! - Checkpoint advancement
//! - Watermark lag
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed replay run with its outcome label
/// (`applied`, `up_to_date`, `disabled`, `lock_unavailable`, `failed`).
pub fn record_replay_run(outcome: &str) {
    counter!("replication_replay_runs_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record wall-clock duration of a replay run.
pub fn record_replay_duration(duration: Duration) {
    histogram!("replication_replay_duration_seconds").record(duration.as_secs_f64());
}

/// Record diff files consumed by a run.
pub fn record_files_consumed(count: usize) {
    counter!("replication_diff_files_consumed_total").increment(count as u64);
}

/// Record manifests applied by a run.
pub fn record_manifests_applied(count: usize) {
    counter!("replication_manifests_applied_total").increment(count as u64);
}

/// Record applied entity operations.
pub fn record_operations_applied(upserted: usize, deleted: usize, absent_deletes: usize) {
    counter!("replication_entity_upserts_total").increment(upserted as u64);
    counter!("replication_entity_deletes_total").increment(deleted as u64);
    counter!("replication_entity_deletes_absent_total").increment(absent_deletes as u64);
}

/// Record operations dropped because their kind is excluded.
pub fn record_operations_excluded(count: usize) {
    counter!("replication_operations_excluded_total").increment(count as u64);
}

/// Record a replay attempt that lost the replication lock race.
pub fn record_lock_contention() {
    counter!("replication_lock_contention_total").increment(1);
}

/// Record the watermark's lag behind the latest checkpoint.
pub fn record_watermark_lag(lag: Duration) {
    gauge!("replication_watermark_lag_seconds").set(lag.as_secs_f64());
}

/// Record a checkpoint coordinator tick
/// (`advanced` or `skipped`).
pub fn record_checkpoint_tick(outcome: &str) {
    counter!("replication_checkpoint_ticks_total", "outcome" => outcome.to_string()).increment(1);
}
