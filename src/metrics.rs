//! Metrics instrumentation for the history engine.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `history_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: fast, archive, engine, proxy
//! - `operation`: read, write, delete, query, call
//! - `status`: success, error, hit, miss

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::record::RecordKind;

/// Record a storage or engine operation outcome.
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "history_engine_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency.
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "history_engine_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record one processed migration batch.
pub fn record_migration_batch(kind: RecordKind, count: usize) {
    counter!(
        "history_engine_migration_batches_total",
        "kind" => kind.to_string()
    )
    .increment(1);
    histogram!(
        "history_engine_migration_batch_size",
        "kind" => kind.to_string()
    )
    .record(count as f64);
}

/// Record aggregated watch seconds.
pub fn record_watch_seconds(seconds: u64) {
    counter!("history_engine_watch_seconds_total").increment(seconds);
}

/// Record tombstones purged by a cleanup pass.
pub fn record_tombstones_purged(count: u64) {
    counter!("history_engine_tombstones_purged_total").increment(count);
}

/// Set the current FastStore key count.
pub fn set_fast_store_keys(count: usize) {
    gauge!("history_engine_fast_store_keys").set(count as f64);
}

/// A timing guard that records latency on drop.
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
