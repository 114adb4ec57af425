//! Stream metrics with Prometheus text export.

use crate::error::ErrorKind;
use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for batch duration.
/// Converts to seconds: [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
const BATCH_DURATION_BUCKETS_MS: [u64; 9] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500];

const ERROR_KINDS: [ErrorKind; 6] = [
    ErrorKind::Config,
    ErrorKind::Connection,
    ErrorKind::Transform,
    ErrorKind::Publish,
    ErrorKind::Checkpoint,
    ErrorKind::Other,
];

fn kind_index(kind: ErrorKind) -> usize {
    match kind {
        ErrorKind::Config => 0,
        ErrorKind::Connection => 1,
        ErrorKind::Transform => 2,
        ErrorKind::Publish => 3,
        ErrorKind::Checkpoint => 4,
        ErrorKind::Other => 5,
    }
}

/// Snapshot of the batch duration histogram.
#[derive(Debug, Clone)]
pub struct BatchDurationHistogram {
    /// Sum of all observations in seconds
    pub sum_seconds: f64,
    /// Number of observations
    pub count: u64,
    /// Cumulative (upper bound in seconds, count) pairs
    pub buckets: Vec<(f64, u64)>,
    /// +Inf bucket count
    pub inf_bucket: u64,
}

/// Counters, gauges and histogram for the processing engine.
pub struct StreamMetrics {
    // === COUNTERS ===
    /// Records pulled from the source
    records_in_total: AtomicU64,
    /// Records acknowledged by the sink
    records_out_total: AtomicU64,
    /// Input records dropped by the transform error policy
    records_skipped_total: AtomicU64,
    /// Input records at or below the committed offset that were redelivered
    records_redelivered_total: AtomicU64,
    /// Transform errors, skipped or not
    transform_errors_total: AtomicU64,
    /// Pull attempts retried after a connection error
    pull_retries_total: AtomicU64,
    /// Publish attempts retried
    publish_retries_total: AtomicU64,
    /// Checkpoint commits written
    commits_total: AtomicU64,
    /// Non-empty batches fully processed
    batches_total: AtomicU64,
    /// Fatal partition failures
    partition_failures_total: AtomicU64,
    /// Errors by kind
    errors: [AtomicU64; 6],

    // === GAUGES ===
    /// Partition workers currently running
    active_partitions: AtomicI64,
    /// Pulled but uncommitted records per partition
    lag: DashMap<i32, AtomicI64>,

    // === HISTOGRAM: batch_duration_seconds ===
    batch_duration_sum_ms: AtomicU64,
    batch_duration_count: AtomicU64,
    /// Last slot is +Inf
    batch_duration_buckets: [AtomicU64; 10],
}

impl StreamMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            records_in_total: AtomicU64::new(0),
            records_out_total: AtomicU64::new(0),
            records_skipped_total: AtomicU64::new(0),
            records_redelivered_total: AtomicU64::new(0),
            transform_errors_total: AtomicU64::new(0),
            pull_retries_total: AtomicU64::new(0),
            publish_retries_total: AtomicU64::new(0),
            commits_total: AtomicU64::new(0),
            batches_total: AtomicU64::new(0),
            partition_failures_total: AtomicU64::new(0),
            errors: Default::default(),
            active_partitions: AtomicI64::new(0),
            lag: DashMap::new(),
            batch_duration_sum_ms: AtomicU64::new(0),
            batch_duration_count: AtomicU64::new(0),
            batch_duration_buckets: Default::default(),
        }
    }

    // === COUNTER RECORDING ===

    pub fn record_records_in(&self, count: u64) {
        self.records_in_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_records_out(&self, count: u64) {
        self.records_out_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_redelivered(&self, count: u64) {
        self.records_redelivered_total
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Record a transform error; `skipped` when the policy dropped the record.
    pub fn record_transform_error(&self, skipped: bool) {
        self.transform_errors_total.fetch_add(1, Ordering::Relaxed);
        if skipped {
            self.records_skipped_total.fetch_add(1, Ordering::Relaxed);
        }
        self.record_error(ErrorKind::Transform);
    }

    pub fn record_pull_retry(&self) {
        self.pull_retries_total.fetch_add(1, Ordering::Relaxed);
        self.record_error(ErrorKind::Connection);
    }

    pub fn record_publish_retry(&self) {
        self.publish_retries_total.fetch_add(1, Ordering::Relaxed);
        self.record_error(ErrorKind::Publish);
    }

    pub fn record_commit(&self) {
        self.commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partition_failure(&self, kind: ErrorKind) {
        self.partition_failures_total.fetch_add(1, Ordering::Relaxed);
        self.record_error(kind);
    }

    /// Record an error with a kind label.
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a processed batch with duration histogram.
    pub fn record_batch(&self, duration: Duration) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.batch_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.batch_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative (le = less than or equal)
        for (i, &bucket_ms) in BATCH_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.batch_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.batch_duration_buckets[BATCH_DURATION_BUCKETS_MS.len()]
            .fetch_add(1, Ordering::Relaxed);
    }

    // === GAUGE UPDATES ===

    pub fn partition_started(&self) {
        self.active_partitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn partition_stopped(&self, partition: i32) {
        self.active_partitions.fetch_sub(1, Ordering::Relaxed);
        self.lag.remove(&partition);
    }

    pub fn set_lag(&self, partition: i32, lag: i64) {
        self.lag
            .entry(partition)
            .and_modify(|v| v.store(lag, Ordering::Relaxed))
            .or_insert_with(|| AtomicI64::new(lag));
    }

    // === GETTERS ===

    pub fn records_in_total(&self) -> u64 {
        self.records_in_total.load(Ordering::Relaxed)
    }

    pub fn records_out_total(&self) -> u64 {
        self.records_out_total.load(Ordering::Relaxed)
    }

    pub fn records_skipped_total(&self) -> u64 {
        self.records_skipped_total.load(Ordering::Relaxed)
    }

    pub fn records_redelivered_total(&self) -> u64 {
        self.records_redelivered_total.load(Ordering::Relaxed)
    }

    pub fn transform_errors_total(&self) -> u64 {
        self.transform_errors_total.load(Ordering::Relaxed)
    }

    pub fn pull_retries_total(&self) -> u64 {
        self.pull_retries_total.load(Ordering::Relaxed)
    }

    pub fn publish_retries_total(&self) -> u64 {
        self.publish_retries_total.load(Ordering::Relaxed)
    }

    pub fn commits_total(&self) -> u64 {
        self.commits_total.load(Ordering::Relaxed)
    }

    pub fn batches_total(&self) -> u64 {
        self.batches_total.load(Ordering::Relaxed)
    }

    pub fn partition_failures_total(&self) -> u64 {
        self.partition_failures_total.load(Ordering::Relaxed)
    }

    pub fn errors_by_kind(&self, kind: ErrorKind) -> u64 {
        self.errors[kind_index(kind)].load(Ordering::Relaxed)
    }

    /// Sum of errors across kinds.
    pub fn errors_total(&self) -> u64 {
        self.errors.iter().map(|e| e.load(Ordering::Relaxed)).sum()
    }

    pub fn active_partitions(&self) -> i64 {
        self.active_partitions.load(Ordering::Relaxed)
    }

    pub fn lag(&self, partition: i32) -> Option<i64> {
        self.lag.get(&partition).map(|v| v.load(Ordering::Relaxed))
    }

    /// Get batch duration histogram data for Prometheus export.
    pub fn batch_duration_histogram(&self) -> BatchDurationHistogram {
        BatchDurationHistogram {
            sum_seconds: self.batch_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.batch_duration_count.load(Ordering::Relaxed),
            buckets: BATCH_DURATION_BUCKETS_MS
                .iter()
                .enumerate()
                .map(|(i, ms)| {
                    (
                        *ms as f64 / 1000.0,
                        self.batch_duration_buckets[i].load(Ordering::Relaxed),
                    )
                })
                .collect(),
            inf_bucket: self.batch_duration_buckets[BATCH_DURATION_BUCKETS_MS.len()]
                .load(Ordering::Relaxed),
        }
    }

    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use t2t_core::metrics::StreamMetrics;
    ///
    /// let metrics = StreamMetrics::new();
    /// metrics.record_records_in(3);
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("t2t_records_in_total 3"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix("t2t")
    }

    /// Export metrics in Prometheus text format with a custom name prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let mut out = String::with_capacity(4096);

        // === COUNTERS ===
        let counters: [(&str, &str, u64); 10] = [
            ("records_in_total", "Records pulled from the source", self.records_in_total()),
            ("records_out_total", "Records acknowledged by the sink", self.records_out_total()),
            ("records_skipped_total", "Records dropped by the transform error policy", self.records_skipped_total()),
            ("records_redelivered_total", "Already committed records received again", self.records_redelivered_total()),
            ("transform_errors_total", "Transform errors", self.transform_errors_total()),
            ("pull_retries_total", "Pulls retried after a connection error", self.pull_retries_total()),
            ("publish_retries_total", "Publishes retried", self.publish_retries_total()),
            ("commits_total", "Checkpoint commits written", self.commits_total()),
            ("batches_total", "Batches fully processed", self.batches_total()),
            ("partition_failures_total", "Partition workers stopped by a fatal error", self.partition_failures_total()),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {}_{} {}", prefix, name, help);
            let _ = writeln!(out, "# TYPE {}_{} counter", prefix, name);
            let _ = writeln!(out, "{}_{} {}\n", prefix, name, value);
        }

        let _ = writeln!(out, "# HELP {}_errors Errors by kind", prefix);
        let _ = writeln!(out, "# TYPE {}_errors counter", prefix);
        for kind in ERROR_KINDS {
            let _ = writeln!(
                out,
                "{}_errors{{kind=\"{}\"}} {}",
                prefix,
                kind.as_label(),
                self.errors_by_kind(kind)
            );
        }
        out.push('\n');

        // === GAUGES ===
        let _ = writeln!(out, "# HELP {}_active_partitions Partition workers running", prefix);
        let _ = writeln!(out, "# TYPE {}_active_partitions gauge", prefix);
        let _ = writeln!(out, "{}_active_partitions {}\n", prefix, self.active_partitions());

        let _ = writeln!(out, "# HELP {}_partition_lag Pulled but uncommitted records", prefix);
        let _ = writeln!(out, "# TYPE {}_partition_lag gauge", prefix);
        let mut lags: Vec<(i32, i64)> = self
            .lag
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        lags.sort_unstable();
        for (partition, lag) in lags {
            let _ = writeln!(
                out,
                "{}_partition_lag{{partition=\"{}\"}} {}",
                prefix, partition, lag
            );
        }
        out.push('\n');

        // === HISTOGRAM: batch_duration_seconds ===
        let hist = self.batch_duration_histogram();
        let _ = writeln!(
            out,
            "# HELP {}_batch_duration_seconds Time from pull to commit per batch",
            prefix
        );
        let _ = writeln!(out, "# TYPE {}_batch_duration_seconds histogram", prefix);
        for (le, count) in &hist.buckets {
            let _ = writeln!(
                out,
                "{}_batch_duration_seconds_bucket{{le=\"{}\"}} {}",
                prefix, le, count
            );
        }
        let _ = writeln!(
            out,
            "{}_batch_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            prefix, hist.inf_bucket
        );
        let _ = writeln!(out, "{}_batch_duration_seconds_sum {}", prefix, hist.sum_seconds);
        let _ = writeln!(out, "{}_batch_duration_seconds_count {}", prefix, hist.count);

        out
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = StreamMetrics::new();
        metrics.record_records_in(10);
        metrics.record_records_out(8);
        metrics.record_transform_error(true);
        metrics.record_transform_error(false);
        metrics.record_publish_retry();
        metrics.record_commit();

        assert_eq!(metrics.records_in_total(), 10);
        assert_eq!(metrics.records_out_total(), 8);
        assert_eq!(metrics.transform_errors_total(), 2);
        assert_eq!(metrics.records_skipped_total(), 1);
        assert_eq!(metrics.publish_retries_total(), 1);
        assert_eq!(metrics.commits_total(), 1);
        assert_eq!(metrics.errors_by_kind(ErrorKind::Transform), 2);
        assert_eq!(metrics.errors_by_kind(ErrorKind::Publish), 1);
        assert_eq!(metrics.errors_total(), 3);
    }

    #[test]
    fn test_batch_histogram_buckets() {
        let metrics = StreamMetrics::new();
        metrics.record_batch(Duration::from_millis(3));
        metrics.record_batch(Duration::from_millis(40));
        metrics.record_batch(Duration::from_secs(10));

        let hist = metrics.batch_duration_histogram();
        assert_eq!(hist.count, 3);
        assert_eq!(hist.buckets[0], (0.005, 1));
        assert_eq!(hist.buckets[3], (0.05, 2));
        assert_eq!(hist.buckets[8], (2.5, 2));
        assert_eq!(hist.inf_bucket, 3);
        assert_eq!(metrics.batches_total(), 3);
    }

    #[test]
    fn test_partition_gauges() {
        let metrics = StreamMetrics::new();
        metrics.partition_started();
        metrics.partition_started();
        metrics.set_lag(0, 12);
        metrics.set_lag(1, 0);
        assert_eq!(metrics.active_partitions(), 2);
        assert_eq!(metrics.lag(0), Some(12));

        metrics.partition_stopped(0);
        assert_eq!(metrics.active_partitions(), 1);
        assert_eq!(metrics.lag(0), None);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = StreamMetrics::new();
        metrics.record_records_in(5);
        metrics.record_partition_failure(ErrorKind::Checkpoint);
        metrics.set_lag(2, 7);

        let text = metrics.export_prometheus_text();
        assert!(text.contains("# TYPE t2t_records_in_total counter"));
        assert!(text.contains("t2t_records_in_total 5"));
        assert!(text.contains("t2t_errors{kind=\"checkpoint\"} 1"));
        assert!(text.contains("t2t_partition_lag{partition=\"2\"} 7"));
        assert!(text.contains("t2t_batch_duration_seconds_bucket{le=\"+Inf\"} 0"));

        let custom = metrics.export_prometheus_text_with_prefix("app");
        assert!(custom.contains("app_partition_failures_total 1"));
    }
}
