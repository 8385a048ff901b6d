//! Metrics support for the store and server

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics for dat-store
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "dat_store")]
pub struct Metrics {
    /// Rows committed with a new revision
    pub rows_written: Counter,
    /// Rows whose content was unchanged, no sequence consumed
    pub rows_unchanged: Counter,
    /// Rows reported as failed by a pipeline
    pub rows_failed: Counter,
    /// Grouped writes committed
    pub batches_committed: Counter,
    /// Batches that failed as a whole
    pub batches_failed: Counter,
    /// Columns appended to the column set
    pub columns_added: Counter,
    /// Sequence entries removed by compaction
    pub compaction_entries_removed: Counter,
    /// Change feed entries sent to subscribers
    pub feed_entries_sent: Counter,
    /// Change feed subscriptions opened
    pub feed_subscriptions: Counter,
    /// Change feed entries received while pulling from a remote
    pub pull_entries_received: Counter,
    /// Number of HTTP requests
    pub http_requests: Counter,
    /// Number of HTTP requests with a 2xx status code
    pub http_requests_success: Counter,
    /// Number of HTTP requests with a non-2xx status code
    pub http_requests_error: Counter,
    /// Total duration of all HTTP requests
    pub http_requests_duration_ms: Counter,
}
