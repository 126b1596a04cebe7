use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::schema::SchemaBinding;

/// Per-scan state shared by the planner and every reader of the scan.
#[derive(Debug)]
pub struct QueryContext {
    pub query_id: Uuid,
    pub binding: Arc<SchemaBinding>,
    pub cancel: CancellationToken,
    pub metrics: Arc<ScanMetrics>,
}

impl QueryContext {
    pub fn new(binding: Arc<SchemaBinding>) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            binding,
            cancel: CancellationToken::new(),
            metrics: Arc::new(ScanMetrics::default()),
        }
    }

    /// Cancels every reader of this scan.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Counters updated concurrently by the readers of one scan.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    records_read: AtomicU64,
    rows_produced: AtomicU64,
    skipped_records: AtomicU64,
    retries: AtomicU64,
    splits_completed: AtomicU64,
    splits_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub records_read: u64,
    pub rows_produced: u64,
    pub skipped_records: u64,
    pub retries: u64,
    pub splits_completed: u64,
    pub splits_failed: u64,
}

impl ScanMetrics {
    pub(crate) fn record_read(&self) {
        self.records_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn row_produced(&self) {
        self.rows_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped_records.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn split_completed(&self) {
        self.splits_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn split_failed(&self) {
        self.splits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn skipped_records(&self) -> u64 {
        self.skipped_records.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            rows_produced: self.rows_produced.load(Ordering::Relaxed),
            skipped_records: self.skipped_records.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            splits_completed: self.splits_completed.load(Ordering::Relaxed),
            splits_failed: self.splits_failed.load(Ordering::Relaxed),
        }
    }
}
