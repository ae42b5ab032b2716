//! Status and statistics types reported by the daemon.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{BatchId, BatchStatus, ItemKey, ItemStatus, SourceId};

/// Point-in-time view of the scheduler, derived from live state.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub taken_at: DateTime<Utc>,
    pub active_batches: usize,
    pub max_concurrent_batches: usize,
    pub queued_units: usize,
    /// Items claimed by a queued unit or an outstanding batch.
    pub claimed_items: usize,
    pub blocked_sources: Vec<BlockedSource>,
    pub batches: Vec<BatchSummary>,
    pub stats: DaemonStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedSource {
    pub source_id: SourceId,
    pub blocked_until: DateTime<Utc>,
    pub remaining_secs: i64,
}

/// One outstanding batch, as shown in the status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub source_id: SourceId,
    pub items: usize,
    pub submitted_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub polls: u32,
}

/// What happened to a batch once it reached a terminal state.
///
/// Passed to the completion hook.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    pub source_id: SourceId,
    pub status: BatchStatus,
    /// Final status of every member item.
    pub items: Vec<(ItemKey, ItemStatus)>,
    /// Reason for a batch-level failure or expiry.
    pub reason: Option<String>,
}

impl BatchOutcome {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|(_, s)| *s == status).count()
    }
}

/// What one scheduling tick did.
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    pub units_queued: usize,
    pub batches_admitted: usize,
    /// Batches that reached a terminal state during the tick.
    pub outcomes: Vec<BatchOutcome>,
}

/// Cumulative counters since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub batches_submitted: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub batches_expired: u64,
    pub submission_failures: u64,
    pub items_completed: u64,
    pub items_failed_permanent: u64,
    pub items_failed_retryable: u64,
}

/// Lock-free counters behind [`DaemonStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    batches_submitted: AtomicU64,
    batches_completed: AtomicU64,
    batches_failed: AtomicU64,
    batches_expired: AtomicU64,
    submission_failures: AtomicU64,
    items_completed: AtomicU64,
    items_failed_permanent: AtomicU64,
    items_failed_retryable: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn batch_submitted(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn submission_failed(&self) {
        self.submission_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: &BatchOutcome) {
        let counter = match outcome.status {
            BatchStatus::Completed => &self.batches_completed,
            BatchStatus::Failed => &self.batches_failed,
            BatchStatus::Expired => &self.batches_expired,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        for (_, status) in &outcome.items {
            let counter = match status {
                ItemStatus::Completed => &self.items_completed,
                ItemStatus::FailedPermanent => &self.items_failed_permanent,
                ItemStatus::FailedRetryable => &self.items_failed_retryable,
                _ => continue,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> DaemonStats {
        DaemonStats {
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            batches_expired: self.batches_expired.load(Ordering::Relaxed),
            submission_failures: self.submission_failures.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            items_failed_permanent: self.items_failed_permanent.load(Ordering::Relaxed),
            items_failed_retryable: self.items_failed_retryable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcome_counts_items_by_status() {
        let counters = StatsCounters::default();
        let outcome = BatchOutcome {
            batch_id: BatchId::from("batch_1"),
            source_id: SourceId::from("sheet-a"),
            status: BatchStatus::Completed,
            items: vec![
                (ItemKey::new("sheet-a", "2"), ItemStatus::Completed),
                (ItemKey::new("sheet-a", "3"), ItemStatus::FailedPermanent),
            ],
            reason: None,
        };
        counters.record_outcome(&outcome);
        counters.batch_submitted();

        let stats = counters.snapshot();
        assert_eq!(stats.batches_completed, 1);
        assert_eq!(stats.batches_submitted, 1);
        assert_eq!(stats.items_completed, 1);
        assert_eq!(stats.items_failed_permanent, 1);
        assert_eq!(outcome.count(ItemStatus::Completed), 1);
    }
}
