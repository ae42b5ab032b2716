//! Batch lifecycle manager: owns the active batch set and drives every batch from
//! submission to a terminal state.
//!
//! The active set is bounded by a semaphore. A slot is reserved before a unit is submitted
//! and travels with the batch while it is active; removing the batch from the set frees the
//! slot. Terminal batches are removed from the set synchronously, before any result handling
//! awaits, so two ticks can never both process the same batch.
//!
//! A batch owns the claims on its items from the moment it is tracked. They move with it
//! out of the active set and are released when its outcome is handled, or when it is
//! dropped unhandled because result processing panicked or the tick was cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::types::{BatchOutcome, BatchSummary, StatsCounters};
use super::{DaemonConfig, SchedulerContext};
use crate::domain::{
    Batch, BatchData, BatchId, BatchStatus, Completed, ItemStatus, PollOutcome, Polling,
    Submitted,
};
use crate::error::{Result, VolleyError};
use crate::inference::{BatchPoll, InferenceClient, ItemOutcome};
use crate::source::TabularSource;
use crate::tracker::ClaimSet;

/// A reserved slot in the active set.
#[derive(Debug)]
pub struct SlotPermit(OwnedSemaphorePermit);

struct ActiveBatch {
    batch: Batch<Polling>,
    claims: ClaimSet,
    _slot: SlotPermit,
}

/// A batch that left the active set, still holding its claims.
struct Resolved {
    outcome: PollOutcome,
    claims: ClaimSet,
}

/// The set of outstanding batches, bounded by `max_concurrent_batches`.
pub struct ActiveBatches {
    batches: Mutex<HashMap<BatchId, ActiveBatch>>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl ActiveBatches {
    pub fn new(capacity: usize) -> Self {
        Self {
            batches: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Reserve a slot without waiting. `None` when the set is full.
    pub fn try_reserve(&self) -> Option<SlotPermit> {
        self.slots.clone().try_acquire_owned().ok().map(SlotPermit)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }

    pub fn contains(&self, batch_id: &BatchId) -> bool {
        self.batches.lock().contains_key(batch_id)
    }

    fn insert(&self, batch: Batch<Polling>, claims: ClaimSet, slot: SlotPermit) {
        self.batches.lock().insert(
            batch.data.batch_id.clone(),
            ActiveBatch {
                batch,
                claims,
                _slot: slot,
            },
        );
    }

    fn due(&self, now: DateTime<Utc>, poll_interval: Duration) -> Vec<BatchId> {
        let mut due: Vec<(DateTime<Utc>, BatchId)> = self
            .batches
            .lock()
            .values()
            .filter(|active| active.batch.is_due(now, poll_interval))
            .map(|active| (active.batch.data.submitted_at, active.batch.data.batch_id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Apply poll responses in one critical section. Batches that stay in progress remain in
    /// the set; terminal ones are removed (freeing their slot) and returned.
    fn resolve(
        &self,
        polls: Vec<(BatchId, Result<BatchPoll>)>,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Vec<Resolved> {
        let mut batches = self.batches.lock();
        let mut terminal = Vec::new();
        for (batch_id, poll) in polls {
            // Already resolved elsewhere (e.g. abandoned during teardown).
            let Some(ActiveBatch {
                batch,
                claims,
                _slot,
            }) = batches.remove(&batch_id)
            else {
                continue;
            };
            let outcome = match poll {
                Ok(poll) => batch.observe(poll, now, max_age),
                Err(VolleyError::BatchNotFound(_)) => {
                    batch.observe(BatchPoll::failed("batch not found by backend"), now, max_age)
                }
                Err(_) => batch.poll_errored(now, max_age),
            };
            match outcome {
                PollOutcome::InProgress(batch) => {
                    batches.insert(
                        batch_id,
                        ActiveBatch {
                            batch,
                            claims,
                            _slot,
                        },
                    );
                }
                outcome => terminal.push(Resolved { outcome, claims }),
            }
        }
        terminal
    }

    fn summaries(&self) -> Vec<BatchSummary> {
        let mut summaries: Vec<BatchSummary> = self
            .batches
            .lock()
            .values()
            .map(|active| summarize(&active.batch))
            .collect();
        summaries.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.batch_id.cmp(&b.batch_id))
        });
        summaries
    }

    fn drain(&self) -> Vec<ActiveBatch> {
        self.batches
            .lock()
            .drain()
            .map(|(_, active)| active)
            .collect()
    }
}

fn summarize(batch: &Batch<Polling>) -> BatchSummary {
    BatchSummary {
        batch_id: batch.data.batch_id.clone(),
        source_id: batch.data.source_id().clone(),
        items: batch.data.unit.len(),
        submitted_at: batch.data.submitted_at,
        last_polled_at: batch.state.last_polled_at,
        polls: batch.state.polls,
    }
}

/// Drives batches through `submitted -> polling -> {completed | failed | expired}` and routes
/// completed results back to their source.
pub struct LifecycleManager<S: TabularSource, C: InferenceClient> {
    source: Arc<S>,
    client: Arc<C>,
    ctx: SchedulerContext,
    config: DaemonConfig,
    active: ActiveBatches,
    stats: Arc<StatsCounters>,
}

impl<S: TabularSource, C: InferenceClient> LifecycleManager<S, C> {
    pub(crate) fn new(
        source: Arc<S>,
        client: Arc<C>,
        ctx: SchedulerContext,
        config: DaemonConfig,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            active: ActiveBatches::new(config.max_concurrent_batches),
            source,
            client,
            ctx,
            config,
            stats,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn capacity(&self) -> usize {
        self.active.capacity()
    }

    pub fn is_active(&self, batch_id: &BatchId) -> bool {
        self.active.contains(batch_id)
    }

    pub fn try_reserve_slot(&self) -> Option<SlotPermit> {
        self.active.try_reserve()
    }

    pub fn summaries(&self) -> Vec<BatchSummary> {
        self.active.summaries()
    }

    /// Add an accepted batch to the active set; it starts polling immediately.
    ///
    /// `claims` must cover the batch's items; the batch releases them when it resolves.
    pub fn track(&self, batch: Batch<Submitted>, slot: SlotPermit, claims: ClaimSet) {
        let batch = batch.start_polling();
        tracing::info!(
            batch_id = %batch.data.batch_id,
            source_id = %batch.data.source_id(),
            items = batch.data.unit.len(),
            "Batch is now polling"
        );
        self.active.insert(batch, claims, slot);
    }

    /// Poll every due batch concurrently and finish the ones that reached a terminal state.
    #[tracing::instrument(skip(self), fields(active = self.active.len()))]
    pub async fn poll_due(&self) -> Vec<BatchOutcome> {
        let due = self
            .active
            .due(self.ctx.clock.now(), self.config.poll_interval());
        if due.is_empty() {
            return Vec::new();
        }
        tracing::debug!(due = due.len(), "Polling batches");

        let polls = join_all(due.into_iter().map(|batch_id| async move {
            let poll = self.client.poll(&batch_id).await;
            if let Err(e) = &poll {
                tracing::warn!(batch_id = %batch_id, error = %e, "Failed to poll batch");
            }
            (batch_id, poll)
        }))
        .await;

        let terminal = self.active.resolve(
            polls,
            self.ctx.clock.now(),
            self.config.max_batch_age(),
        );

        let mut outcomes = Vec::with_capacity(terminal.len());
        for resolved in terminal {
            if let Some(outcome) = self.finish(resolved).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    async fn finish(&self, resolved: Resolved) -> Option<BatchOutcome> {
        let Resolved { outcome, claims } = resolved;
        let outcome = match outcome {
            PollOutcome::InProgress(_) => return None,
            PollOutcome::Completed(batch) => self.write_results(batch, claims).await,
            PollOutcome::Failed(batch) => {
                tracing::error!(
                    batch_id = %batch.data.batch_id,
                    source_id = %batch.data.source_id(),
                    reason = %batch.state.reason,
                    "Batch failed, items returned for retry"
                );
                let reason = batch.state.reason;
                self.release_for_retry(batch.data, claims, BatchStatus::Failed, reason)
            }
            PollOutcome::Expired(batch) => {
                tracing::error!(
                    alert = true,
                    batch_id = %batch.data.batch_id,
                    source_id = %batch.data.source_id(),
                    age_secs = batch.state.age_secs,
                    "Batch expired without resolving, items returned for retry"
                );
                let reason = format!("expired after {}s", batch.state.age_secs);
                self.release_for_retry(batch.data, claims, BatchStatus::Expired, reason)
            }
        };

        self.stats.record_outcome(&outcome);
        if let Some(hook) = &self.config.completion_hook {
            hook(&outcome);
        }
        Some(outcome)
    }

    fn release_for_retry(
        &self,
        data: BatchData,
        claims: ClaimSet,
        status: BatchStatus,
        reason: String,
    ) -> BatchOutcome {
        let items = claims
            .keys()
            .iter()
            .map(|key| (key.clone(), ItemStatus::FailedRetryable))
            .collect();
        drop(claims);
        BatchOutcome {
            batch_id: data.batch_id,
            source_id: data.unit.source_id().clone(),
            status,
            items,
            reason: Some(reason),
        }
    }

    /// Pair results with items by correlation key and write them back to the source.
    ///
    /// Claims are released when this returns, or if it unwinds.
    #[tracing::instrument(skip_all, fields(batch_id = %batch.data.batch_id, source_id = %batch.data.source_id()))]
    async fn write_results(&self, batch: Batch<Completed>, claims: ClaimSet) -> BatchOutcome {
        let Batch { data, state } = batch;
        let _claims = claims;
        let source_id = data.unit.source_id().clone();

        let results: HashMap<&str, &ItemOutcome> = state
            .results
            .iter()
            .map(|r| (r.correlation_key.as_str(), &r.outcome))
            .collect();
        for key in results.keys() {
            if data.unit.item_for(key).is_none() {
                tracing::warn!(correlation_key = %key, "Result for unknown correlation key ignored");
            }
        }

        let mut items = Vec::with_capacity(data.unit.len());
        let mut source_denied = false;
        for (correlation_key, item) in data.unit.entries() {
            let (fields, status) = match results.get(correlation_key) {
                Some(ItemOutcome::Output(text)) => {
                    (self.config.success_fields(text), ItemStatus::Completed)
                }
                Some(ItemOutcome::Error(message)) => {
                    tracing::warn!(row_key = %item.row_key, error = %message, "Item-level error");
                    (self.config.error_fields(message), ItemStatus::FailedPermanent)
                }
                None => {
                    tracing::warn!(row_key = %item.row_key, "No result for item, returning for retry");
                    items.push((item.key(), ItemStatus::FailedRetryable));
                    continue;
                }
            };

            if source_denied {
                items.push((item.key(), ItemStatus::FailedRetryable));
                continue;
            }

            match self
                .source
                .write_result(&source_id, &item.row_key, &fields)
                .await
            {
                Ok(true) => items.push((item.key(), status)),
                Ok(false) => {
                    tracing::warn!(row_key = %item.row_key, "Row no longer exists, result dropped");
                    items.push((item.key(), status));
                }
                Err(e) => {
                    if e.is_access_denied() {
                        self.ctx.guard.report_denied(&source_id);
                        source_denied = true;
                    }
                    tracing::warn!(
                        row_key = %item.row_key,
                        error = %e,
                        "Failed to write result, returning item for retry"
                    );
                    items.push((item.key(), ItemStatus::FailedRetryable));
                }
            }
        }

        let outcome = BatchOutcome {
            batch_id: data.batch_id,
            source_id,
            status: BatchStatus::Completed,
            items,
            reason: None,
        };
        tracing::info!(
            completed = outcome.count(ItemStatus::Completed),
            failed_permanent = outcome.count(ItemStatus::FailedPermanent),
            failed_retryable = outcome.count(ItemStatus::FailedRetryable),
            "Batch results written"
        );
        outcome
    }

    /// Remove every active batch without resolving it, releasing its claims.
    ///
    /// The batches keep running on the backend and can be recovered by id.
    pub fn abandon_all(&self) -> Vec<BatchSummary> {
        self.active
            .drain()
            .into_iter()
            .map(|active| {
                let summary = summarize(&active.batch);
                tracing::warn!(
                    batch_id = %summary.batch_id,
                    source_id = %summary.source_id,
                    items = summary.items,
                    submitted_at = %summary.submitted_at,
                    "Abandoning active batch; recover it by batch id"
                );
                drop(active);
                summary
            })
            .collect()
    }
}
