//! Batch scheduler: queues claimed units and admits them into free batch slots,
//! round-robin across sources.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;

use super::SchedulerContext;
use super::lifecycle::LifecycleManager;
use super::types::StatsCounters;
use crate::config::{CacheConfig, SourceConfig};
use crate::domain::{ArtifactKind, Batch, BatchId, SourceId, SubmissionUnit, Submitted};
use crate::error::{Result, VolleyError};
use crate::fetch::ReferenceFetcher;
use crate::inference::{BatchRequest, InferenceClient, SharedContext};
use crate::source::TabularSource;
use crate::tracker::ClaimSet;

/// A queued unit together with the claims on its items. Dropping it releases them.
#[derive(Debug)]
pub struct ClaimedUnit {
    pub unit: SubmissionUnit,
    pub claims: ClaimSet,
}

/// Units waiting for a slot, served round-robin by source so a prolific source cannot
/// starve the others.
#[derive(Debug, Default)]
pub struct UnitQueue {
    order: VecDeque<SourceId>,
    units: HashMap<SourceId, VecDeque<ClaimedUnit>>,
    len: usize,
}

impl UnitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: ClaimedUnit) {
        let source_id = unit.unit.source_id().clone();
        let queue = self.units.entry(source_id.clone()).or_default();
        if queue.is_empty() {
            self.order.push_back(source_id);
        }
        queue.push_back(unit);
        self.len += 1;
    }

    /// Take the next unit from the source whose turn it is.
    pub fn pop_next(&mut self) -> Option<ClaimedUnit> {
        let source_id = self.order.pop_front()?;
        let queue = self.units.get_mut(&source_id)?;
        let unit = queue.pop_front()?;
        if queue.is_empty() {
            self.units.remove(&source_id);
        } else {
            self.order.push_back(source_id);
        }
        self.len -= 1;
        Some(unit)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn drain(&mut self) -> Vec<ClaimedUnit> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(unit) = self.pop_next() {
            drained.push(unit);
        }
        drained
    }
}

pub struct BatchScheduler<C: InferenceClient, F: ReferenceFetcher> {
    client: Arc<C>,
    fetcher: Arc<F>,
    ctx: SchedulerContext,
    artifacts: HashMap<SourceId, Vec<ArtifactKind>>,
    cache_config: CacheConfig,
    queue: Mutex<UnitQueue>,
    stats: Arc<StatsCounters>,
}

impl<C: InferenceClient, F: ReferenceFetcher> BatchScheduler<C, F> {
    pub(crate) fn new(
        client: Arc<C>,
        fetcher: Arc<F>,
        ctx: SchedulerContext,
        sources: &[SourceConfig],
        cache_config: CacheConfig,
        stats: Arc<StatsCounters>,
    ) -> Self {
        let artifacts = sources
            .iter()
            .filter(|s| !s.context_artifacts.is_empty())
            .map(|s| (s.id.clone(), s.context_artifacts.clone()))
            .collect();
        Self {
            client,
            fetcher,
            ctx,
            artifacts,
            cache_config,
            queue: Mutex::new(UnitQueue::new()),
            stats,
        }
    }

    pub fn queued_units(&self) -> usize {
        self.queue.lock().len()
    }

    /// Claim each unit's items and queue it. Items already claimed are dropped from their
    /// unit; a unit with nothing left is discarded. Returns the number of units queued.
    pub fn enqueue(&self, units: Vec<SubmissionUnit>) -> usize {
        let mut queued = 0;
        for unit in units {
            let keys = unit.keys();
            let claims = self.ctx.tracker.claim_all(&keys);
            if claims.is_empty() {
                tracing::debug!(unit_id = %unit.id(), "All items already in flight, dropping unit");
                continue;
            }
            let unit = if claims.len() < unit.len() {
                unit.retain(|key| claims.contains(key))
            } else {
                unit
            };
            self.queue.lock().push(ClaimedUnit { unit, claims });
            queued += 1;
        }
        queued
    }

    /// Submit queued units while slots are free.
    ///
    /// A failed submission releases the unit's claims and frees its slot; the items are
    /// picked up again by a later aggregation pass. A backend rejection ends this pass.
    #[tracing::instrument(skip_all, fields(queued = self.queued_units()))]
    pub async fn admit<S: TabularSource>(&self, lifecycle: &LifecycleManager<S, C>) -> usize {
        let mut admitted = 0;
        loop {
            let Some(slot) = lifecycle.try_reserve_slot() else {
                tracing::trace!("No free batch slot");
                break;
            };
            let Some(ClaimedUnit { unit, claims }) = self.queue.lock().pop_next() else {
                break;
            };

            match self.submit(&unit).await {
                Ok(batch_id) => {
                    tracing::info!(
                        batch_id = %batch_id,
                        source_id = %unit.source_id(),
                        unit_id = %unit.id(),
                        items = unit.len(),
                        "Submitted batch"
                    );
                    counter!("volley_batches_submitted_total").increment(1);
                    self.stats.batch_submitted();
                    let batch = Batch::<Submitted>::new(batch_id, unit, self.ctx.clock.now());
                    lifecycle.track(batch, slot, claims);
                    admitted += 1;
                }
                Err(e) => {
                    counter!("volley_submission_failures_total").increment(1);
                    self.stats.submission_failed();
                    tracing::warn!(
                        source_id = %unit.source_id(),
                        unit_id = %unit.id(),
                        items = unit.len(),
                        error = %e,
                        "Submission failed, items returned for retry"
                    );
                    drop(claims);

                    // Context failures are scoped to one source; anything else is the backend.
                    if !matches!(e, VolleyError::Fetch { .. } | VolleyError::AccessDenied { .. }) {
                        break;
                    }
                    if e.is_access_denied() {
                        self.ctx.guard.report_denied(unit.source_id());
                    }
                }
            }
        }
        admitted
    }

    async fn submit(&self, unit: &SubmissionUnit) -> Result<BatchId> {
        let context = self.resolve_context(unit.source_id()).await?;
        self.client
            .submit(BatchRequest {
                unit,
                context: &context,
            })
            .await
    }

    /// Resolve the source's context artifacts through the content cache.
    async fn resolve_context(&self, source_id: &SourceId) -> Result<Vec<SharedContext>> {
        let Some(kinds) = self.artifacts.get(source_id) else {
            return Ok(Vec::new());
        };
        let mut context = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let lookup = self
                .ctx
                .cache
                .get_or_refresh(
                    source_id,
                    kind,
                    || self.fetcher.fetch(source_id, kind),
                    self.cache_config.ttl_for(kind),
                )
                .await?;
            context.push(SharedContext {
                kind: kind.clone(),
                content: lookup.payload,
            });
        }
        Ok(context)
    }

    /// Drop every queued unit and release its claims. Returns the number of units dropped.
    pub fn release_queued(&self) -> usize {
        let units = self.queue.lock().drain();
        let dropped = units.len();
        drop(units);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::aggregator::{TriggerFilter, WorkAggregator};
    use crate::clock::ManualClock;
    use crate::daemon::DaemonConfig;
    use crate::domain::Item;
    use crate::fetch::MockReferenceFetcher;
    use crate::inference::MockInferenceClient;
    use crate::source::MemorySource;
    use crate::tracker::InFlightTracker;

    fn unit(source: &str, rows: &[&str]) -> SubmissionUnit {
        SubmissionUnit::new(
            SourceId::from(source),
            rows.iter()
                .map(|row| Item::pending(source, *row, Some("YES")))
                .collect(),
            Utc::now(),
        )
    }

    fn queued(tracker: &InFlightTracker, source: &str, rows: &[&str]) -> ClaimedUnit {
        let unit = unit(source, rows);
        let claims = tracker.claim_all(&unit.keys());
        ClaimedUnit { unit, claims }
    }

    struct Harness {
        scheduler: BatchScheduler<MockInferenceClient, MockReferenceFetcher>,
        lifecycle: LifecycleManager<MemorySource, MockInferenceClient>,
        client: Arc<MockInferenceClient>,
        fetcher: Arc<MockReferenceFetcher>,
        ctx: SchedulerContext,
    }

    fn harness(max_concurrent_batches: usize, sources: &[SourceConfig]) -> Harness {
        let config = DaemonConfig {
            max_concurrent_batches,
            ..Default::default()
        };
        let ctx = SchedulerContext::new(Duration::hours(1), Arc::new(ManualClock::default()));
        let client = Arc::new(MockInferenceClient::new());
        let fetcher = Arc::new(MockReferenceFetcher::new());
        let stats = Arc::new(StatsCounters::default());
        let scheduler = BatchScheduler::new(
            client.clone(),
            fetcher.clone(),
            ctx.clone(),
            sources,
            CacheConfig::default(),
            stats.clone(),
        );
        let lifecycle = LifecycleManager::new(
            Arc::new(MemorySource::default()),
            client.clone(),
            ctx.clone(),
            config,
            stats,
        );
        Harness {
            scheduler,
            lifecycle,
            client,
            fetcher,
            ctx,
        }
    }

    #[test]
    fn test_unit_queue_round_robin_across_sources() {
        let tracker = InFlightTracker::new();
        let mut queue = UnitQueue::new();
        queue.push(queued(&tracker, "a", &["1"]));
        queue.push(queued(&tracker, "a", &["2"]));
        queue.push(queued(&tracker, "a", &["3"]));
        queue.push(queued(&tracker, "b", &["1"]));
        queue.push(queued(&tracker, "c", &["1"]));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_next())
            .map(|u| format!("{}:{}", u.unit.source_id(), u.unit.items()[0].row_key))
            .collect();
        assert_eq!(order, vec!["a:1", "b:1", "c:1", "a:2", "a:3"]);
        assert!(queue.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_enqueue_claims_and_trims() {
        let h = harness(1, &[]);
        h.ctx.tracker.claim(&crate::domain::ItemKey::new("a", "2"));

        let queued = h
            .scheduler
            .enqueue(vec![unit("a", &["1", "2"]), unit("a", &["2"])]);
        assert_eq!(queued, 1);
        assert_eq!(h.scheduler.queued_units(), 1);
        assert_eq!(h.ctx.tracker.len(), 2);

        assert_eq!(h.scheduler.release_queued(), 1);
        assert_eq!(h.ctx.tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_admit_respects_ceiling() {
        let h = harness(2, &[]);
        h.scheduler.enqueue(vec![
            unit("a", &["1"]),
            unit("b", &["1"]),
            unit("c", &["1"]),
        ]);

        assert_eq!(h.scheduler.admit(&h.lifecycle).await, 2);
        assert_eq!(h.lifecycle.active_count(), 2);
        assert_eq!(h.scheduler.queued_units(), 1);
        assert_eq!(h.client.submit_count(), 2);

        // Still full: nothing more is submitted.
        assert_eq!(h.scheduler.admit(&h.lifecycle).await, 0);
        assert_eq!(h.client.submit_count(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_submission_failure_releases_claims_without_using_slot() {
        let h = harness(1, &[]);
        h.scheduler
            .enqueue(vec![unit("a", &["1", "2"]), unit("b", &["1"])]);
        h.client.fail_next_submit("overloaded");

        assert_eq!(h.scheduler.admit(&h.lifecycle).await, 0);
        assert_eq!(h.lifecycle.active_count(), 0);
        assert_eq!(h.ctx.tracker.len(), 1);

        assert_eq!(h.scheduler.admit(&h.lifecycle).await, 1);
        assert_eq!(h.client.submissions()[0].source_id, SourceId::from("b"));
    }

    #[tokio::test]
    async fn test_context_artifacts_resolved_through_cache() {
        let sources = [SourceConfig::new("a").with_artifact(ArtifactKind::REFERENCE_TEXT)];
        let h = harness(2, &sources);
        h.fetcher.set("a", ArtifactKind::REFERENCE_TEXT, "chapter text");
        h.scheduler
            .enqueue(vec![unit("a", &["1"]), unit("a", &["2"])]);

        assert_eq!(h.scheduler.admit(&h.lifecycle).await, 2);
        let submissions = h.client.submissions();
        assert_eq!(submissions[0].context[0].content.as_str(), "chapter text");
        assert!(Arc::ptr_eq(
            &submissions[0].context[0].content,
            &submissions[1].context[0].content
        ));
        assert_eq!(h.fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_fetch_blocks_source_and_continues() {
        let sources = [SourceConfig::new("a").with_artifact(ArtifactKind::TEMPLATES)];
        let h = harness(2, &sources);
        h.fetcher.fail_with("403 Forbidden");
        h.scheduler
            .enqueue(vec![unit("a", &["1"]), unit("b", &["1"])]);

        assert_eq!(h.scheduler.admit(&h.lifecycle).await, 1);
        assert!(h.ctx.guard.is_blocked(&SourceId::from("a")));
        assert_eq!(h.client.submissions()[0].source_id, SourceId::from("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_aggregation_passes_never_double_claim() {
        let ctx = SchedulerContext::new(Duration::hours(1), Arc::new(ManualClock::default()));
        let source = MemorySource::default();
        let sources: Vec<SourceConfig> = ["a", "b", "c"]
            .iter()
            .map(|id| {
                source.add_rows(id, 40, Some("YES"));
                SourceConfig::new(id)
            })
            .collect();
        let aggregator = Arc::new(WorkAggregator::new(
            Arc::new(source),
            ctx.guard.clone(),
            ctx.tracker.clone(),
            ctx.clock.clone(),
            TriggerFilter::new(&["YES".to_string()], &[]),
            2,
            0,
        ));
        let scheduler = Arc::new(BatchScheduler::new(
            Arc::new(MockInferenceClient::new()),
            Arc::new(MockReferenceFetcher::new()),
            ctx.clone(),
            &sources,
            CacheConfig::default(),
            Arc::new(StatsCounters::default()),
        ));
        let sources = Arc::new(sources);

        for _ in 0..25 {
            // Two aggregate-and-enqueue passes race with no tick lock between them.
            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let passes: Vec<_> = (0..2)
                .map(|_| {
                    let aggregator = aggregator.clone();
                    let scheduler = scheduler.clone();
                    let sources = sources.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        let units = aggregator.collect_ready_units(&sources).await;
                        scheduler.enqueue(units)
                    })
                })
                .collect();
            for pass in passes {
                pass.await.unwrap();
            }

            let queued = scheduler.queue.lock().drain();
            let mut seen = HashSet::new();
            for claimed in &queued {
                for key in claimed.unit.keys() {
                    assert!(claimed.claims.contains(&key));
                    assert!(seen.insert(key.clone()), "{key} queued twice");
                }
            }
            assert_eq!(seen.len(), 120);
            assert_eq!(ctx.tracker.len(), 120);

            drop(queued);
            assert!(ctx.tracker.is_empty());
        }
    }
}
