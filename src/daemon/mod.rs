//! Daemon that continuously turns pending source items into inference batches.
//!
//! Each tick aggregates ready work from every unblocked source, claims it, admits queued
//! units into free batch slots, polls outstanding batches and writes finished results
//! back. All shared state lives in a [`SchedulerContext`] created with the daemon and
//! torn down when its loop exits.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{TriggerFilter, WorkAggregator};
use crate::cache::{ContentCache, ContentChanged};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, SourceConfig, check_duration, millis};
use crate::domain::{Batch, BatchId, SubmissionUnit, Submitted};
use crate::error::{Result, VolleyError};
use crate::fetch::{NoReferences, ReferenceFetcher};
use crate::guard::SourceAccessGuard;
use crate::inference::InferenceClient;
use crate::source::{RowFields, TabularSource};
use crate::tracker::InFlightTracker;

pub mod lifecycle;
pub mod scheduler;
pub mod types;

pub use lifecycle::{ActiveBatches, LifecycleManager, SlotPermit};
pub use scheduler::{BatchScheduler, ClaimedUnit, UnitQueue};
pub use types::{
    BatchOutcome, BatchSummary, BlockedSource, DaemonStats, SchedulerStatus, TickSummary,
};

use types::StatsCounters;

/// Callback invoked once for every batch that reaches a terminal state, after its
/// results (if any) have been written.
pub type CompletionHookFn = Arc<dyn Fn(&BatchOutcome) + Send + Sync>;

/// Configuration for the daemon.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Upper bound on batches outstanding at the inference backend
    pub max_concurrent_batches: usize,

    /// Items per submission unit
    pub unit_size: usize,

    /// How long to sleep between scheduling ticks
    pub tick_interval_ms: u64,

    /// Minimum time between two polls of the same batch
    pub poll_interval_ms: u64,

    /// A batch still unresolved after this long is expired and its items retried
    pub max_batch_age_ms: u64,

    /// How long a source stays blocked after an authorization failure
    pub access_block_cooldown_ms: u64,

    /// Trigger values that make an item eligible. `"*"` accepts any non-empty value.
    pub include_triggers: Vec<String>,

    /// Trigger values that are never eligible; wins over `include_triggers`
    pub exclude_triggers: Vec<String>,

    /// Per-source cap on items collected in one tick; 0 means unlimited
    pub max_items_per_cycle: usize,

    /// Interval for logging daemon status. Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,

    /// Field that receives the model output (or the error message)
    pub output_field: String,

    /// Field holding the item's trigger value
    pub trigger_field: String,

    /// Trigger value written once an item completes
    pub completed_trigger: String,

    /// Trigger value written when an item fails permanently
    pub failed_trigger: String,

    /// Prefix for error messages written to `output_field`
    pub error_marker: String,

    #[serde(skip)]
    pub completion_hook: Option<CompletionHookFn>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: 5,
            unit_size: 2,
            tick_interval_ms: 5_000,
            poll_interval_ms: 30_000,
            max_batch_age_ms: 60 * 60 * 1000,         // 1 hour
            access_block_cooldown_ms: 60 * 60 * 1000, // 1 hour
            include_triggers: vec!["YES".to_string(), "GO".to_string()],
            exclude_triggers: vec!["AI".to_string()],
            max_items_per_cycle: 0,
            status_log_interval_ms: Some(60_000),
            output_field: "AI TN".to_string(),
            trigger_field: "Go?".to_string(),
            completed_trigger: "AI".to_string(),
            failed_trigger: "ERROR".to_string(),
            error_marker: "ERROR: ".to_string(),
            completion_hook: None,
        }
    }
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("max_concurrent_batches", &self.max_concurrent_batches)
            .field("unit_size", &self.unit_size)
            .field("tick_interval_ms", &self.tick_interval_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_batch_age_ms", &self.max_batch_age_ms)
            .field("access_block_cooldown_ms", &self.access_block_cooldown_ms)
            .field("include_triggers", &self.include_triggers)
            .field("exclude_triggers", &self.exclude_triggers)
            .field("max_items_per_cycle", &self.max_items_per_cycle)
            .field("status_log_interval_ms", &self.status_log_interval_ms)
            .field("output_field", &self.output_field)
            .field("trigger_field", &self.trigger_field)
            .field("completed_trigger", &self.completed_trigger)
            .field("failed_trigger", &self.failed_trigger)
            .field("error_marker", &self.error_marker)
            .field("completion_hook", &self.completion_hook.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_batches == 0 {
            return Err(VolleyError::Config(
                "max_concurrent_batches must be at least 1".into(),
            ));
        }
        if self.unit_size == 0 {
            return Err(VolleyError::Config("unit_size must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(VolleyError::Config(
                "poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(VolleyError::Config(
                "tick_interval_ms must be greater than 0".into(),
            ));
        }
        if self.status_log_interval_ms == Some(0) {
            return Err(VolleyError::Config(
                "status_log_interval_ms must be greater than 0 (omit it to disable)".into(),
            ));
        }
        check_duration("poll_interval_ms", self.poll_interval_ms, 1000)?;
        check_duration("tick_interval_ms", self.tick_interval_ms, 1000)?;
        check_duration("max_batch_age_ms", self.max_batch_age_ms, 1000)?;
        check_duration("access_block_cooldown_ms", self.access_block_cooldown_ms, 1000)?;
        if let Some(interval_ms) = self.status_log_interval_ms {
            check_duration("status_log_interval_ms", interval_ms, 1000)?;
        }
        if self.output_field.is_empty() || self.trigger_field.is_empty() {
            return Err(VolleyError::Config(
                "output_field and trigger_field must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> chrono::Duration {
        millis(self.poll_interval_ms)
    }

    pub fn max_batch_age(&self) -> chrono::Duration {
        millis(self.max_batch_age_ms)
    }

    pub fn access_block_cooldown(&self) -> chrono::Duration {
        millis(self.access_block_cooldown_ms)
    }

    /// Fields written for an item whose output came back successfully.
    pub fn success_fields(&self, output: &str) -> RowFields {
        RowFields::from([
            (self.output_field.clone(), output.to_string()),
            (self.trigger_field.clone(), self.completed_trigger.clone()),
        ])
    }

    /// Fields written for an item the backend rejected.
    pub fn error_fields(&self, message: &str) -> RowFields {
        RowFields::from([
            (
                self.output_field.clone(),
                format!("{}{}", self.error_marker, message),
            ),
            (self.trigger_field.clone(), self.failed_trigger.clone()),
        ])
    }
}

/// Shared scheduler state, passed explicitly to every component.
///
/// Each field is a cheap handle; clones see the same state.
#[derive(Clone)]
pub struct SchedulerContext {
    pub tracker: InFlightTracker,
    pub guard: SourceAccessGuard,
    pub cache: ContentCache,
    pub clock: Arc<dyn Clock>,
}

impl SchedulerContext {
    pub fn new(access_block_cooldown: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            tracker: InFlightTracker::new(),
            guard: SourceAccessGuard::new(access_block_cooldown, clock.clone()),
            cache: ContentCache::new(clock.clone()),
            clock,
        }
    }
}

/// Stop signals for [`Daemon::run`].
///
/// `drain` stops admitting new work and exits once every active batch has resolved.
/// `abort` exits at the next await point; active batches are abandoned.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    pub drain: CancellationToken,
    pub abort: CancellationToken,
}

impl ShutdownSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_drain(&self) {
        self.drain.cancel();
    }

    pub fn request_abort(&self) {
        self.abort.cancel();
    }
}

/// Builder for [`Daemon`].
pub struct DaemonBuilder<S, C, F = NoReferences> {
    source: Arc<S>,
    client: Arc<C>,
    fetcher: Arc<F>,
    config: DaemonConfig,
    sources: Vec<SourceConfig>,
    cache_config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl<S, C, F> DaemonBuilder<S, C, F>
where
    S: TabularSource,
    C: InferenceClient,
    F: ReferenceFetcher,
{
    /// Register the sources to schedule, in round-robin order.
    pub fn sources(mut self, sources: Vec<SourceConfig>) -> Self {
        self.sources = sources;
        self
    }

    pub fn fetcher<G: ReferenceFetcher>(self, fetcher: Arc<G>) -> DaemonBuilder<S, C, G> {
        DaemonBuilder {
            source: self.source,
            client: self.client,
            fetcher,
            config: self.config,
            sources: self.sources,
            cache_config: self.cache_config,
            clock: self.clock,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache_config(mut self, cache_config: CacheConfig) -> Self {
        self.cache_config = cache_config;
        self
    }

    pub fn build(self) -> Result<Daemon<S, C, F>> {
        self.config.validate()?;
        self.cache_config.validate()?;
        for (i, source) in self.sources.iter().enumerate() {
            if self.sources[..i].iter().any(|s| s.id == source.id) {
                return Err(VolleyError::Config(format!(
                    "source {} is registered more than once",
                    source.id
                )));
            }
        }

        let ctx = SchedulerContext::new(self.config.access_block_cooldown(), self.clock);
        let stats = Arc::new(StatsCounters::default());
        let aggregator = WorkAggregator::new(
            self.source.clone(),
            ctx.guard.clone(),
            ctx.tracker.clone(),
            ctx.clock.clone(),
            TriggerFilter::new(&self.config.include_triggers, &self.config.exclude_triggers),
            self.config.unit_size,
            self.config.max_items_per_cycle,
        );
        let scheduler = BatchScheduler::new(
            self.client.clone(),
            self.fetcher,
            ctx.clone(),
            &self.sources,
            self.cache_config,
            stats.clone(),
        );
        let lifecycle = LifecycleManager::new(
            self.source,
            self.client,
            ctx.clone(),
            self.config.clone(),
            stats.clone(),
        );

        Ok(Daemon {
            config: self.config,
            sources: self.sources,
            ctx,
            aggregator,
            scheduler,
            lifecycle,
            stats,
            tick_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// Continuous batch scheduler over a set of registered sources.
pub struct Daemon<S, C, F = NoReferences>
where
    S: TabularSource,
    C: InferenceClient,
    F: ReferenceFetcher,
{
    config: DaemonConfig,
    sources: Vec<SourceConfig>,
    ctx: SchedulerContext,
    aggregator: WorkAggregator<S>,
    scheduler: BatchScheduler<C, F>,
    lifecycle: LifecycleManager<S, C>,
    stats: Arc<StatsCounters>,
    /// Serializes ticks, so a manual [`Daemon::tick`] never overlaps the run loop.
    tick_lock: tokio::sync::Mutex<()>,
}

impl<S, C> Daemon<S, C, NoReferences>
where
    S: TabularSource,
    C: InferenceClient,
{
    pub fn builder(
        source: Arc<S>,
        client: Arc<C>,
        config: DaemonConfig,
    ) -> DaemonBuilder<S, C, NoReferences> {
        DaemonBuilder {
            source,
            client,
            fetcher: Arc::new(NoReferences),
            config,
            sources: Vec::new(),
            cache_config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl<S, C, F> Daemon<S, C, F>
where
    S: TabularSource + 'static,
    C: InferenceClient + 'static,
    F: ReferenceFetcher + 'static,
{
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Receive a notification whenever a cached context artifact changes.
    pub fn content_changes(&self) -> broadcast::Receiver<ContentChanged> {
        self.ctx.cache.subscribe()
    }

    /// Run the scheduling loop until a shutdown signal fires.
    ///
    /// A panic or error inside one tick is logged and the loop carries on. On exit, queued
    /// units release their claims and still-active batches are abandoned (logged with their
    /// ids so they can be recovered with [`Daemon::recover_batch`]).
    #[tracing::instrument(skip_all, fields(sources = self.sources.len()))]
    pub async fn run(self: Arc<Self>, signals: ShutdownSignals) -> Result<()> {
        tracing::info!(
            max_concurrent_batches = self.config.max_concurrent_batches,
            unit_size = self.config.unit_size,
            tick_interval_ms = self.config.tick_interval_ms,
            "Daemon starting scheduling loop"
        );
        scopeguard::defer! {
            self.teardown();
        }

        let status_stop = CancellationToken::new();
        let _status_stop_guard = status_stop.clone().drop_guard();
        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let daemon = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(StdDuration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let status = daemon.status();
                            tracing::info!(
                                active_batches = status.active_batches,
                                queued_units = status.queued_units,
                                claimed_items = status.claimed_items,
                                blocked_sources = status.blocked_sources.len(),
                                batches_completed = status.stats.batches_completed,
                                batches_failed = status.stats.batches_failed,
                                batches_expired = status.stats.batches_expired,
                                "Daemon status"
                            );
                        }
                        _ = status_stop.cancelled() => break,
                    }
                }
            });
        }

        let mut interval =
            tokio::time::interval(StdDuration::from_millis(self.config.tick_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signals.abort.cancelled() => {
                    tracing::info!("Abort requested, stopping scheduling loop");
                    break;
                }
                _ = interval.tick() => {}
            }

            let draining = signals.drain.is_cancelled();
            if draining && self.lifecycle.active_count() == 0 {
                tracing::info!("Drain complete, stopping scheduling loop");
                break;
            }

            let tick = AssertUnwindSafe(self.run_tick(!draining)).catch_unwind();
            tokio::select! {
                biased;
                _ = signals.abort.cancelled() => {
                    tracing::info!("Abort requested during tick, stopping scheduling loop");
                    break;
                }
                result = tick => {
                    if let Err(panic) = result {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        tracing::error!(panic = %message, "Scheduling tick panicked, continuing");
                    }
                }
            }
        }

        Ok(())
    }

    /// Run a single scheduling tick: aggregate, claim, admit, poll, then backfill freed slots.
    pub async fn tick(&self) -> TickSummary {
        self.run_tick(true).await
    }

    async fn run_tick(&self, admit_new_work: bool) -> TickSummary {
        let _serial = self.tick_lock.lock().await;
        let mut summary = TickSummary::default();

        if admit_new_work {
            let units = self.aggregator.collect_ready_units(&self.sources).await;
            summary.units_queued = self.scheduler.enqueue(units);
            summary.batches_admitted = self.scheduler.admit(&self.lifecycle).await;
        }

        summary.outcomes = self.lifecycle.poll_due().await;

        if admit_new_work && !summary.outcomes.is_empty() {
            summary.batches_admitted += self.scheduler.admit(&self.lifecycle).await;
        }

        tracing::debug!(
            units_queued = summary.units_queued,
            batches_admitted = summary.batches_admitted,
            batches_resolved = summary.outcomes.len(),
            active_batches = self.lifecycle.active_count(),
            "Tick complete"
        );
        summary
    }

    /// Re-attach a batch known only by its backend id, for example one abandoned by an
    /// earlier run. `unit` must describe the items the batch was submitted with.
    ///
    /// Fails if the batch is already active, if any of its items is already in flight, or
    /// if no batch slot is free.
    #[tracing::instrument(skip(self, unit), fields(source_id = %unit.source_id(), items = unit.len()))]
    pub fn recover_batch(&self, batch_id: BatchId, unit: SubmissionUnit) -> Result<()> {
        if self.lifecycle.is_active(&batch_id) {
            return Err(VolleyError::Other(anyhow::anyhow!(
                "batch {batch_id} is already active"
            )));
        }
        let claims = self.ctx.tracker.claim_all(&unit.keys());
        if claims.len() < unit.len() {
            return Err(VolleyError::Other(anyhow::anyhow!(
                "{} of {} items of batch {batch_id} are already in flight",
                unit.len() - claims.len(),
                unit.len()
            )));
        }
        let slot = self.lifecycle.try_reserve_slot().ok_or_else(|| {
            VolleyError::Other(anyhow::anyhow!(
                "no free batch slot to recover batch {batch_id}"
            ))
        })?;

        tracing::info!(batch_id = %batch_id, "Recovering batch");
        let batch = Batch::<Submitted>::new(batch_id, unit, self.ctx.clock.now());
        self.lifecycle.track(batch, slot, claims);
        Ok(())
    }

    /// Snapshot of live scheduler state.
    pub fn status(&self) -> SchedulerStatus {
        let now = self.ctx.clock.now();
        SchedulerStatus {
            taken_at: now,
            active_batches: self.lifecycle.active_count(),
            max_concurrent_batches: self.lifecycle.capacity(),
            queued_units: self.scheduler.queued_units(),
            claimed_items: self.ctx.tracker.len(),
            blocked_sources: self
                .ctx
                .guard
                .blocked_sources()
                .into_iter()
                .map(|(source_id, blocked_until)| BlockedSource {
                    remaining_secs: (blocked_until - now).num_seconds().max(0),
                    source_id,
                    blocked_until,
                })
                .collect(),
            batches: self.lifecycle.summaries(),
            stats: self.stats.snapshot(),
        }
    }

    fn teardown(&self) {
        let released_units = self.scheduler.release_queued();
        let abandoned = self.lifecycle.abandon_all();
        tracing::info!(
            released_units,
            abandoned_batches = abandoned.len(),
            claimed_items = self.ctx.tracker.len(),
            "Daemon stopped"
        );
    }
}
