//! Prometheus metrics for the volley daemon.
//!
//! Gauges mirror the status snapshot (active batches, queued units, claimed items, blocked
//! sources); counters accumulate terminal batches and items by status. Gauges are refreshed
//! with [`VolleyMetrics::record_status`], counters through the completion hook returned by
//! [`VolleyMetrics::completion_hook`].

#[cfg(feature = "metrics")]
use std::sync::Arc;

#[cfg(feature = "metrics")]
use prometheus::core::Collector;
#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Gauge, Opts, Registry};

#[cfg(feature = "metrics")]
use crate::daemon::{BatchOutcome, CompletionHookFn, SchedulerStatus};
#[cfg(feature = "metrics")]
use crate::error::Result;

/// Prometheus metrics registry for the volley daemon.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct VolleyMetrics {
    registry: Registry,

    // Gauges (point-in-time state)
    active_batches: Gauge,
    queued_units: Gauge,
    claimed_items: Gauge,
    blocked_sources: Gauge,

    // Counters (cumulative totals)
    batches_total: CounterVec,
    items_total: CounterVec,
}

#[cfg(feature = "metrics")]
fn gauge(name: &str, help: &str) -> Result<Gauge> {
    Ok(Gauge::with_opts(Opts::new(name, help))
        .map_err(|e| anyhow::anyhow!("Failed to create {name} gauge: {e}"))?)
}

#[cfg(feature = "metrics")]
impl VolleyMetrics {
    /// Create the metrics and register them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let active_batches = gauge(
            "volley_active_batches",
            "Number of batches outstanding at the inference backend",
        )?;
        let queued_units = gauge(
            "volley_queued_units",
            "Number of claimed submission units waiting for a batch slot",
        )?;
        let claimed_items = gauge(
            "volley_claimed_items",
            "Number of items claimed by a queued unit or an active batch",
        )?;
        let blocked_sources = gauge(
            "volley_blocked_sources",
            "Number of sources in access-denied cooldown",
        )?;

        let batches_total = CounterVec::new(
            Opts::new(
                "volley_resolved_batches_total",
                "Total number of batches that reached a terminal state, by status",
            ),
            &["status"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create resolved_batches_total counter: {e}"))?;

        let items_total = CounterVec::new(
            Opts::new(
                "volley_resolved_items_total",
                "Total number of items resolved by terminal batches, by status",
            ),
            &["status"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create resolved_items_total counter: {e}"))?;

        let collectors: [(&str, Box<dyn Collector>); 6] = [
            ("active_batches", Box::new(active_batches.clone())),
            ("queued_units", Box::new(queued_units.clone())),
            ("claimed_items", Box::new(claimed_items.clone())),
            ("blocked_sources", Box::new(blocked_sources.clone())),
            ("resolved_batches_total", Box::new(batches_total.clone())),
            ("resolved_items_total", Box::new(items_total.clone())),
        ];
        for (name, collector) in collectors {
            registry
                .register(collector)
                .map_err(|e| anyhow::anyhow!("Failed to register {name}: {e}"))?;
        }

        Ok(Self {
            registry,
            active_batches,
            queued_units,
            claimed_items,
            blocked_sources,
            batches_total,
            items_total,
        })
    }

    /// Get the underlying Prometheus registry.
    ///
    /// Useful for exporting metrics via HTTP endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Publish a status snapshot as gauges.
    pub fn record_status(&self, status: &SchedulerStatus) {
        self.active_batches.set(status.active_batches as f64);
        self.queued_units.set(status.queued_units as f64);
        self.claimed_items.set(status.claimed_items as f64);
        self.blocked_sources.set(status.blocked_sources.len() as f64);
    }

    pub fn record_outcome(&self, outcome: &BatchOutcome) {
        self.batches_total
            .with_label_values(&[outcome.status.as_str()])
            .inc();
        for (_, status) in &outcome.items {
            self.items_total.with_label_values(&[status.as_str()]).inc();
        }
    }

    /// A completion hook that records every terminal batch.
    pub fn completion_hook(&self) -> CompletionHookFn {
        let metrics = self.clone();
        Arc::new(move |outcome: &BatchOutcome| metrics.record_outcome(outcome))
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use crate::daemon::{BlockedSource, DaemonStats};
    use crate::domain::{BatchId, BatchStatus, ItemKey, ItemStatus, SourceId};

    fn value(registry: &Registry, name: &str, label: Option<&str>) -> f64 {
        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == name)
            .expect("metric not found");
        let metric = family
            .get_metric()
            .iter()
            .find(|m| match label {
                Some(label) => m.get_label().iter().any(|l| l.get_value() == label),
                None => true,
            })
            .expect("label not found");
        if metric.has_counter() {
            metric.get_counter().get_value()
        } else {
            metric.get_gauge().get_value()
        }
    }

    #[test]
    fn test_record_status_sets_gauges() {
        let registry = Registry::new();
        let metrics = VolleyMetrics::new(registry.clone()).unwrap();
        let now = chrono::Utc::now();

        metrics.record_status(&SchedulerStatus {
            taken_at: now,
            active_batches: 3,
            max_concurrent_batches: 5,
            queued_units: 4,
            claimed_items: 14,
            blocked_sources: vec![BlockedSource {
                source_id: SourceId::from("sheet-a"),
                blocked_until: now,
                remaining_secs: 0,
            }],
            batches: Vec::new(),
            stats: DaemonStats::default(),
        });

        assert_eq!(value(&registry, "volley_active_batches", None), 3.0);
        assert_eq!(value(&registry, "volley_queued_units", None), 4.0);
        assert_eq!(value(&registry, "volley_claimed_items", None), 14.0);
        assert_eq!(value(&registry, "volley_blocked_sources", None), 1.0);
    }

    #[test]
    fn test_completion_hook_counts_outcomes() {
        let registry = Registry::new();
        let metrics = VolleyMetrics::new(registry.clone()).unwrap();
        let hook = metrics.completion_hook();

        hook(&BatchOutcome {
            batch_id: BatchId::from("batch_1"),
            source_id: SourceId::from("sheet-a"),
            status: BatchStatus::Completed,
            items: vec![
                (ItemKey::new("sheet-a", "2"), ItemStatus::Completed),
                (ItemKey::new("sheet-a", "3"), ItemStatus::Completed),
                (ItemKey::new("sheet-a", "4"), ItemStatus::FailedPermanent),
            ],
            reason: None,
        });

        assert_eq!(
            value(&registry, "volley_resolved_batches_total", Some("completed")),
            1.0
        );
        assert_eq!(value(&registry, "volley_resolved_items_total", Some("completed")), 2.0);
        assert_eq!(
            value(&registry, "volley_resolved_items_total", Some(ItemStatus::FailedPermanent.as_str())),
            1.0
        );
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        VolleyMetrics::new(registry.clone()).unwrap();
        assert!(VolleyMetrics::new(registry).is_err());
    }
}
