//! Work aggregator: reads pending items from every unblocked source and groups them into
//! submission units. Purely a read and filter; it never writes to a source or takes claims.

use std::sync::Arc;

use metrics::counter;

use crate::clock::Clock;
use crate::config::SourceConfig;
use crate::domain::{Item, SubmissionUnit};
use crate::error::Result;
use crate::guard::SourceAccessGuard;
use crate::source::TabularSource;
use crate::tracker::InFlightTracker;

/// Trigger value that accepts any non-empty trigger.
pub const ANY_TRIGGER: &str = "*";

/// Inclusion and exclusion predicates on an item's trigger value (case-insensitive).
///
/// An item with an empty or absent trigger is never accepted; exclusion wins over inclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    accept_any: bool,
}

impl TriggerFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        let normalize = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| v.trim().to_uppercase())
                .filter(|v| !v.is_empty())
                .collect()
        };
        let include = normalize(include);
        Self {
            accept_any: include.iter().any(|v| v == ANY_TRIGGER),
            include,
            exclude: normalize(exclude),
        }
    }

    pub fn accepts(&self, item: &Item) -> bool {
        let Some(trigger) = item.trigger_value() else {
            return false;
        };
        let trigger = trigger.to_uppercase();
        if self.exclude.contains(&trigger) {
            return false;
        }
        self.accept_any || self.include.contains(&trigger)
    }
}

pub struct WorkAggregator<S: TabularSource> {
    source: Arc<S>,
    guard: SourceAccessGuard,
    tracker: InFlightTracker,
    clock: Arc<dyn Clock>,
    filter: TriggerFilter,
    unit_size: usize,
    /// Per-source cap on items collected in one pass; 0 means unlimited.
    max_items_per_cycle: usize,
}

impl<S: TabularSource> WorkAggregator<S> {
    pub fn new(
        source: Arc<S>,
        guard: SourceAccessGuard,
        tracker: InFlightTracker,
        clock: Arc<dyn Clock>,
        filter: TriggerFilter,
        unit_size: usize,
        max_items_per_cycle: usize,
    ) -> Self {
        Self {
            source,
            guard,
            tracker,
            clock,
            filter,
            unit_size: unit_size.max(1),
            max_items_per_cycle,
        }
    }

    /// Collect ready units from every unblocked source, in registration order.
    ///
    /// A failing source is logged and skipped; an access denial also blocks it.
    #[tracing::instrument(skip_all, fields(sources = sources.len()))]
    pub async fn collect_ready_units(&self, sources: &[SourceConfig]) -> Vec<SubmissionUnit> {
        let mut units = Vec::new();
        for source in sources {
            if self.guard.is_blocked(&source.id) {
                tracing::debug!(source = source.display_name(), "Source blocked, skipping");
                continue;
            }
            match self.collect_source(source).await {
                Ok(mut source_units) => units.append(&mut source_units),
                Err(e) if e.is_access_denied() => {
                    counter!("volley_source_read_errors_total", "kind" => "access_denied")
                        .increment(1);
                    self.guard.report_denied(&source.id);
                }
                Err(e) => {
                    counter!("volley_source_read_errors_total", "kind" => "unavailable")
                        .increment(1);
                    tracing::warn!(
                        source = source.display_name(),
                        source_id = %source.id,
                        error = %e,
                        "Failed to read source, skipping this cycle"
                    );
                }
            }
        }
        units
    }

    async fn collect_source(&self, source: &SourceConfig) -> Result<Vec<SubmissionUnit>> {
        let items = self.source.read_items(&source.id).await?;
        let total = items.len();

        let mut ready: Vec<Item> = items
            .into_iter()
            .filter(|item| self.filter.accepts(item))
            .filter(|item| !self.tracker.is_claimed(&item.key()))
            .collect();
        let eligible = ready.len();
        if self.max_items_per_cycle > 0 {
            ready.truncate(self.max_items_per_cycle);
        }

        tracing::debug!(
            source = source.display_name(),
            rows = total,
            eligible,
            collected = ready.len(),
            "Aggregated source"
        );
        Ok(self.partition(source, ready))
    }

    /// Split items into groups of `unit_size`, keeping source order. The last group may be short.
    fn partition(&self, source: &SourceConfig, items: Vec<Item>) -> Vec<SubmissionUnit> {
        let now = self.clock.now();
        let mut units = Vec::with_capacity(items.len().div_ceil(self.unit_size));
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<Item> = items.by_ref().take(self.unit_size).collect();
            units.push(SubmissionUnit::new(source.id.clone(), chunk, now));
        }
        units
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::ItemKey;
    use crate::source::MemorySource;

    fn filter(include: &[&str], exclude: &[&str]) -> TriggerFilter {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        TriggerFilter::new(&owned(include), &owned(exclude))
    }

    fn start() -> DateTime<Utc> {
        "2026-03-02T09:00:00Z".parse().unwrap()
    }

    fn aggregator(
        source: MemorySource,
        unit_size: usize,
        max_items: usize,
    ) -> (WorkAggregator<MemorySource>, SourceAccessGuard, InFlightTracker) {
        let clock = Arc::new(ManualClock::new(start()));
        let guard = SourceAccessGuard::new(Duration::hours(1), clock.clone());
        let tracker = InFlightTracker::new();
        let aggregator = WorkAggregator::new(
            Arc::new(source),
            guard.clone(),
            tracker.clone(),
            clock,
            filter(&["YES", "GO"], &["AI"]),
            unit_size,
            max_items,
        );
        (aggregator, guard, tracker)
    }

    #[test]
    fn test_trigger_filter() {
        let f = filter(&["YES", "GO"], &["AI"]);
        assert!(f.accepts(&Item::pending("s", "1", Some("yes"))));
        assert!(f.accepts(&Item::pending("s", "1", Some(" GO "))));
        assert!(!f.accepts(&Item::pending("s", "1", Some("AI"))));
        assert!(!f.accepts(&Item::pending("s", "1", Some("maybe"))));
        assert!(!f.accepts(&Item::pending("s", "1", Some(""))));
        assert!(!f.accepts(&Item::pending("s", "1", None)));

        let any = filter(&["*"], &["AI"]);
        assert!(any.accepts(&Item::pending("s", "1", Some("x"))));
        assert!(!any.accepts(&Item::pending("s", "1", Some("ai"))));
        assert!(!any.accepts(&Item::pending("s", "1", Some("  "))));
    }

    #[tokio::test]
    async fn test_partitions_in_source_order_with_partial_tail() {
        let source = MemorySource::default();
        source.add_rows("sheet-a", 5, Some("YES"));
        let (aggregator, _, _) = aggregator(source, 2, 0);

        let units = aggregator
            .collect_ready_units(&[SourceConfig::new("sheet-a")])
            .await;
        let rows: Vec<Vec<String>> = units
            .iter()
            .map(|u| u.items().iter().map(|i| i.row_key.0.clone()).collect())
            .collect();
        assert_eq!(rows, vec![vec!["2", "3"], vec!["4", "5"], vec!["6"]]);
        assert!(units.iter().all(|u| u.created_at() == start()));
    }

    #[tokio::test]
    async fn test_skips_claimed_items() {
        let source = MemorySource::default();
        source.add_rows("sheet-a", 3, Some("YES"));
        let (aggregator, _, tracker) = aggregator(source, 10, 0);
        tracker.claim(&ItemKey::new("sheet-a", "3"));

        let units = aggregator
            .collect_ready_units(&[SourceConfig::new("sheet-a")])
            .await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].len(), 2);
        assert!(units[0].item_for("item_1_4").is_some());
    }

    #[tokio::test]
    async fn test_applies_per_source_cap() {
        let source = MemorySource::default();
        source.add_rows("sheet-a", 5, Some("YES"));
        source.add_rows("sheet-b", 5, Some("GO"));
        let (aggregator, _, _) = aggregator(source, 2, 3);

        let units = aggregator
            .collect_ready_units(&[SourceConfig::new("sheet-a"), SourceConfig::new("sheet-b")])
            .await;
        let total: usize = units.iter().map(SubmissionUnit::len).sum();
        assert_eq!(total, 6);
        assert_eq!(units.len(), 4);
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_source_is_skipped_and_denied_source_blocked() {
        let source = MemorySource::default();
        source.add_rows("sheet-a", 1, Some("YES"));
        source.add_rows("sheet-b", 1, Some("YES"));
        source.add_rows("sheet-c", 1, Some("YES"));
        source.fail_reads("sheet-a", "backend error 500");
        source.deny("sheet-b");
        let (aggregator, guard, _) = aggregator(source.clone(), 2, 0);
        let sources = [
            SourceConfig::new("sheet-a"),
            SourceConfig::new("sheet-b"),
            SourceConfig::new("sheet-c"),
        ];

        let units = aggregator.collect_ready_units(&sources).await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].source_id().0, "sheet-c");
        assert!(!guard.is_blocked(&"sheet-a".into()));
        assert!(guard.is_blocked(&"sheet-b".into()));

        // A blocked source is not even read.
        aggregator.collect_ready_units(&sources).await;
        assert_eq!(source.read_count("sheet-b"), 1);
        assert_eq!(source.read_count("sheet-a"), 2);
    }
}
