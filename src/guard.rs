//! Source access guard: a per-source circuit breaker for authorization failures.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metrics::counter;

use crate::clock::Clock;
use crate::domain::{SourceAccessState, SourceId};

/// Blocks a source for a cooldown window after it denies access, without affecting any
/// other source. A source whose window has passed is unblocked on the next check.
#[derive(Clone)]
pub struct SourceAccessGuard {
    states: Arc<DashMap<SourceId, SourceAccessState>>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl SourceAccessGuard {
    pub fn new(cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            cooldown,
            clock,
        }
    }

    /// Whether the source is currently blocked. Clears an expired block.
    pub fn is_blocked(&self, source_id: &SourceId) -> bool {
        let now = self.clock.now();
        let blocked = self
            .states
            .get(source_id)
            .is_some_and(|state| state.is_blocked_at(now));
        if !blocked {
            self.maybe_unblock(source_id);
        }
        blocked
    }

    /// Block the source until `now + cooldown`, saturating at the latest representable time.
    pub fn report_denied(&self, source_id: &SourceId) {
        let until = self
            .clock
            .now()
            .checked_add_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.states.entry(source_id.clone()).or_default();
        state.blocked_until = Some(until);
        state.denials += 1;
        counter!("volley_source_blocks_total").increment(1);
        tracing::warn!(
            source_id = %source_id,
            blocked_until = %until,
            denials = state.denials,
            "Source denied access, blocking until cooldown ends"
        );
    }

    /// Clear the block if its deadline has passed. Returns `true` if a block was cleared.
    pub fn maybe_unblock(&self, source_id: &SourceId) -> bool {
        let now = self.clock.now();
        let Some(mut state) = self.states.get_mut(source_id) else {
            return false;
        };
        match state.blocked_until {
            Some(until) if until <= now => {
                state.blocked_until = None;
                tracing::info!(source_id = %source_id, "Source cooldown elapsed, unblocking");
                true
            }
            _ => false,
        }
    }

    /// Currently blocked sources with their unblock time, sorted by source id.
    pub fn blocked_sources(&self) -> Vec<(SourceId, DateTime<Utc>)> {
        let now = self.clock.now();
        let mut blocked: Vec<_> = self
            .states
            .iter()
            .filter_map(|entry| {
                entry
                    .blocked_until
                    .filter(|until| *until > now)
                    .map(|until| (entry.key().clone(), until))
            })
            .collect();
        blocked.sort();
        blocked
    }

    pub fn state(&self, source_id: &SourceId) -> Option<SourceAccessState> {
        self.states.get(source_id).map(|s| s.clone())
    }
}
