//! In-flight tracker: the set of items currently owned by a queued unit or an outstanding batch.
//!
//! Claims are taken before a unit is handed to the scheduler and released exactly once on
//! every terminal outcome. [`ClaimSet`] makes the release a scoped acquisition: dropping it
//! releases whatever it still holds, so an error or panic in result processing cannot leave
//! items orphaned as permanently in flight.

use std::sync::Arc;

use dashmap::DashSet;

use crate::domain::ItemKey;

#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    claimed: Arc<DashSet<ItemKey>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an item. Returns `false` if it is already claimed.
    pub fn claim(&self, key: &ItemKey) -> bool {
        self.claimed.insert(key.clone())
    }

    /// Release a claim. Returns `false` if the item was not claimed.
    pub fn release(&self, key: &ItemKey) -> bool {
        self.claimed.remove(key).is_some()
    }

    pub fn is_claimed(&self, key: &ItemKey) -> bool {
        self.claimed.contains(key)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }

    /// Claim every key that is free, returning a guard over the ones this call acquired.
    pub fn claim_all<'a>(&self, keys: impl IntoIterator<Item = &'a ItemKey>) -> ClaimSet {
        let keys = keys.into_iter().filter(|key| self.claim(key)).cloned().collect();
        ClaimSet {
            tracker: self.clone(),
            keys,
        }
    }
}

/// Claims held for one unit or batch, released on drop. The set moves with its unit
/// from the queue into the active batch and out again with the batch's outcome.
#[derive(Debug)]
pub struct ClaimSet {
    tracker: InFlightTracker,
    keys: Vec<ItemKey>,
}

impl ClaimSet {
    pub fn keys(&self) -> &[ItemKey] {
        &self.keys
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Drop for ClaimSet {
    fn drop(&mut self) {
        for key in self.keys.drain(..) {
            if !self.tracker.release(&key) {
                tracing::warn!(item = %key, "Released an item that was not claimed");
            }
        }
    }
}
