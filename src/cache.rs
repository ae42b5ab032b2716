//! Content cache for per-source reference artifacts.
//!
//! Entries are keyed by `(source_id, artifact_kind)` and refreshed lazily once older than
//! their ttl. A refresh whose content hashes the same as the stored entry only moves
//! `fetched_at` forward: the stored `Arc` is kept, so anything keyed off the payload's
//! identity (for example a prompt cache on the inference backend) stays valid. A refresh
//! with new content replaces the entry and broadcasts [`ContentChanged`].

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::domain::{ArtifactKind, SourceId};
use crate::error::{Result, VolleyError};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// One cached artifact.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Hex sha256 of `payload`.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: Arc<String>,
}

/// Result of [`ContentCache::get_or_refresh`].
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub payload: Arc<String>,
    /// `fetch_fn` ran and succeeded.
    pub refreshed: bool,
    /// The stored payload was replaced with different content (or stored for the first time).
    pub changed: bool,
}

/// Broadcast whenever an artifact's content changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChanged {
    pub source_id: SourceId,
    pub kind: ArtifactKind,
    pub previous_hash: Option<String>,
    pub content_hash: String,
}

#[derive(Clone)]
pub struct ContentCache {
    entries: Arc<DashMap<(SourceId, ArtifactKind), CacheEntry>>,
    changes: broadcast::Sender<ContentChanged>,
    clock: Arc<dyn Clock>,
}

pub fn content_hash(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

impl ContentCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(DashMap::new()),
            changes,
            clock,
        }
    }

    /// Receive a [`ContentChanged`] for every content change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ContentChanged> {
        self.changes.subscribe()
    }

    /// Return the cached payload, refreshing it through `fetch_fn` if it is older than `ttl`.
    ///
    /// A failed fetch keeps the prior value and is only an error when nothing is cached.
    #[tracing::instrument(skip(self, fetch_fn), fields(source_id = %source_id, kind = %kind))]
    pub async fn get_or_refresh<F, Fut>(
        &self,
        source_id: &SourceId,
        kind: &ArtifactKind,
        fetch_fn: F,
        ttl: Duration,
    ) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let key = (source_id.clone(), kind.clone());
        let now = self.clock.now();

        // Clone out of the map so no shard lock is held across the fetch.
        let existing = self.entries.get(&key).map(|e| e.clone());
        if let Some(entry) = &existing
            && now - entry.fetched_at <= ttl
        {
            counter!("volley_cache_lookups_total", "result" => "hit").increment(1);
            return Ok(CacheLookup {
                payload: entry.payload.clone(),
                refreshed: false,
                changed: false,
            });
        }

        let fetched = match fetch_fn().await {
            Ok(payload) => payload,
            Err(e) => {
                counter!("volley_cache_lookups_total", "result" => "fetch_error").increment(1);
                return match existing {
                    Some(entry) => {
                        tracing::warn!(error = %e, "Reference fetch failed, keeping cached value");
                        Ok(CacheLookup {
                            payload: entry.payload,
                            refreshed: false,
                            changed: false,
                        })
                    }
                    None => Err(VolleyError::Fetch {
                        source_id: source_id.clone(),
                        kind: kind.clone(),
                        message: e.to_string(),
                    }),
                };
            }
        };

        let hash = content_hash(&fetched);
        let fetched_at = self.clock.now();
        let mut slot = self.entries.entry(key).or_insert_with(|| CacheEntry {
            content_hash: String::new(),
            fetched_at,
            payload: Arc::new(String::new()),
        });

        if !slot.content_hash.is_empty() && slot.content_hash == hash {
            slot.fetched_at = fetched_at;
            counter!("volley_cache_lookups_total", "result" => "confirmed").increment(1);
            tracing::debug!("Reference content unchanged, confirmed fresh");
            return Ok(CacheLookup {
                payload: slot.payload.clone(),
                refreshed: true,
                changed: false,
            });
        }

        let previous_hash = Some(std::mem::take(&mut slot.content_hash)).filter(|h| !h.is_empty());
        let payload = Arc::new(fetched);
        *slot = CacheEntry {
            content_hash: hash.clone(),
            fetched_at,
            payload: payload.clone(),
        };
        drop(slot);

        counter!("volley_cache_lookups_total", "result" => "changed").increment(1);
        tracing::info!(
            previous_hash = previous_hash.as_deref().unwrap_or("none"),
            content_hash = %hash,
            "Reference content changed"
        );
        // No subscribers is fine.
        let _ = self.changes.send(ContentChanged {
            source_id: source_id.clone(),
            kind: kind.clone(),
            previous_hash,
            content_hash: hash,
        });

        Ok(CacheLookup {
            payload,
            refreshed: true,
            changed: true,
        })
    }

    pub fn get(&self, source_id: &SourceId, kind: &ArtifactKind) -> Option<CacheEntry> {
        self.entries
            .get(&(source_id.clone(), kind.clone()))
            .map(|e| e.clone())
    }

    /// Drop every cached artifact of a source.
    pub fn invalidate_source(&self, source_id: &SourceId) {
        self.entries.retain(|(source, _), _| source != source_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;

    fn cache() -> (ContentCache, ManualClock) {
        let clock = ManualClock::default();
        (ContentCache::new(Arc::new(clock.clone())), clock)
    }

    fn fetched(payload: &str) -> impl Future<Output = Result<String>> {
        let payload = payload.to_string();
        async move { Ok(payload) }
    }

    fn fetch_failed() -> impl Future<Output = Result<String>> {
        async { Err(anyhow::anyhow!("upstream timeout").into()) }
    }

    fn ids() -> (SourceId, ArtifactKind) {
        (
            SourceId::from("sheet-a"),
            ArtifactKind::from(ArtifactKind::REFERENCE_TEXT),
        )
    }

    #[tokio::test]
    async fn test_within_ttl_returns_same_payload_and_fetches_once() {
        let (cache, _clock) = cache();
        let (source, kind) = ids();
        let fetches = AtomicUsize::new(0);
        let fetch = || {
            fetches.fetch_add(1, Ordering::SeqCst);
            fetched("chapter one")
        };

        let first = cache
            .get_or_refresh(&source, &kind, fetch, Duration::minutes(60))
            .await
            .unwrap();
        let second = cache
            .get_or_refresh(&source, &kind, fetch, Duration::minutes(60))
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first.payload, &second.payload));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(first.changed);
        assert!(!second.refreshed);
    }

    #[tokio::test]
    async fn test_identical_refetch_after_ttl_only_touches_fetched_at() {
        let (cache, clock) = cache();
        let (source, kind) = ids();
        let mut changes = cache.subscribe();

        let first = cache
            .get_or_refresh(&source, &kind, || fetched("same"), Duration::minutes(60))
            .await
            .unwrap();
        assert!(changes.try_recv().is_ok());
        let before = cache.get(&source, &kind).unwrap();

        clock.advance(Duration::minutes(61));
        let second = cache
            .get_or_refresh(&source, &kind, || fetched("same"), Duration::minutes(60))
            .await
            .unwrap();
        let after = cache.get(&source, &kind).unwrap();

        assert!(second.refreshed);
        assert!(!second.changed);
        assert!(Arc::ptr_eq(&first.payload, &second.payload));
        assert_eq!(before.content_hash, after.content_hash);
        assert_eq!(after.fetched_at - before.fetched_at, Duration::minutes(61));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_changed_content_replaces_and_signals() {
        let (cache, clock) = cache();
        let (source, kind) = ids();
        let mut changes = cache.subscribe();

        cache
            .get_or_refresh(&source, &kind, || fetched("v1"), Duration::minutes(1))
            .await
            .unwrap();
        clock.advance(Duration::minutes(2));
        let lookup = cache
            .get_or_refresh(&source, &kind, || fetched("v2"), Duration::minutes(1))
            .await
            .unwrap();

        assert!(lookup.changed);
        assert_eq!(lookup.payload.as_str(), "v2");
        let first = changes.try_recv().unwrap();
        assert_eq!(first.previous_hash, None);
        let second = changes.try_recv().unwrap();
        assert_eq!(second.previous_hash, Some(content_hash("v1")));
        assert_eq!(second.content_hash, content_hash("v2"));
    }

    #[test_log::test(tokio::test)]
    async fn test_fetch_failure_keeps_prior_value() {
        let (cache, clock) = cache();
        let (source, kind) = ids();
        cache
            .get_or_refresh(&source, &kind, || fetched("v1"), Duration::minutes(1))
            .await
            .unwrap();
        clock.advance(Duration::minutes(5));

        let lookup = cache
            .get_or_refresh(
                &source,
                &kind,
                fetch_failed,
                Duration::minutes(1),
            )
            .await
            .unwrap();
        assert_eq!(lookup.payload.as_str(), "v1");
        assert!(!lookup.refreshed);
        assert_eq!(cache.get(&source, &kind).unwrap().content_hash, content_hash("v1"));
    }

    #[tokio::test]
    async fn test_fetch_failure_without_prior_value_is_error() {
        let (cache, _clock) = cache();
        let (source, kind) = ids();
        let result = cache
            .get_or_refresh(
                &source,
                &kind,
                fetch_failed,
                Duration::minutes(1),
            )
            .await;
        assert!(matches!(result, Err(VolleyError::Fetch { .. })));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_entries_are_per_source_and_kind() {
        let (cache, _clock) = cache();
        let (source, kind) = ids();
        let other = SourceId::from("sheet-b");
        cache
            .get_or_refresh(&source, &kind, || fetched("a"), Duration::hours(1))
            .await
            .unwrap();
        cache
            .get_or_refresh(&other, &kind, || fetched("b"), Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        cache.invalidate_source(&source);
        assert!(cache.get(&source, &kind).is_none());
        assert_eq!(cache.get(&other, &kind).unwrap().payload.as_str(), "b");
    }
}
