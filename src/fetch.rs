//! Reference-fetch interface: loads per-source artifacts that the content cache stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{ArtifactKind, SourceId};
use crate::error::{Result, VolleyError};

#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    /// Fetch the current content of one artifact. May fail transiently.
    async fn fetch(&self, source_id: &SourceId, kind: &ArtifactKind) -> Result<String>;
}

/// Fetcher with no artifacts; every fetch fails. Used when no source declares context artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReferences;

#[async_trait]
impl ReferenceFetcher for NoReferences {
    async fn fetch(&self, source_id: &SourceId, kind: &ArtifactKind) -> Result<String> {
        Err(VolleyError::Fetch {
            source_id: source_id.clone(),
            kind: kind.clone(),
            message: "no reference fetcher configured".to_string(),
        })
    }
}

/// In-memory fetcher for tests. Content can be swapped and failures injected at any time.
#[derive(Clone, Default)]
pub struct MockReferenceFetcher {
    content: Arc<Mutex<HashMap<(SourceId, ArtifactKind), String>>>,
    failing: Arc<Mutex<Option<String>>>,
    fetches: Arc<AtomicUsize>,
}

impl MockReferenceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, source_id: &str, kind: &str, content: &str) {
        self.content
            .lock()
            .insert((source_id.into(), kind.into()), content.to_string());
    }

    /// Make every fetch fail with `message` until [`MockReferenceFetcher::recover`] is called.
    pub fn fail_with(&self, message: &str) {
        *self.failing.lock() = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.failing.lock() = None;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferenceFetcher for MockReferenceFetcher {
    async fn fetch(&self, source_id: &SourceId, kind: &ArtifactKind) -> Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let fetch_error = |message: String| VolleyError::Fetch {
            source_id: source_id.clone(),
            kind: kind.clone(),
            message,
        };
        if let Some(message) = self.failing.lock().clone() {
            return Err(fetch_error(message));
        }
        self.content
            .lock()
            .get(&(source_id.clone(), kind.clone()))
            .cloned()
            .ok_or_else(|| fetch_error("artifact not found".to_string()))
    }
}
