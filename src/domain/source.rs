//! Source identity and per-source access state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one registered source of work (e.g. one spreadsheet or one TSV file).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        SourceId(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        SourceId(s)
    }
}

impl std::ops::Deref for SourceId {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of reference artifact cached per source (reference text, templates, lookup tables).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKind(pub String);

impl ArtifactKind {
    pub const REFERENCE_TEXT: &'static str = "reference_text";
    pub const TEMPLATES: &'static str = "templates";
    pub const REFERENCE_TABLE: &'static str = "reference_table";

    pub fn new(kind: impl Into<String>) -> Self {
        ArtifactKind(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ArtifactKind {
    fn from(s: &str) -> Self {
        ArtifactKind(s.to_string())
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access state of one source as tracked by the access guard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceAccessState {
    /// When set and in the future, the source is excluded from aggregation.
    pub blocked_until: Option<DateTime<Utc>>,
    /// How many denials have been reported for this source since startup.
    pub denials: u32,
}

impl SourceAccessState {
    /// Whether the source is blocked at `now`.
    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until > now)
    }
}
