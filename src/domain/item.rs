//! Work items read from a source.
//!
//! The source owns an item; the engine only holds a transient projection of it while
//! the item is claimed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::source::SourceId;

/// Stable identifier of a row within its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub String);

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        RowKey(s.to_string())
    }
}

impl From<String> for RowKey {
    fn from(s: String) -> Self {
        RowKey(s)
    }
}

impl From<usize> for RowKey {
    fn from(row: usize) -> Self {
        RowKey(row.to_string())
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique key of an item: its source plus its row key.
///
/// This is what the in-flight tracker claims, so equal row keys in two different
/// sources never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ItemKey {
    pub source_id: SourceId,
    pub row_key: RowKey,
}

impl ItemKey {
    pub fn new(source_id: impl Into<SourceId>, row_key: impl Into<RowKey>) -> Self {
        Self {
            source_id: source_id.into(),
            row_key: row_key.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_id, self.row_key)
    }
}

/// Processing status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Claimed,
    Submitted,
    Completed,
    FailedRetryable,
    FailedPermanent,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Submitted => "submitted",
            ItemStatus::Completed => "completed",
            ItemStatus::FailedRetryable => "failed_retryable",
            ItemStatus::FailedPermanent => "failed_permanent",
        }
    }

    /// Terminal outcomes release the item's claim.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::FailedRetryable | ItemStatus::FailedPermanent
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub source_id: SourceId,
    pub row_key: RowKey,
    /// Value of the source's trigger column; `None` or blank means "not requested".
    pub trigger: Option<String>,
    /// Fields needed to build the inference request.
    pub payload: BTreeMap<String, String>,
    pub status: ItemStatus,
}

impl Item {
    /// Create a pending item with an empty payload.
    pub fn pending(
        source_id: impl Into<SourceId>,
        row_key: impl Into<RowKey>,
        trigger: Option<&str>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            row_key: row_key.into(),
            trigger: trigger.map(str::to_string),
            payload: BTreeMap::new(),
            status: ItemStatus::Pending,
        }
    }

    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.payload.insert(name.to_string(), value.to_string());
        self
    }

    pub fn key(&self) -> ItemKey {
        ItemKey {
            source_id: self.source_id.clone(),
            row_key: self.row_key.clone(),
        }
    }

    /// The trimmed trigger value, if any non-blank value is present.
    pub fn trigger_value(&self) -> Option<&str> {
        self.trigger
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}
