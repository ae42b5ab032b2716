//! Submission units: fixed-size groups of items sent together in one batch call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::item::{Item, ItemKey, ItemStatus};
use super::source::SourceId;

/// Maximum length of a correlation key accepted by batch inference backends.
const MAX_CORRELATION_KEY_LEN: usize = 64;

/// Unique identifier for a submission unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct UnitId(pub Uuid);

impl From<Uuid> for UnitId {
    fn from(uuid: Uuid) -> Self {
        UnitId(uuid)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A group of at most `unit_size` items from a single source.
///
/// Every item carries an explicit correlation key that is sent with its request, so
/// results are matched back by key and never by position.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionUnit {
    id: UnitId,
    source_id: SourceId,
    items: Vec<Item>,
    correlation_keys: Vec<String>,
    created_at: DateTime<Utc>,
}

impl SubmissionUnit {
    /// Build a unit from items that all belong to `source_id`.
    ///
    /// Items are moved into the `Claimed` status; the caller is expected to hold their claims.
    pub fn new(source_id: SourceId, items: Vec<Item>, created_at: DateTime<Utc>) -> Self {
        debug_assert!(items.iter().all(|item| item.source_id == source_id));
        let correlation_keys = items
            .iter()
            .enumerate()
            .map(|(index, item)| correlation_key(index, &item.row_key.0))
            .collect();
        let items = items
            .into_iter()
            .map(|mut item| {
                item.status = ItemStatus::Claimed;
                item
            })
            .collect();
        Self {
            id: UnitId::from(Uuid::new_v4()),
            source_id,
            items,
            correlation_keys,
            created_at,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn keys(&self) -> Vec<ItemKey> {
        self.items.iter().map(Item::key).collect()
    }

    /// Items paired with the correlation key they are submitted under.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Item)> {
        self.correlation_keys
            .iter()
            .map(String::as_str)
            .zip(self.items.iter())
    }

    /// Look up the originating item for a correlation key returned by the backend.
    pub fn item_for(&self, correlation_key: &str) -> Option<&Item> {
        self.correlation_keys
            .iter()
            .position(|key| key == correlation_key)
            .map(|index| &self.items[index])
    }

    /// Record a status change on every member item (used once the unit is handed off).
    pub(crate) fn set_status(&mut self, status: ItemStatus) {
        for item in &mut self.items {
            item.status = status;
        }
    }

    /// Keep only the items whose keys satisfy `keep`, recomputing correlation keys.
    pub(crate) fn retain(self, keep: impl Fn(&ItemKey) -> bool) -> Self {
        let items: Vec<Item> = self
            .items
            .into_iter()
            .filter(|item| keep(&item.key()))
            .collect();
        let mut unit = SubmissionUnit::new(self.source_id, items, self.created_at);
        unit.id = self.id;
        unit
    }
}

/// Build the correlation key for the item at `index`: `item_<index>_<row>`, restricted
/// to `[A-Za-z0-9_-]` and 64 characters.
fn correlation_key(index: usize, row_key: &str) -> String {
    let sanitized: String = row_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut key = format!("item_{index}_{sanitized}");
    key.truncate(MAX_CORRELATION_KEY_LEN);
    key
}
