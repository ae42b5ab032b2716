//! In-memory tabular source for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use super::{RowFields, TabularSource};
use crate::domain::{Item, ItemKey, ItemStatus, RowKey, SourceId};
use crate::error::{Result, VolleyError};

/// Rows held in memory, keyed by source.
///
/// Writes merge into the row's payload; a write to the trigger field also updates the row's
/// trigger, so a written row drops out of later aggregation exactly as it would in a real
/// sheet. Access denials and read/write failures can be injected per source or per row.
#[derive(Clone)]
pub struct MemorySource {
    trigger_field: String,
    rows: Arc<Mutex<HashMap<SourceId, Vec<Item>>>>,
    writes: Arc<Mutex<Vec<RecordedWrite>>>,
    denied: Arc<Mutex<HashSet<SourceId>>>,
    read_failures: Arc<Mutex<HashMap<SourceId, String>>>,
    write_failures: Arc<Mutex<HashSet<ItemKey>>>,
    reads: Arc<Mutex<HashMap<SourceId, usize>>>,
    write_gate: Arc<RwLock<()>>,
}

/// Record of one successful `write_result` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub source_id: SourceId,
    pub row_key: RowKey,
    pub fields: RowFields,
}

impl MemorySource {
    pub fn new(trigger_field: &str) -> Self {
        Self {
            trigger_field: trigger_field.to_string(),
            rows: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
            denied: Arc::new(Mutex::new(HashSet::new())),
            read_failures: Arc::new(Mutex::new(HashMap::new())),
            write_failures: Arc::new(Mutex::new(HashSet::new())),
            reads: Arc::new(Mutex::new(HashMap::new())),
            write_gate: Arc::new(RwLock::new(())),
        }
    }

    /// Append a row to a source.
    pub fn push(&self, item: Item) {
        self.rows
            .lock()
            .entry(item.source_id.clone())
            .or_default()
            .push(item);
    }

    /// Add `count` rows with the given trigger, keyed `2..` like sheet rows under a header.
    pub fn add_rows(&self, source_id: &str, count: usize, trigger: Option<&str>) {
        for row in 0..count {
            self.push(Item::pending(source_id, row + 2, trigger).with_field("Ref", &format!("1:{}", row + 1)));
        }
    }

    pub fn deny(&self, source_id: &str) {
        self.denied.lock().insert(source_id.into());
    }

    pub fn allow(&self, source_id: &str) {
        self.denied.lock().remove(&SourceId::from(source_id));
    }

    pub fn fail_reads(&self, source_id: &str, message: &str) {
        self.read_failures
            .lock()
            .insert(source_id.into(), message.to_string());
    }

    pub fn restore_reads(&self, source_id: &str) {
        self.read_failures.lock().remove(&SourceId::from(source_id));
    }

    pub fn fail_write(&self, source_id: &str, row_key: &str) {
        self.write_failures
            .lock()
            .insert(ItemKey::new(source_id, row_key));
    }

    /// Block every `write_result` call until the returned guard is dropped.
    /// `None` if writes are already held.
    pub fn hold_writes(&self) -> Option<OwnedRwLockWriteGuard<()>> {
        self.write_gate.clone().try_write_owned().ok()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    pub fn writes_for(&self, source_id: &str) -> Vec<RecordedWrite> {
        self.writes
            .lock()
            .iter()
            .filter(|w| w.source_id.0 == source_id)
            .cloned()
            .collect()
    }

    pub fn read_count(&self, source_id: &str) -> usize {
        self.reads
            .lock()
            .get(&SourceId::from(source_id))
            .copied()
            .unwrap_or(0)
    }

    /// Current content of a row.
    pub fn row(&self, source_id: &str, row_key: &str) -> Option<Item> {
        self.rows
            .lock()
            .get(&SourceId::from(source_id))?
            .iter()
            .find(|item| item.row_key.0 == row_key)
            .cloned()
    }

    fn check_access(&self, source_id: &SourceId) -> Result<()> {
        if self.denied.lock().contains(source_id) {
            return Err(VolleyError::AccessDenied {
                source_id: source_id.clone(),
                message: "The caller does not have permission".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new("Go?")
    }
}

#[async_trait]
impl TabularSource for MemorySource {
    async fn read_items(&self, source_id: &SourceId) -> Result<Vec<Item>> {
        *self.reads.lock().entry(source_id.clone()).or_default() += 1;
        self.check_access(source_id)?;
        if let Some(message) = self.read_failures.lock().get(source_id) {
            return Err(VolleyError::SourceUnavailable {
                source_id: source_id.clone(),
                message: message.clone(),
            });
        }
        let items = self
            .rows
            .lock()
            .get(source_id)
            .map(|rows| {
                rows.iter()
                    .cloned()
                    .map(|mut item| {
                        item.status = ItemStatus::Pending;
                        item
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(items)
    }

    async fn write_result(
        &self,
        source_id: &SourceId,
        row_key: &RowKey,
        fields: &RowFields,
    ) -> Result<bool> {
        let _gate = self.write_gate.read().await;
        self.check_access(source_id)?;
        if self
            .write_failures
            .lock()
            .contains(&ItemKey::new(source_id.clone(), row_key.clone()))
        {
            return Err(VolleyError::SourceUnavailable {
                source_id: source_id.clone(),
                message: format!("write to row {row_key} failed"),
            });
        }

        let mut rows = self.rows.lock();
        let Some(item) = rows
            .get_mut(source_id)
            .and_then(|rows| rows.iter_mut().find(|item| &item.row_key == row_key))
        else {
            return Ok(false);
        };
        for (name, value) in fields {
            if *name == self.trigger_field {
                item.trigger = Some(value.clone());
            } else {
                item.payload.insert(name.clone(), value.clone());
            }
        }
        drop(rows);

        self.writes.lock().push(RecordedWrite {
            source_id: source_id.clone(),
            row_key: row_key.clone(),
            fields: fields.clone(),
        });
        Ok(true)
    }
}
