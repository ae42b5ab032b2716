//! Tabular source interface: where work items are read from and results written back to.
//!
//! Adapters must report an authorization failure as [`VolleyError::AccessDenied`] (or an
//! error that [`VolleyError::is_access_denied`] recognizes) so the access guard can isolate
//! the source. One row's write failing must not affect writes to other rows.
//!
//! [`VolleyError::AccessDenied`]: crate::error::VolleyError::AccessDenied
//! [`VolleyError::is_access_denied`]: crate::error::VolleyError::is_access_denied

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{Item, RowKey, SourceId};
use crate::error::Result;

pub mod memory;
pub mod tsv;

pub use memory::{MemorySource, RecordedWrite};
pub use tsv::TsvSource;

/// Fields to write back to one row, by column name.
pub type RowFields = BTreeMap<String, String>;

#[async_trait]
pub trait TabularSource: Send + Sync {
    /// Read every row of the source as a pending item, in source order.
    async fn read_items(&self, source_id: &SourceId) -> Result<Vec<Item>>;

    /// Write fields to one row. Returns `false` if the row no longer exists.
    async fn write_result(
        &self,
        source_id: &SourceId,
        row_key: &RowKey,
        fields: &RowFields,
    ) -> Result<bool>;
}
