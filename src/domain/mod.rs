//! Core domain types for the scheduling engine.
//!
//! This module contains pure domain types with no I/O:
//! - Items, item keys and item status
//! - Submission units and correlation keys
//! - Batch typestate machine
//! - Source identity and access state

pub mod batch;
pub mod item;
pub mod source;
pub mod unit;

pub use batch::{
    AnyBatch, Batch, BatchData, BatchId, BatchStatus, Completed, Expired, Failed, PollOutcome,
    Polling, Submitted,
};
pub use item::{Item, ItemKey, ItemStatus, RowKey};
pub use source::{ArtifactKind, SourceAccessState, SourceId};
pub use unit::{SubmissionUnit, UnitId};
