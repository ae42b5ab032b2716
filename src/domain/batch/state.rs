//! Batch types using the typestate pattern.
//!
//! A batch is one outstanding call to the inference backend. Each batch progresses
//! through distinct states, enforced at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::source::SourceId;
use crate::domain::unit::SubmissionUnit;
use crate::inference::ItemResult;

/// Identifier assigned to a batch by the inference backend.
///
/// This is the only externally visible handle of a batch, and the key used for
/// out-of-band recovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        BatchId(s.to_string())
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        BatchId(s)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marker trait for valid batch states.
pub trait BatchState: Send + Sync {}

/// A batch in the lifecycle, parameterized by its current state.
#[derive(Debug, Clone, Serialize)]
pub struct Batch<T: BatchState> {
    /// The current state of the batch.
    pub state: T,
    /// Data that stays fixed from submission to a terminal state.
    pub data: BatchData,
}

/// Immutable batch data.
#[derive(Debug, Clone, Serialize)]
pub struct BatchData {
    pub batch_id: BatchId,
    /// The unit this batch was created from.
    pub unit: SubmissionUnit,
    pub submitted_at: DateTime<Utc>,
}

impl BatchData {
    pub fn source_id(&self) -> &SourceId {
        self.unit.source_id()
    }
}

// ============================================================================
// Batch States
// ============================================================================

/// Accepted by the backend, not yet tracked for polling.
#[derive(Debug, Clone, Serialize)]
pub struct Submitted {}

impl BatchState for Submitted {}

/// Tracked in the active set and polled on every due tick.
#[derive(Debug, Clone, Serialize)]
pub struct Polling {
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Number of polls answered so far.
    pub polls: u32,
}

impl BatchState for Polling {}

/// The backend reported all results ready.
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub completed_at: DateTime<Utc>,
    pub results: Vec<ItemResult>,
}

impl BatchState for Completed {}

/// The backend reported the batch itself failed.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

impl BatchState for Failed {}

/// The batch exceeded its maximum age without resolving.
#[derive(Debug, Clone, Serialize)]
pub struct Expired {
    pub expired_at: DateTime<Utc>,
    pub age_secs: i64,
}

impl BatchState for Expired {}

// ============================================================================
// Unified Representation
// ============================================================================

/// Batch status for reporting (includes `Queued`, which has no batch id yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Queued,
    Submitted,
    Polling,
    Completed,
    Failed,
    Expired,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Submitted => "submitted",
            BatchStatus::Polling => "polling",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Expired
        )
    }
}

/// Enum that can hold a batch in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "batch")]
pub enum AnyBatch {
    Submitted(Batch<Submitted>),
    Polling(Batch<Polling>),
    Completed(Batch<Completed>),
    Failed(Batch<Failed>),
    Expired(Batch<Expired>),
}

impl AnyBatch {
    pub fn data(&self) -> &BatchData {
        match self {
            AnyBatch::Submitted(b) => &b.data,
            AnyBatch::Polling(b) => &b.data,
            AnyBatch::Completed(b) => &b.data,
            AnyBatch::Failed(b) => &b.data,
            AnyBatch::Expired(b) => &b.data,
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.data().batch_id
    }

    pub fn status(&self) -> BatchStatus {
        match self {
            AnyBatch::Submitted(_) => BatchStatus::Submitted,
            AnyBatch::Polling(_) => BatchStatus::Polling,
            AnyBatch::Completed(_) => BatchStatus::Completed,
            AnyBatch::Failed(_) => BatchStatus::Failed,
            AnyBatch::Expired(_) => BatchStatus::Expired,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

impl From<Batch<Submitted>> for AnyBatch {
    fn from(b: Batch<Submitted>) -> Self {
        AnyBatch::Submitted(b)
    }
}

impl From<Batch<Polling>> for AnyBatch {
    fn from(b: Batch<Polling>) -> Self {
        AnyBatch::Polling(b)
    }
}

impl From<Batch<Completed>> for AnyBatch {
    fn from(b: Batch<Completed>) -> Self {
        AnyBatch::Completed(b)
    }
}

impl From<Batch<Failed>> for AnyBatch {
    fn from(b: Batch<Failed>) -> Self {
        AnyBatch::Failed(b)
    }
}

impl From<Batch<Expired>> for AnyBatch {
    fn from(b: Batch<Expired>) -> Self {
        AnyBatch::Expired(b)
    }
}

/// Result of feeding one poll response into a polling batch.
#[derive(Debug)]
pub enum PollOutcome {
    /// Still in progress; the batch stays in the active set.
    InProgress(Batch<Polling>),
    Completed(Batch<Completed>),
    Failed(Batch<Failed>),
    Expired(Batch<Expired>),
}

impl PollOutcome {
    pub fn batch_id(&self) -> &BatchId {
        match self {
            PollOutcome::InProgress(b) => &b.data.batch_id,
            PollOutcome::Completed(b) => &b.data.batch_id,
            PollOutcome::Failed(b) => &b.data.batch_id,
            PollOutcome::Expired(b) => &b.data.batch_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollOutcome::InProgress(_))
    }
}

impl From<PollOutcome> for AnyBatch {
    fn from(outcome: PollOutcome) -> Self {
        match outcome {
            PollOutcome::InProgress(b) => b.into(),
            PollOutcome::Completed(b) => b.into(),
            PollOutcome::Failed(b) => b.into(),
            PollOutcome::Expired(b) => b.into(),
        }
    }
}
