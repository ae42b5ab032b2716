//! Batch inference backend abstraction.
//!
//! This module defines the `InferenceClient` trait used by the scheduler to create
//! batches and by the lifecycle manager to poll them, enabling testability with mock
//! implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactKind, BatchId, SubmissionUnit};
use crate::error::Result;

pub mod anthropic;
pub mod mock;

pub use anthropic::{AnthropicBatchClient, PromptFn, default_prompt};
pub use mock::{MockInferenceClient, MockSubmission};

/// Reference content shared by every request in a batch (e.g. reference text for the
/// items' book). Backends may mark it cacheable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedContext {
    pub kind: ArtifactKind,
    pub content: Arc<String>,
}

/// Everything needed for one "create batch" call.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub unit: &'a SubmissionUnit,
    pub context: &'a [SharedContext],
}

/// Status reported by the backend for a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    InProgress,
    /// All results are ready.
    Ended,
    /// The batch as a whole failed (distinct from per-item errors).
    Failed { reason: String },
}

/// Outcome of a single item inside an ended batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ItemOutcome {
    Output(String),
    Error(String),
}

/// One result line, matched to its item by correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub correlation_key: String,
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn output(correlation_key: &str, text: &str) -> Self {
        Self {
            correlation_key: correlation_key.to_string(),
            outcome: ItemOutcome::Output(text.to_string()),
        }
    }

    pub fn error(correlation_key: &str, message: &str) -> Self {
        Self {
            correlation_key: correlation_key.to_string(),
            outcome: ItemOutcome::Error(message.to_string()),
        }
    }
}

/// Response to a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPoll {
    pub status: PollStatus,
    /// Present once the status is `Ended`.
    pub results: Option<Vec<ItemResult>>,
}

impl BatchPoll {
    pub fn in_progress() -> Self {
        Self {
            status: PollStatus::InProgress,
            results: None,
        }
    }

    pub fn ended(results: Vec<ItemResult>) -> Self {
        Self {
            status: PollStatus::Ended,
            results: Some(results),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: PollStatus::Failed {
                reason: reason.into(),
            },
            results: None,
        }
    }
}

/// Trait for talking to an asynchronous batch inference API.
///
/// Implementations must tolerate `poll` being called many times for the same batch.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Create one batch for the unit and return the backend's batch id.
    ///
    /// Exactly one backend "create" call per invocation.
    async fn submit(&self, request: BatchRequest<'_>) -> Result<BatchId>;

    /// Fetch the batch's status, and its results once it has ended.
    async fn poll(&self, batch_id: &BatchId) -> Result<BatchPoll>;
}
