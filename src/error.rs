//! Error types for the scheduling engine.

use thiserror::Error;

use crate::domain::{ArtifactKind, BatchId, SourceId};

/// Result type alias using the volley error type.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Phrases that identify an authorization failure in an otherwise opaque error message.
const ACCESS_DENIED_PHRASES: &[&str] = &[
    "permission",
    "forbidden",
    "access denied",
    "insufficient permissions",
    "the caller does not have permission",
];

/// Main error type for the scheduling engine.
#[derive(Error, Debug)]
pub enum VolleyError {
    /// The source refused the call (revoked share, missing scope, ...).
    #[error("Access denied for source {source_id}: {message}")]
    AccessDenied { source_id: SourceId, message: String },

    /// The source could not be read or written for a non-authorization reason
    #[error("Source {source_id} unavailable: {message}")]
    SourceUnavailable { source_id: SourceId, message: String },

    /// The inference backend rejected a batch submission
    #[error("Batch submission failed: {0}")]
    Submission(String),

    /// The inference backend has no batch with this id
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// A reference artifact could not be fetched
    #[error("Fetching {kind} for source {source_id} failed: {message}")]
    Fetch {
        source_id: SourceId,
        kind: ArtifactKind,
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Daemon is shutting down
    #[error("Daemon is shutting down")]
    Shutdown,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VolleyError {
    /// Whether this error means the caller is not authorized for the source.
    ///
    /// Adapters should return [`VolleyError::AccessDenied`] directly, but errors that
    /// arrive wrapped (e.g. through `anyhow`) are classified by their message.
    pub fn is_access_denied(&self) -> bool {
        match self {
            VolleyError::AccessDenied { .. } => true,
            VolleyError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => true,
            VolleyError::Other(_) | VolleyError::SourceUnavailable { .. } | VolleyError::Fetch { .. } => {
                let message = self.to_string().to_lowercase();
                ACCESS_DENIED_PHRASES
                    .iter()
                    .any(|phrase| message.contains(phrase))
            }
            _ => false,
        }
    }
}
