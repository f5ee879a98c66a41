//! Error types for sapphire.

use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::ImageEvent;
use crate::models::ImageStatus;

/// Result type alias using sapphire's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for sapphire operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Image not found
    #[error("Image not found: {0}")]
    ImageNotFound(Uuid),

    /// No lifecycle edge exists for the event from the image's current status.
    #[error("Invalid transition for image {image_id}: {event} is not allowed from {from}")]
    InvalidTransition {
        image_id: Uuid,
        from: ImageStatus,
        event: ImageEvent,
    },

    /// A stored submission payload could not be parsed into regions.
    #[error("Malformed submission {annotation_id}: {reason}")]
    MalformedSubmission { annotation_id: Uuid, reason: String },

    /// Qualified submissions for one image disagree on the owning dataset.
    #[error(
        "Inconsistent dataset for image {image_id}: expected {expected}, found {found}"
    )]
    InconsistentDataset {
        image_id: Uuid,
        expected: Uuid,
        found: Uuid,
    },

    /// The image is not in a state that accepts submissions.
    #[error("Image {image_id} does not accept annotations while {status}")]
    NotAnnotatable { image_id: Uuid, status: ImageStatus },

    /// The embedding call for one image did not finish in time.
    #[error("Embedding timed out for image {image_id} after {timeout_secs}s")]
    EmbeddingTimeout { image_id: Uuid, timeout_secs: u64 },

    /// The embedding call for one image failed.
    #[error("Embedding failed for image {image_id}: {reason}")]
    EmbeddingFailure { image_id: Uuid, reason: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error only affects a single item of a batch or aggregation.
    ///
    /// Per-item errors are logged and skipped by the caller; everything else
    /// is returned to the immediate caller.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            Error::MalformedSubmission { .. }
                | Error::EmbeddingTimeout { .. }
                | Error::EmbeddingFailure { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
