//! Core traits for sapphire abstractions.
//!
//! These traits define the interfaces that store and embedding
//! implementations must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// IMAGE REPOSITORY
// =============================================================================

/// Durable image records.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Register a new image in `Unembedded`.
    async fn insert(&self, req: NewImage) -> Result<Image>;

    /// Register several images of one dataset in a single transaction.
    async fn insert_bulk(&self, reqs: Vec<NewImage>) -> Result<Vec<Image>>;

    /// Fetch an image by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Image>>;

    /// Fetch several images by ID. Missing IDs are skipped.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Image>>;

    /// List images by status, oldest first.
    ///
    /// `dataset_id = None` lists across all datasets.
    async fn list_by_status(
        &self,
        dataset_id: Option<Uuid>,
        filter: StatusFilter,
        limit: i64,
    ) -> Result<Vec<Image>>;

    /// Compare-and-swap the status.
    ///
    /// Writes `to` only if the stored status is still `from`. Returns whether
    /// the write happened; `false` means another caller got there first (or
    /// the image does not exist).
    async fn update_status(&self, id: Uuid, from: ImageStatus, to: ImageStatus) -> Result<bool>;

    /// Record the location of a computed embedding.
    async fn set_embedding_url(&self, id: Uuid, url: &str) -> Result<()>;

    /// Increment the failed-attempt counter, returning the new count.
    async fn record_embedding_failure(&self, id: Uuid) -> Result<i32>;
}

// =============================================================================
// ANNOTATION REPOSITORY
// =============================================================================

/// Durable annotation submissions.
#[async_trait]
pub trait AnnotationRepository: Send + Sync {
    /// Persist a submission.
    async fn save(&self, req: NewAnnotation) -> Result<Annotation>;

    /// Fetch a submission by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Annotation>>;

    /// All submissions for an image, oldest first.
    async fn list_by_image(&self, image_id: Uuid) -> Result<Vec<Annotation>>;

    /// All submissions made by a user, oldest first.
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Annotation>>;

    /// All submissions in a dataset, oldest first.
    async fn list_by_dataset(&self, dataset_id: Uuid) -> Result<Vec<Annotation>>;

    /// Count submissions for an image, returning `(total, qualified)`.
    async fn count_by_image(&self, image_id: Uuid) -> Result<(i64, i64)>;

    /// Set the quality-control flag on a submission.
    async fn set_qualified(&self, id: Uuid, is_qualified: bool) -> Result<()>;
}

// =============================================================================
// EMBEDDING BACKEND
// =============================================================================

/// External service that computes an image embedding.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Compute the embedding for an image and return where it was stored.
    async fn embed(&self, image: &Image) -> Result<String>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}
