//! Image processing lifecycle.
//!
//! The state machine every image follows from registration to a terminal
//! status. All status changes go through [`ImageLifecycle::transition`], which
//! applies exactly one compare-and-swap write per call so the scheduler and
//! the aggregator can race on the same image without losing updates.
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Unembedded | `Claim` | Embedding |
//! | Embedding | `EmbeddingSucceeded` | Ready |
//! | Embedding | `EmbeddingFailed` | Unembedded |
//! | Embedding | `EmbeddingAbandoned` | AnnotationFailed |
//! | Ready, ReAnnotation | `ConsensusAccepted` | Annotated |
//! | Ready, ReAnnotation | `ConsensusRejected` | ReAnnotation |

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Image, ImageStatus, NewImage, StatusFilter};
use crate::traits::ImageRepository;

/// Something that happened to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageEvent {
    /// The embedding scheduler claimed the image for a batch.
    Claim,
    /// The embedding was computed and stored.
    EmbeddingSucceeded,
    /// The embedding failed; the image goes back for another attempt.
    EmbeddingFailed,
    /// The embedding failed for the last allowed time.
    EmbeddingAbandoned,
    /// Quorum reached and the consensus was accepted.
    ConsensusAccepted,
    /// Quorum reached but the consensus was rejected.
    ConsensusRejected,
}

impl ImageEvent {
    /// Statuses this event may be applied from.
    pub fn sources(&self) -> &'static [ImageStatus] {
        match self {
            ImageEvent::Claim => &[ImageStatus::Unembedded],
            ImageEvent::EmbeddingSucceeded
            | ImageEvent::EmbeddingFailed
            | ImageEvent::EmbeddingAbandoned => &[ImageStatus::Embedding],
            ImageEvent::ConsensusAccepted | ImageEvent::ConsensusRejected => {
                &[ImageStatus::Ready, ImageStatus::ReAnnotation]
            }
        }
    }

    /// Status the image ends up in after this event.
    pub fn target(&self) -> ImageStatus {
        match self {
            ImageEvent::Claim => ImageStatus::Embedding,
            ImageEvent::EmbeddingSucceeded => ImageStatus::Ready,
            ImageEvent::EmbeddingFailed => ImageStatus::Unembedded,
            ImageEvent::EmbeddingAbandoned => ImageStatus::AnnotationFailed,
            ImageEvent::ConsensusAccepted => ImageStatus::Annotated,
            ImageEvent::ConsensusRejected => ImageStatus::ReAnnotation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageEvent::Claim => "claim",
            ImageEvent::EmbeddingSucceeded => "embedding_succeeded",
            ImageEvent::EmbeddingFailed => "embedding_failed",
            ImageEvent::EmbeddingAbandoned => "embedding_abandoned",
            ImageEvent::ConsensusAccepted => "consensus_accepted",
            ImageEvent::ConsensusRejected => "consensus_rejected",
        }
    }
}

impl fmt::Display for ImageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Look up the edge for `event` leaving `from`.
pub fn next_status(from: ImageStatus, event: ImageEvent) -> Option<ImageStatus> {
    event
        .sources()
        .contains(&from)
        .then(|| event.target())
}

/// Result of a successful transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// This call wrote the new status.
    Applied { from: ImageStatus, to: ImageStatus },
    /// The image was already in the event's target status; nothing written.
    AlreadyInState(ImageStatus),
}

impl TransitionOutcome {
    /// Whether this call performed the write.
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Applies lifecycle transitions against the image store.
#[derive(Clone)]
pub struct ImageLifecycle {
    images: Arc<dyn ImageRepository>,
}

impl ImageLifecycle {
    pub fn new(images: Arc<dyn ImageRepository>) -> Self {
        Self { images }
    }

    /// The underlying image store.
    pub fn images(&self) -> &Arc<dyn ImageRepository> {
        &self.images
    }

    /// Apply `event` to an image.
    ///
    /// Retrying an event whose target the image already holds is
    /// [`TransitionOutcome::AlreadyInState`]. A missing edge is
    /// [`Error::InvalidTransition`] and leaves the stored status unchanged.
    pub async fn transition(&self, image_id: Uuid, event: ImageEvent) -> Result<TransitionOutcome> {
        let image = self
            .images
            .get(image_id)
            .await?
            .ok_or(Error::ImageNotFound(image_id))?;
        let from = image.status;

        let to = match next_status(from, event) {
            Some(to) => to,
            None if from == event.target() => {
                debug!(%image_id, %event, status = %from, "Event already applied");
                return Ok(TransitionOutcome::AlreadyInState(from));
            }
            None => {
                return Err(Error::InvalidTransition {
                    image_id,
                    from,
                    event,
                })
            }
        };

        if from == to {
            return Ok(TransitionOutcome::AlreadyInState(to));
        }

        if self.images.update_status(image_id, from, to).await? {
            debug!(%image_id, %event, %from, %to, "Image transitioned");
            return Ok(TransitionOutcome::Applied { from, to });
        }

        // Lost the race: someone moved the image between our read and write.
        let current = self
            .images
            .get(image_id)
            .await?
            .ok_or(Error::ImageNotFound(image_id))?
            .status;
        if current == to {
            debug!(%image_id, %event, status = %current, "Concurrent caller applied the same transition");
            Ok(TransitionOutcome::AlreadyInState(current))
        } else {
            Err(Error::InvalidTransition {
                image_id,
                from: current,
                event,
            })
        }
    }

    /// Register a new image in `Unembedded`.
    pub async fn register(&self, dataset_id: Uuid, url: &str) -> Result<Image> {
        validate_url(url)?;
        let image = self
            .images
            .insert(NewImage {
                dataset_id,
                url: url.to_string(),
            })
            .await?;
        debug!(image_id = %image.id, %dataset_id, "Image registered");
        Ok(image)
    }

    /// Register several images for one dataset.
    pub async fn register_batch(&self, dataset_id: Uuid, urls: &[String]) -> Result<Vec<Image>> {
        for url in urls {
            validate_url(url)?;
        }
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let reqs = urls
            .iter()
            .map(|url| NewImage {
                dataset_id,
                url: url.clone(),
            })
            .collect();
        let images = self.images.insert_bulk(reqs).await?;
        info!(%dataset_id, count = images.len(), "Images registered");
        Ok(images)
    }

    /// Return images stranded in `Embedding` to `Unembedded`.
    ///
    /// Only safe while no embedding batch is running anywhere. The attempt
    /// counter is left untouched. Returns how many images were recovered.
    pub async fn recover_stale_claims(&self, dataset_id: Option<Uuid>, limit: i64) -> Result<usize> {
        let stale = self
            .images
            .list_by_status(dataset_id, StatusFilter::Only(ImageStatus::Embedding), limit)
            .await?;

        let mut recovered = 0;
        for image in stale {
            match self.transition(image.id, ImageEvent::EmbeddingFailed).await {
                Ok(outcome) if outcome.is_applied() => recovered += 1,
                Ok(_) => {}
                Err(e) => warn!(image_id = %image.id, error = %e, "Failed to recover stale claim"),
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered images stranded in embedding");
        }
        Ok(recovered)
    }
}

fn validate_url(url: &str) -> Result<()> {
    if url.trim().is_empty() {
        return Err(Error::InvalidInput("image url must not be empty".to_string()));
    }
    Ok(())
}
