//! Annotation submission and consensus queries.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use sapphire_core::{
    Annotation, AnnotationRepository, ConsensusResult, Error, ImageLifecycle, NewAnnotation,
    Region, Result,
};

use crate::aggregate::{Aggregator, Evaluation};
use crate::policy::ConsensusPolicy;

/// Entry point for annotators and result consumers.
#[derive(Clone)]
pub struct AnnotationService {
    annotations: Arc<dyn AnnotationRepository>,
    lifecycle: ImageLifecycle,
    aggregator: Aggregator,
}

impl AnnotationService {
    pub fn new(
        annotations: Arc<dyn AnnotationRepository>,
        lifecycle: ImageLifecycle,
        policy: ConsensusPolicy,
    ) -> Self {
        let aggregator = Aggregator::new(annotations.clone(), lifecycle.clone(), policy);
        Self {
            annotations,
            lifecycle,
            aggregator,
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Record one annotator's regions for an image.
    ///
    /// The image must be awaiting labels. Once saved, the submission stands
    /// even if the follow-up quorum evaluation fails.
    pub async fn submit(
        &self,
        image_id: Uuid,
        user_id: Uuid,
        regions: Vec<Region>,
    ) -> Result<Annotation> {
        let image = self
            .lifecycle
            .images()
            .get(image_id)
            .await?
            .ok_or(Error::ImageNotFound(image_id))?;
        if !image.status.accepts_annotations() {
            return Err(Error::NotAnnotatable {
                image_id,
                status: image.status,
            });
        }
        for region in &regions {
            region.validate()?;
        }

        let (delivered, qualified) = self.annotations.count_by_image(image_id).await?;
        let policy = self.aggregator.policy();
        let req = NewAnnotation::from_regions(image_id, image.dataset_id, user_id, &regions)?
            .with_counts(
                to_count(policy.quorum as i64),
                to_count(qualified + 1),
                to_count(delivered + 1),
            );
        let annotation = self.annotations.save(req).await?;
        info!(
            %image_id,
            %user_id,
            annotation_id = %annotation.id,
            regions = regions.len(),
            delivered = annotation.delivered_count,
            "Annotation submitted"
        );

        if policy.evaluate_on_submit {
            match self.aggregator.evaluate(image_id).await {
                Ok(Evaluation::Pending { submitted, required }) => {
                    debug!(%image_id, submitted, required, "Awaiting more submissions")
                }
                Ok(_) => {}
                Err(e) => warn!(%image_id, error = %e, "Consensus evaluation after submit failed"),
            }
        }

        Ok(annotation)
    }

    /// Current consensus for an image. Never changes the image's status.
    pub async fn consensus(&self, image_id: Uuid) -> Result<Option<ConsensusResult>> {
        self.aggregator.aggregate(image_id).await
    }

    /// Every submission made by one annotator, oldest first.
    pub async fn user_annotations(&self, user_id: Uuid) -> Result<Vec<Annotation>> {
        self.annotations.list_by_user(user_id).await
    }
}

fn to_count(n: i64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
