//! Plain-text result archive for a dataset.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use sapphire_core::{AnnotationRepository, Error, Image, ImageRepository, Result};

use crate::aggregate::Aggregator;

/// Renders every submission and consensus in a dataset as text lines.
#[derive(Clone)]
pub struct ResultExporter {
    images: Arc<dyn ImageRepository>,
    annotations: Arc<dyn AnnotationRepository>,
    aggregator: Aggregator,
}

impl ResultExporter {
    pub fn new(
        images: Arc<dyn ImageRepository>,
        annotations: Arc<dyn AnnotationRepository>,
        aggregator: Aggregator,
    ) -> Self {
        Self {
            images,
            annotations,
            aggregator,
        }
    }

    /// Build the archive: one line per submission, then one `consensus`
    /// line per image that has a consensus.
    pub async fn export_dataset(&self, dataset_id: Uuid) -> Result<String> {
        let annotations = self.annotations.list_by_dataset(dataset_id).await?;

        let mut image_ids: Vec<Uuid> = Vec::new();
        for a in &annotations {
            if !image_ids.contains(&a.image_id) {
                image_ids.push(a.image_id);
            }
        }
        let images: HashMap<Uuid, Image> = self
            .images
            .get_many(&image_ids)
            .await?
            .into_iter()
            .map(|img| (img.id, img))
            .collect();
        let image_url = |id: &Uuid| images.get(id).map(|img| img.url.as_str()).unwrap_or("");

        let mut out = String::new();
        for a in &annotations {
            writeln!(
                out,
                "id: {}, content: {}, deliveredCount: {}, qualifiedCount: {}, replicaCount: {}, qualified: {}, imageUrl: {}",
                a.id,
                a.content,
                a.delivered_count,
                a.qualified_count,
                a.replica_count,
                a.is_qualified,
                image_url(&a.image_id),
            )
            .map_err(|e| Error::Internal(e.to_string()))?;
        }

        let mut consensus_lines = 0;
        for image_id in &image_ids {
            let Some(result) = self.aggregator.aggregate(*image_id).await? else {
                continue;
            };
            writeln!(
                out,
                "consensus: imageId: {}, content: {}, contributors: {}, imageUrl: {}",
                image_id,
                result.content()?,
                result.qualified_count,
                image_url(image_id),
            )
            .map_err(|e| Error::Internal(e.to_string()))?;
            consensus_lines += 1;
        }

        info!(
            %dataset_id,
            submissions = annotations.len(),
            consensus_lines,
            "Dataset results exported"
        );
        Ok(out)
    }
}
