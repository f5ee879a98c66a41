//! Consensus aggregation over annotator submissions.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use sapphire_core::{
    Annotation, AnnotationRepository, ConsensusResult, Error, ImageEvent, ImageLifecycle,
    ImageStatus, Region, Result,
};

use crate::policy::ConsensusPolicy;

/// Merge region lists index-wise into their arithmetic mean.
///
/// Only the first `min(len)` regions of each list are merged; the second
/// element of the result counts the trailing regions that were dropped.
/// Returns `None` when there are no lists at all.
pub fn aggregate_regions(submissions: &[Vec<Region>]) -> Option<(Vec<Region>, usize)> {
    let common = submissions.iter().map(Vec::len).min()?;
    let truncated: usize = submissions.iter().map(|s| s.len() - common).sum();
    let n = submissions.len() as f64;

    let merged: Vec<Region> = (0..common)
        .map(|k| {
            let (cx, cy, w, h) = submissions.iter().map(|s| s[k]).fold(
                (0.0, 0.0, 0.0, 0.0),
                |(cx, cy, w, h), r| {
                    (
                        cx + r.center_x,
                        cy + r.center_y,
                        w + r.width,
                        h + r.height,
                    )
                },
            );
            Region::new(cx / n, cy / n, w / n, h / n)
        })
        .collect();

    debug!(
        submissions = submissions.len(),
        merged_regions = merged.len(),
        truncated_regions = truncated,
        "Region aggregation complete"
    );

    Some((merged, truncated))
}

/// Outcome of a quorum evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The image is not waiting for labels.
    NotEligible { status: ImageStatus },
    /// Quorum not reached yet.
    Pending { submitted: usize, required: usize },
    /// Quorum reached but the submissions disagree; the image goes back for
    /// more labels.
    Rejected { reason: String },
    /// Quorum reached and the consensus was accepted.
    Accepted(ConsensusResult),
}

/// Contributing submissions and the consensus built from them.
struct Collected {
    result: ConsensusResult,
    contributors: Vec<(Uuid, Vec<Region>)>,
}

/// Reconciles the submissions for an image into one label.
#[derive(Clone)]
pub struct Aggregator {
    annotations: Arc<dyn AnnotationRepository>,
    lifecycle: ImageLifecycle,
    policy: ConsensusPolicy,
}

impl Aggregator {
    pub fn new(
        annotations: Arc<dyn AnnotationRepository>,
        lifecycle: ImageLifecycle,
        policy: ConsensusPolicy,
    ) -> Self {
        Self {
            annotations,
            lifecycle,
            policy,
        }
    }

    pub fn policy(&self) -> &ConsensusPolicy {
        &self.policy
    }

    /// Compute the consensus for an image without changing its status.
    ///
    /// Returns `None` when there is nothing qualified and parseable to merge.
    pub async fn aggregate(&self, image_id: Uuid) -> Result<Option<ConsensusResult>> {
        let annotations = self.annotations.list_by_image(image_id).await?;
        Ok(self.collect(image_id, annotations)?.map(|c| c.result))
    }

    /// Check quorum and, once reached, accept or reject the consensus.
    ///
    /// A `Ready` image is judged on all of its submissions. An image in
    /// `ReAnnotation` is judged on its latest `quorum` submissions only, so
    /// enough agreeing new labels close it even when earlier ones disagreed.
    ///
    /// The resulting status change goes through the lifecycle, so concurrent
    /// evaluations of one image apply at most one transition each.
    #[instrument(skip(self), fields(subsystem = "consensus"))]
    pub async fn evaluate(&self, image_id: Uuid) -> Result<Evaluation> {
        let image = self
            .lifecycle
            .images()
            .get(image_id)
            .await?
            .ok_or(Error::ImageNotFound(image_id))?;
        if !image.status.accepts_annotations() {
            debug!(%image_id, status = %image.status, "Image not awaiting consensus");
            return Ok(Evaluation::NotEligible {
                status: image.status,
            });
        }

        let mut annotations = self.annotations.list_by_image(image_id).await?;
        let submitted = annotations.len();
        if submitted < self.policy.quorum {
            debug!(%image_id, submitted, required = self.policy.quorum, "Quorum not reached");
            return Ok(Evaluation::Pending {
                submitted,
                required: self.policy.quorum,
            });
        }

        if image.status == ImageStatus::ReAnnotation {
            let superseded = submitted - self.policy.quorum;
            annotations.drain(..superseded);
            debug!(%image_id, superseded, window = annotations.len(), "Judging latest submissions");
        }

        let verdict = match self.collect(image_id, annotations)? {
            Some(collected) => self.judge(&collected).map(|()| collected.result),
            None => Err("no qualified submission with parseable content".to_string()),
        };

        match verdict {
            Ok(result) => {
                self.lifecycle
                    .transition(image_id, ImageEvent::ConsensusAccepted)
                    .await?;
                info!(
                    %image_id,
                    contributors = result.qualified_count,
                    regions = result.regions.len(),
                    "Consensus accepted"
                );
                Ok(Evaluation::Accepted(result))
            }
            Err(reason) => {
                self.lifecycle
                    .transition(image_id, ImageEvent::ConsensusRejected)
                    .await?;
                info!(%image_id, %reason, "Consensus rejected, image returned for re-annotation");
                Ok(Evaluation::Rejected { reason })
            }
        }
    }

    fn collect(&self, image_id: Uuid, annotations: Vec<Annotation>) -> Result<Option<Collected>> {
        if annotations.is_empty() {
            debug!(%image_id, "No submissions for image");
            return Ok(None);
        }

        let (qualified, disqualified): (Vec<Annotation>, Vec<Annotation>) =
            annotations.into_iter().partition(|a| a.is_qualified);
        for a in &disqualified {
            debug!(
                %image_id,
                annotation_id = %a.id,
                user_id = %a.user_id,
                "Discarding disqualified submission"
            );
        }
        if qualified.is_empty() {
            debug!(%image_id, disqualified = disqualified.len(), "No qualified submissions");
            return Ok(None);
        }

        let mut contributors = Vec::with_capacity(qualified.len());
        let mut dataset: Option<Uuid> = None;
        let mut malformed_count = 0;
        for a in &qualified {
            let regions = match parse_regions(a) {
                Ok(regions) => regions,
                Err(e) if e.is_per_item() => {
                    warn!(%image_id, annotation_id = %a.id, error = %e, "Excluding malformed submission");
                    malformed_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match dataset {
                None => dataset = Some(a.dataset_id),
                Some(expected) if expected != a.dataset_id => {
                    return Err(Error::InconsistentDataset {
                        image_id,
                        expected,
                        found: a.dataset_id,
                    });
                }
                Some(_) => {}
            }
            contributors.push((a.id, regions));
        }

        let Some(dataset_id) = dataset else {
            debug!(%image_id, malformed_count, "Every qualified submission is malformed");
            return Ok(None);
        };

        let region_sets: Vec<Vec<Region>> =
            contributors.iter().map(|(_, r)| r.clone()).collect();
        let Some((regions, truncated_regions)) = aggregate_regions(&region_sets) else {
            return Ok(None);
        };
        if truncated_regions > 0 {
            warn!(
                %image_id,
                truncated_regions,
                merged_regions = regions.len(),
                "Submissions disagree on region count, trailing regions dropped"
            );
        }

        Ok(Some(Collected {
            result: ConsensusResult {
                image_id,
                dataset_id,
                regions,
                qualified_count: contributors.len(),
                disqualified_count: disqualified.len(),
                malformed_count,
                truncated_regions,
            },
            contributors,
        }))
    }

    /// Apply the acceptance policy to a collected consensus.
    fn judge(&self, collected: &Collected) -> std::result::Result<(), String> {
        let contributors = collected.contributors.len();
        if contributors < self.policy.min_qualified {
            return Err(format!(
                "{contributors} qualified submission(s), {} required",
                self.policy.min_qualified
            ));
        }

        let tolerance = self.policy.tolerance;
        for (annotation_id, regions) in &collected.contributors {
            for (k, (mine, consensus)) in regions.iter().zip(&collected.result.regions).enumerate() {
                let dx = (mine.center_x - consensus.center_x).abs();
                let dy = (mine.center_y - consensus.center_y).abs();
                if dx > tolerance * consensus.width || dy > tolerance * consensus.height {
                    return Err(format!(
                        "submission {annotation_id} region {k} deviates from consensus"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate a stored submission.
fn parse_regions(annotation: &Annotation) -> Result<Vec<Region>> {
    let regions = annotation.regions()?;
    for region in &regions {
        region.validate().map_err(|e| Error::MalformedSubmission {
            annotation_id: annotation.id,
            reason: e.to_string(),
        })?;
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_aggregate_regions_empty_input() {
        assert!(aggregate_regions(&[]).is_none());
    }

    #[test]
    fn test_aggregate_regions_single_submission_is_identity() {
        let regions = vec![Region::new(1.0, 2.0, 3.0, 4.0), Region::new(5.0, 6.0, 7.0, 8.0)];
        let (merged, truncated) = aggregate_regions(&[regions.clone()]).unwrap();
        assert_eq!(merged, regions);
        assert_eq!(truncated, 0);
    }

    #[test]
    fn test_aggregate_regions_mean_per_index() {
        let subs = vec![
            vec![Region::new(10.0, 10.0, 4.0, 4.0), Region::new(0.0, 0.0, 1.0, 1.0)],
            vec![Region::new(12.0, 10.0, 4.0, 4.0), Region::new(2.0, 4.0, 3.0, 1.0)],
            vec![Region::new(11.0, 11.0, 4.0, 6.0), Region::new(1.0, 2.0, 2.0, 4.0)],
        ];
        let (merged, truncated) = aggregate_regions(&subs).unwrap();

        assert_eq!(truncated, 0);
        assert_eq!(merged.len(), 2);
        assert!(approx(merged[0].center_x, 11.0));
        assert!(approx(merged[0].center_y, 31.0 / 3.0));
        assert!(approx(merged[0].width, 4.0));
        assert!(approx(merged[0].height, 14.0 / 3.0));
        assert!(approx(merged[1].center_x, 1.0));
        assert!(approx(merged[1].center_y, 2.0));
        assert!(approx(merged[1].width, 2.0));
        assert!(approx(merged[1].height, 2.0));
    }

    #[test]
    fn test_aggregate_regions_truncates_to_shortest() {
        let subs = vec![
            vec![
                Region::new(0.0, 0.0, 2.0, 2.0),
                Region::new(9.0, 9.0, 1.0, 1.0),
                Region::new(5.0, 5.0, 1.0, 1.0),
            ],
            vec![Region::new(2.0, 2.0, 2.0, 2.0)],
        ];
        let (merged, truncated) = aggregate_regions(&subs).unwrap();

        assert_eq!(merged, vec![Region::new(1.0, 1.0, 2.0, 2.0)]);
        assert_eq!(truncated, 2);
    }

    #[test]
    fn test_aggregate_regions_all_empty_labels() {
        let (merged, truncated) = aggregate_regions(&[Vec::new(), Vec::new()]).unwrap();
        assert!(merged.is_empty());
        assert_eq!(truncated, 0);
    }
}
