//! Core data models for sapphire.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// IMAGE TYPES
// =============================================================================

/// Processing status of an image in the pipeline.
///
/// See [`crate::lifecycle`] for the legal transitions between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Registered, waiting for the embedding scheduler.
    Unembedded,
    /// Claimed by an embedding batch.
    Embedding,
    /// Embedded, open for annotation.
    Ready,
    /// Consensus accepted (terminal).
    Annotated,
    /// Consensus rejected, collecting further submissions.
    ReAnnotation,
    /// Embedding abandoned after too many attempts (terminal).
    AnnotationFailed,
}

impl ImageStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [ImageStatus; 6] = [
        ImageStatus::Unembedded,
        ImageStatus::Embedding,
        ImageStatus::Ready,
        ImageStatus::Annotated,
        ImageStatus::ReAnnotation,
        ImageStatus::AnnotationFailed,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Unembedded => "unembedded",
            ImageStatus::Embedding => "embedding",
            ImageStatus::Ready => "ready",
            ImageStatus::Annotated => "annotated",
            ImageStatus::ReAnnotation => "re_annotation",
            ImageStatus::AnnotationFailed => "annotation_failed",
        }
    }

    /// Whether no further transitions leave this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Annotated | ImageStatus::AnnotationFailed)
    }

    /// Whether annotators may submit against an image in this status.
    pub fn accepts_annotations(&self) -> bool {
        matches!(self, ImageStatus::Ready | ImageStatus::ReAnnotation)
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ImageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Serialization(format!("unknown image status: {s}")))
    }
}

/// Status filter for listing images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    /// Any status.
    #[default]
    Any,
    /// Exactly this status.
    Only(ImageStatus),
}

impl StatusFilter {
    /// Whether an image with `status` passes the filter.
    pub fn matches(&self, status: ImageStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl From<ImageStatus> for StatusFilter {
    fn from(status: ImageStatus) -> Self {
        StatusFilter::Only(status)
    }
}

/// An image flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub url: String,
    pub embedding_url: Option<String>,
    pub status: ImageStatus,
    /// Failed embedding attempts so far.
    pub embedding_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request for registering a new image.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub dataset_id: Uuid,
    pub url: String,
}

// =============================================================================
// ANNOTATION TYPES
// =============================================================================

/// One labeled bounding box.
///
/// Coordinates are either normalized or in pixels; the caller fixes the
/// convention and it must be the same for every submission of one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub center_x: f64,
    pub center_y: f64,
    #[serde(rename = "w", alias = "width")]
    pub width: f64,
    #[serde(rename = "h", alias = "height")]
    pub height: f64,
}

impl Region {
    pub fn new(center_x: f64, center_y: f64, width: f64, height: f64) -> Self {
        Self {
            center_x,
            center_y,
            width,
            height,
        }
    }

    /// Reject non-finite coordinates and negative extents.
    pub fn validate(&self) -> Result<()> {
        let finite = [self.center_x, self.center_y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(Error::InvalidInput(
                "region coordinates must be finite".to_string(),
            ));
        }
        if self.width < 0.0 || self.height < 0.0 {
            return Err(Error::InvalidInput(
                "region width and height must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// One annotator's submission for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub image_id: Uuid,
    pub dataset_id: Uuid,
    pub user_id: Uuid,
    /// Raw JSON array of regions, as submitted.
    pub content: JsonValue,
    /// Whether this submission counts toward consensus.
    pub is_qualified: bool,
    /// Planned copies of work for the image.
    pub replica_count: i32,
    /// Qualified copies delivered when this submission was saved.
    pub qualified_count: i32,
    /// Copies delivered when this submission was saved.
    pub delivered_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Annotation {
    /// Parse the stored content into regions.
    pub fn regions(&self) -> Result<Vec<Region>> {
        serde_json::from_value(self.content.clone()).map_err(|e| Error::MalformedSubmission {
            annotation_id: self.id,
            reason: e.to_string(),
        })
    }
}

/// Request for saving a submission.
#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub image_id: Uuid,
    pub dataset_id: Uuid,
    pub user_id: Uuid,
    pub content: JsonValue,
    pub is_qualified: bool,
    pub replica_count: i32,
    pub qualified_count: i32,
    pub delivered_count: i32,
}

impl NewAnnotation {
    /// Build a qualified submission from parsed regions.
    pub fn from_regions(
        image_id: Uuid,
        dataset_id: Uuid,
        user_id: Uuid,
        regions: &[Region],
    ) -> Result<Self> {
        Ok(Self {
            image_id,
            dataset_id,
            user_id,
            content: serde_json::to_value(regions)?,
            is_qualified: true,
            replica_count: 0,
            qualified_count: 0,
            delivered_count: 0,
        })
    }

    /// Set the quorum bookkeeping counters.
    pub fn with_counts(mut self, replica: i32, qualified: i32, delivered: i32) -> Self {
        self.replica_count = replica;
        self.qualified_count = qualified;
        self.delivered_count = delivered;
        self
    }

    /// Override the qualification flag.
    pub fn with_qualified(mut self, is_qualified: bool) -> Self {
        self.is_qualified = is_qualified;
        self
    }
}

// =============================================================================
// CONSENSUS TYPES
// =============================================================================

/// Reconciled label for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub image_id: Uuid,
    pub dataset_id: Uuid,
    /// One region per merged index.
    pub regions: Vec<Region>,
    /// Submissions that contributed to the means.
    pub qualified_count: usize,
    /// Submissions excluded by quality control.
    pub disqualified_count: usize,
    /// Qualified submissions excluded because their content did not parse.
    pub malformed_count: usize,
    /// Regions dropped because submissions disagreed on region count.
    pub truncated_regions: usize,
}

impl ConsensusResult {
    /// Regions serialized in the submission content format.
    pub fn content(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(&self.regions)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn annotation_with(content: JsonValue) -> Annotation {
        Annotation {
            id: Uuid::new_v4(),
            image_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            content,
            is_qualified: true,
            replica_count: 3,
            qualified_count: 1,
            delivered_count: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_image_status_str_roundtrip() {
        for status in ImageStatus::ALL {
            assert_eq!(status.as_str().parse::<ImageStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_image_status_unknown_string() {
        assert!("pending".parse::<ImageStatus>().is_err());
    }

    #[test]
    fn test_image_status_serde_matches_storage() {
        let json = serde_json::to_string(&ImageStatus::ReAnnotation).unwrap();
        assert_eq!(json, "\"re_annotation\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ImageStatus::Annotated.is_terminal());
        assert!(ImageStatus::AnnotationFailed.is_terminal());
        assert!(!ImageStatus::ReAnnotation.is_terminal());
    }

    #[test]
    fn test_accepts_annotations() {
        assert!(ImageStatus::Ready.accepts_annotations());
        assert!(ImageStatus::ReAnnotation.accepts_annotations());
        assert!(!ImageStatus::Embedding.accepts_annotations());
        assert!(!ImageStatus::Annotated.accepts_annotations());
    }

    #[test]
    fn test_status_filter() {
        assert!(StatusFilter::Any.matches(ImageStatus::Embedding));
        let only: StatusFilter = ImageStatus::Ready.into();
        assert!(only.matches(ImageStatus::Ready));
        assert!(!only.matches(ImageStatus::Unembedded));
    }

    #[test]
    fn test_region_parses_submission_format() {
        let ann = annotation_with(json!([
            {"center_x": 10.0, "center_y": 12.5, "w": 4.0, "h": 6.0, "id": 7}
        ]));
        let regions = ann.regions().unwrap();
        assert_eq!(regions, vec![Region::new(10.0, 12.5, 4.0, 6.0)]);
    }

    #[test]
    fn test_region_accepts_long_field_names() {
        let ann = annotation_with(json!([
            {"center_x": 1, "center_y": 2, "width": 3, "height": 4}
        ]));
        assert_eq!(ann.regions().unwrap()[0], Region::new(1.0, 2.0, 3.0, 4.0));
    }

    #[test]
    fn test_empty_content_is_valid() {
        let ann = annotation_with(json!([]));
        assert!(ann.regions().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_content() {
        let ann = annotation_with(json!({"center_x": 1}));
        match ann.regions() {
            Err(Error::MalformedSubmission { annotation_id, .. }) => {
                assert_eq!(annotation_id, ann.id)
            }
            other => panic!("expected MalformedSubmission, got {:?}", other),
        }
    }

    #[test]
    fn test_region_validate() {
        assert!(Region::new(0.5, 0.5, 0.1, 0.1).validate().is_ok());
        assert!(Region::new(f64::NAN, 0.5, 0.1, 0.1).validate().is_err());
        assert!(Region::new(0.5, 0.5, -1.0, 0.1).validate().is_err());
        assert!(Region::new(0.5, f64::INFINITY, 0.1, 0.1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_new_annotation_from_regions() {
        let regions = vec![Region::new(1.0, 2.0, 3.0, 4.0)];
        let req = NewAnnotation::from_regions(Uuid::nil(), Uuid::nil(), Uuid::nil(), &regions)
            .unwrap()
            .with_counts(3, 2, 2);
        assert!(req.is_qualified);
        assert_eq!(req.replica_count, 3);
        assert_eq!(
            req.content,
            json!([{"center_x": 1.0, "center_y": 2.0, "w": 3.0, "h": 4.0}])
        );
    }

    #[test]
    fn test_consensus_content() {
        let result = ConsensusResult {
            image_id: Uuid::nil(),
            dataset_id: Uuid::nil(),
            regions: vec![Region::new(11.0, 10.0, 4.0, 4.0)],
            qualified_count: 2,
            disqualified_count: 1,
            malformed_count: 0,
            truncated_regions: 0,
        };
        assert_eq!(
            result.content().unwrap(),
            json!([{"center_x": 11.0, "center_y": 10.0, "w": 4.0, "h": 4.0}])
        );
    }
}
