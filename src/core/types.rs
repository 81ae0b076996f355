// Domain types for the leaf diagnosis workflow

use image::{GrayImage, RgbImage};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::disease_catalog::{DiseaseProfile, Severity};
use crate::core::errors::PipelineError;

/// Axis-aligned box in pixel coordinates (x1, y1) inclusive, (x2, y2) exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Integer pixel window clamped to an image: [x0, x1) x [y0, y1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.x1 + self.x2) / 2.0,
            y: (self.y1 + self.y2) / 2.0,
        }
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Truncate to integer pixels inside a `width` x `height` image.
    /// Returns `None` when nothing of the box is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_nan() {
                0
            } else {
                (v.max(0.0) as u32).min(max)
            }
        };
        let rect = PixelRect {
            x0: clamp(self.x1, width),
            y0: clamp(self.y1, height),
            x1: clamp(self.x2, width),
            y1: clamp(self.y2, height),
        };
        if rect.x1 > rect.x0 && rect.y1 > rect.y0 {
            Some(rect)
        } else {
            None
        }
    }
}

/// One detector hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
}

/// A leaf cut out of its source image, background pixels set to black.
#[derive(Debug, Clone)]
pub struct LeafImage {
    pub index: usize,
    pub image: RgbImage,
    /// Detector box in source image coordinates
    pub bbox: BoundingBox,
    pub center: Point,
}

/// Disease box on a leaf image, fed into region segmentation.
#[derive(Debug, Clone, PartialEq)]
pub struct DiseaseCandidate {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub detector_confidence: f32,
}

impl From<Detection> for DiseaseCandidate {
    fn from(detection: Detection) -> Self {
        Self {
            bbox: detection.bbox,
            class_name: detection.class_name,
            detector_confidence: detection.confidence,
        }
    }
}

/// One layer's activations, channels x height x width.
#[derive(Debug, Clone)]
pub struct FeatureMap {
    pub layer: String,
    pub data: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct AnomalyResult {
    pub score: f32,
    pub is_diseased: bool,
    /// 0..=100, relative distance from the threshold
    pub confidence: f32,
    /// JET-coloured map at leaf resolution; absent when synthesis failed
    pub heatmap: Option<RgbImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationPath {
    Statistical,
    Simple,
}

/// Colour statistics of the healthy reference pixels (OpenCV 8-bit Lab scale).
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceStats {
    pub lab_mean: [f32; 3],
    pub lab_std: [f32; 3],
    pub mean_hue: f32,
    pub pixel_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseCoverage {
    pub name: String,
    pub detector_confidence: f32,
    pub pixel_count: usize,
    pub percentage: f32,
}

#[derive(Debug, Clone)]
pub struct DiseaseRegionResult {
    pub disease_mask: GrayImage,
    pub per_disease: Vec<DiseaseCoverage>,
    pub total_leaf_pixels: usize,
    pub total_diseased_pixels: usize,
    pub total_diseased_percentage: f32,
    /// Lab distance from the healthy reference, rows x cols; zero on the simple path
    pub distance_heatmap: Array2<f32>,
    pub background_mask: GrayImage,
    pub path: SegmentationPath,
    /// Present only when the statistical path ran
    pub reference: Option<ReferenceStats>,
}

/// One entry of a leaf's diseases mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseEntry {
    pub confidence: f32,
    pub percentage: f32,
    pub description: String,
    pub severity: Severity,
    pub treatment: String,
}

impl DiseaseEntry {
    pub fn from_profile(profile: &DiseaseProfile, confidence: f32, percentage: f32) -> Self {
        Self {
            confidence,
            percentage,
            description: profile.description.to_string(),
            severity: profile.severity,
            treatment: profile.treatment.to_string(),
        }
    }
}

pub type DiseaseMap = BTreeMap<String, DiseaseEntry>;

/// Merged per-leaf result.
#[derive(Debug, Clone)]
pub struct LeafRecord {
    pub index: usize,
    pub leaf: LeafImage,
    pub anomaly: AnomalyResult,
    pub regions: Option<DiseaseRegionResult>,
    /// Never empty
    pub diseases: DiseaseMap,
}

/// Per-leaf response object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafReport {
    pub image: String,
    pub heatmap: Option<String>,
    pub overlay: Option<String>,
    pub diseases: DiseaseMap,
    pub anomaly_score: f32,
    pub is_diseased: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeafSummary {
    pub total_leafs: usize,
    pub diseased_leafs: usize,
    pub healthy_leafs: usize,
}

impl LeafSummary {
    pub fn from_records(records: &[LeafRecord]) -> Self {
        let diseased = records.iter().filter(|r| r.anomaly.is_diseased).count();
        Self {
            total_leafs: records.len(),
            diseased_leafs: diseased,
            healthy_leafs: records.len() - diseased,
        }
    }
}

/// Per-image response object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReport {
    pub leafs: Vec<LeafReport>,
    pub summary: LeafSummary,
    pub timestamp: String,
    pub image_processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_index: Option<usize>,
}

/// Error record for one item of a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemError {
    pub error: String,
    pub timestamp: String,
    pub image_processed: bool,
    pub image_url: String,
    pub processing_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchItemResult {
    Success(ImageReport),
    Error(BatchItemError),
}

impl BatchItemResult {
    pub fn processing_index(&self) -> Option<usize> {
        match self {
            BatchItemResult::Success(report) => report.processing_index,
            BatchItemResult::Error(err) => Some(err.processing_index),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, BatchItemResult::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Bad, missing or unreachable reference; non-image content
    Input,
    /// Anything that went wrong on our side
    Processing,
}

/// Result of processing one subject image.
///
/// `EmptySubject` is the expected "nothing to analyse" case and must not be
/// treated as a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    EmptySubject { reason: String },
    Failure { kind: FailureKind, message: String },
}

impl<T> From<PipelineError> for Outcome<T> {
    fn from(err: PipelineError) -> Self {
        let kind = if err.is_input_error() {
            FailureKind::Input
        } else {
            FailureKind::Processing
        };
        Outcome::Failure {
            kind,
            message: err.to_string(),
        }
    }
}

/// Timestamp format used in every response object.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::disease_catalog::DiseaseCatalog;
    use crate::core::errors::{FetchError, ModelError};

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BoundingBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn test_clamp_to_image() {
        let bbox = BoundingBox::new(-5.0, 2.5, 120.0, 40.0);
        let rect = bbox.clamp_to(100, 50).unwrap();
        assert_eq!(rect, PixelRect { x0: 0, y0: 2, x1: 100, y1: 40 });

        assert!(BoundingBox::new(200.0, 0.0, 300.0, 10.0).clamp_to(100, 50).is_none());
    }

    #[test]
    fn test_diseases_map_round_trip() {
        let catalog = DiseaseCatalog::builtin();
        let mut diseases = DiseaseMap::new();
        diseases.insert(
            "Black Rot".to_string(),
            DiseaseEntry::from_profile(catalog.lookup("Black Rot"), 0.87, 15.3),
        );
        diseases.insert(
            "Anthracnose".to_string(),
            DiseaseEntry::from_profile(catalog.lookup("Anthracnose"), 0.72, 8.5),
        );

        let json = serde_json::to_string(&diseases).unwrap();
        let parsed: DiseaseMap = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, diseases);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn test_batch_item_shapes() {
        let error = BatchItemResult::Error(BatchItemError {
            error: "Failed to download image".to_string(),
            timestamp: timestamp_now(),
            image_processed: false,
            image_url: "http://example.com/a.jpg".to_string(),
            processing_index: 2,
        });
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["image_processed"], false);
        assert_eq!(value["processing_index"], 2);

        let single = ImageReport {
            leafs: vec![],
            summary: LeafSummary::default(),
            timestamp: timestamp_now(),
            image_processed: true,
            image_url: None,
            processing_index: None,
        };
        let value = serde_json::to_value(&single).unwrap();
        assert!(value.get("image_url").is_none());
        assert!(value.get("processing_index").is_none());
    }

    #[test]
    fn test_outcome_from_pipeline_error() {
        let outcome: Outcome<()> = PipelineError::from(FetchError::EmptyReference).into();
        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Input, .. }));

        let outcome: Outcome<()> =
            PipelineError::from(ModelError::DetectionFailed("session".to_string())).into();
        assert!(matches!(outcome, Outcome::Failure { kind: FailureKind::Processing, .. }));
    }
}
