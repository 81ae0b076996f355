// Per-image leaf pipeline
//
// Extracted -> Scored -> (Segmented | SkippedSegmentation) -> Merged
//
// The disease detector and region segmenter only ever see leaves the anomaly
// scorer flagged as diseased.

use image::RgbImage;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::core::disease_catalog::{DiseaseCatalog, GENERIC_DISEASED, HEALTHY};
use crate::core::errors::{ModelError, PipelineResult};
use crate::core::types::{
    AnomalyResult, DiseaseCandidate, DiseaseEntry, DiseaseMap, DiseaseRegionResult, LeafImage, LeafRecord,
    Outcome,
};
use crate::phases::anomaly::AnomalyScorer;
use crate::phases::disease_regions::DiseaseRegionSegmenter;
use crate::phases::leaf_extraction::LeafExtractor;
use crate::services::detection::ObjectDetector;
use crate::utils::metrics::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafStage {
    Extracted,
    Scored,
    Segmented,
    SkippedSegmentation,
    Merged,
}

impl fmt::Display for LeafStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeafStage::Extracted => "extracted",
            LeafStage::Scored => "scored",
            LeafStage::Segmented => "segmented",
            LeafStage::SkippedSegmentation => "skipped-segmentation",
            LeafStage::Merged => "merged",
        };
        f.write_str(name)
    }
}

pub struct LeafPipeline {
    extractor: LeafExtractor,
    scorer: AnomalyScorer,
    disease_detector: Arc<dyn ObjectDetector>,
    region_segmenter: DiseaseRegionSegmenter,
    catalog: Arc<DiseaseCatalog>,
    metrics: Metrics,
}

impl LeafPipeline {
    pub fn new(
        extractor: LeafExtractor,
        scorer: AnomalyScorer,
        disease_detector: Arc<dyn ObjectDetector>,
        region_segmenter: DiseaseRegionSegmenter,
        catalog: Arc<DiseaseCatalog>,
        metrics: Metrics,
    ) -> Self {
        Self {
            extractor,
            scorer,
            disease_detector,
            region_segmenter,
            catalog,
            metrics,
        }
    }

    /// Run every leaf of `image` through the pipeline.
    ///
    /// No leaves is `EmptySubject`, not a failure.
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn run(&self, image: &RgbImage) -> Outcome<Vec<LeafRecord>> {
        match self.try_run(image) {
            Ok(records) if records.is_empty() => Outcome::EmptySubject {
                reason: "No grape leaves detected in the image".to_string(),
            },
            Ok(records) => Outcome::Success(records),
            Err(e) => e.into(),
        }
    }

    fn try_run(&self, image: &RgbImage) -> PipelineResult<Vec<LeafRecord>> {
        let start = Instant::now();
        let leaves = self.extractor.extract(image)?;

        let mut records = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            records.push(self.process_leaf(leaf)?);
        }

        info!(
            "✓ {} leaves processed ({} diseased) in {:.2}ms",
            records.len(),
            records.iter().filter(|r| r.anomaly.is_diseased).count(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(records)
    }

    fn process_leaf(&self, leaf: LeafImage) -> PipelineResult<LeafRecord> {
        debug!("Leaf {}: {}", leaf.index, LeafStage::Extracted);

        let scoring_start = Instant::now();
        let anomaly = self.scorer.score_leaf(&leaf.image)?;
        self.metrics.record_leaf_scored(
            anomaly.is_diseased,
            anomaly.heatmap.is_some(),
            scoring_start.elapsed(),
        );
        debug!("Leaf {}: {} ({:.4})", leaf.index, LeafStage::Scored, anomaly.score);

        let regions = if anomaly.is_diseased {
            let segmentation_start = Instant::now();
            let candidates: Vec<DiseaseCandidate> = self
                .disease_detector
                .detect(&leaf.image)
                .map_err(|e| ModelError::DetectionFailed(format!("{:#}", e)))?
                .into_iter()
                .map(DiseaseCandidate::from)
                .collect();
            debug!("Leaf {}: {} disease candidates", leaf.index, candidates.len());

            let regions = self.region_segmenter.segment(&leaf.image, &candidates);
            self.metrics.record_segmentation(segmentation_start.elapsed());
            debug!("Leaf {}: {}", leaf.index, LeafStage::Segmented);
            regions
        } else {
            debug!("Leaf {}: {}", leaf.index, LeafStage::SkippedSegmentation);
            None
        };

        let diseases = merge_diseases(&anomaly, regions.as_ref(), &self.catalog);
        debug!("Leaf {}: {} ({} entries)", leaf.index, LeafStage::Merged, diseases.len());

        Ok(LeafRecord {
            index: leaf.index,
            leaf,
            anomaly,
            regions,
            diseases,
        })
    }
}

/// Build the never-empty diseases mapping for one leaf.
///
/// Duplicate class names keep the entry with the higher detector confidence;
/// on a tie the first one stays.
pub fn merge_diseases(
    anomaly: &AnomalyResult,
    regions: Option<&DiseaseRegionResult>,
    catalog: &DiseaseCatalog,
) -> DiseaseMap {
    let mut diseases = DiseaseMap::new();
    let anomaly_confidence = anomaly.confidence / 100.0;

    if !anomaly.is_diseased {
        diseases.insert(
            HEALTHY.name.to_string(),
            DiseaseEntry::from_profile(&HEALTHY, anomaly_confidence, 0.0),
        );
        return diseases;
    }

    for coverage in regions.map(|r| r.per_disease.as_slice()).unwrap_or_default() {
        let replace = diseases
            .get(&coverage.name)
            .map_or(true, |existing| coverage.detector_confidence > existing.confidence);
        if replace {
            diseases.insert(
                coverage.name.clone(),
                DiseaseEntry::from_profile(
                    catalog.lookup(&coverage.name),
                    coverage.detector_confidence,
                    coverage.percentage,
                ),
            );
        }
    }

    if diseases.is_empty() {
        diseases.insert(
            GENERIC_DISEASED.name.to_string(),
            DiseaseEntry::from_profile(&GENERIC_DISEASED, anomaly_confidence, 0.0),
        );
    }
    diseases
}
