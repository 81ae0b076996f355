// Batch Coordinator: fetch -> decode -> leaf pipeline -> artifacts, per reference

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use crate::core::config::Config;
use crate::core::disease_catalog::DiseaseCatalog;
use crate::core::errors::{ArtifactError, FetchError, PipelineResult};
use crate::core::types::{
    timestamp_now, BatchItemError, BatchItemResult, FailureKind, ImageReport, LeafRecord, LeafReport,
    LeafSummary, Outcome,
};
use crate::phases::anomaly::{AnomalyScorer, FeatureStatistics};
use crate::phases::disease_regions::DiseaseRegionSegmenter;
use crate::phases::leaf_extraction::LeafExtractor;
use crate::phases::leaf_pipeline::LeafPipeline;
use crate::services::artifacts::{ArtifactNamer, ArtifactStore, StaticDirStore};
use crate::services::detection::{DetectorSettings, YoloDetector};
use crate::services::features::OnnxFeatureExtractor;
use crate::services::fetch::{HttpImageFetcher, ImageFetcher};
use crate::services::segmentation::SamSegmenter;
use crate::utils::image_ops::{blend, decode_rgb, encode_jpeg};
use crate::utils::metrics::Metrics;

const OVERLAY_LEAF_WEIGHT: f32 = 0.6;
const OVERLAY_HEATMAP_WEIGHT: f32 = 0.4;

/// Drives the leaf pipeline over one or many image references.
pub struct BatchCoordinator {
    fetcher: Arc<dyn ImageFetcher>,
    pipeline: Arc<LeafPipeline>,
    store: Arc<dyn ArtifactStore>,
    namer: Arc<ArtifactNamer>,
    metrics: Metrics,
    backend_type: String,
}

impl BatchCoordinator {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        pipeline: Arc<LeafPipeline>,
        store: Arc<dyn ArtifactStore>,
        namer: Arc<ArtifactNamer>,
        metrics: Metrics,
    ) -> Self {
        Self {
            fetcher,
            pipeline,
            store,
            namer,
            metrics,
            backend_type: "CPU".to_string(),
        }
    }

    /// Load every model and collaborator named in `config`.
    ///
    /// Builds a blocking HTTP client, so call it off the async runtime.
    #[instrument(skip(config, metrics))]
    pub fn from_config(config: &Config, metrics: Metrics) -> Result<Self> {
        info!("Initializing services...");
        let models = &config.models;
        let detection = &config.detection;
        let pool_size = config.onnx_pool_size();

        let leaf_detector = YoloDetector::new(
            &models.leaf_detector_path,
            "leaf-detector",
            Some(vec!["leaf".to_string()]),
            DetectorSettings {
                input_size: detection.input_size,
                confidence_threshold: detection.leaf_confidence_threshold,
                iou_threshold: detection.leaf_iou_threshold,
            },
            pool_size,
        )
        .context("Failed to load leaf detector")?;
        let backend_type = leaf_detector.device_type().to_string();

        let leaf_segmenter = SamSegmenter::new(
            &models.leaf_segmenter_encoder_path,
            &models.leaf_segmenter_decoder_path,
            pool_size,
        )
        .context("Failed to load leaf segmenter")?;

        let extractor = OnnxFeatureExtractor::new(&models.feature_extractor_path, pool_size)
            .context("Failed to load feature extractor")?;
        let statistics = FeatureStatistics::load(&models.feature_statistics_path)
            .context("Failed to load feature statistics")?;

        let disease_detector = YoloDetector::new(
            &models.disease_detector_path,
            "disease-detector",
            models.disease_class_names.clone(),
            DetectorSettings {
                input_size: detection.input_size,
                confidence_threshold: detection.disease_confidence_threshold,
                iou_threshold: detection.disease_iou_threshold,
            },
            pool_size,
        )
        .context("Failed to load disease detector")?;

        let pipeline = LeafPipeline::new(
            LeafExtractor::new(
                Arc::new(leaf_detector),
                Arc::new(leaf_segmenter),
                detection.leaf_crop_padding,
            ),
            AnomalyScorer::new(Arc::new(statistics), Arc::new(extractor), config.heatmap_grid_size()),
            Arc::new(disease_detector),
            DiseaseRegionSegmenter::new(config.segmentation.clone()),
            Arc::new(DiseaseCatalog::builtin().clone()),
            metrics.clone(),
        );

        let fetcher = HttpImageFetcher::new(Duration::from_secs(config.fetch_timeout_seconds()))
            .context("Failed to build HTTP client")?;
        let store = StaticDirStore::new(config.static_dir(), config.public_base_url())
            .context("Failed to prepare static directory")?;

        info!(
            "✓ Ready (backend: {}, ONNX pool: {} sessions per model)",
            backend_type, pool_size
        );

        let mut coordinator = Self::new(
            Arc::new(fetcher),
            Arc::new(pipeline),
            Arc::new(store),
            Arc::new(ArtifactNamer::new()),
            metrics,
        );
        coordinator.backend_type = backend_type;
        Ok(coordinator)
    }

    /// Execution provider of the loaded models (e.g. "CUDA", "CPU")
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    /// Process one image reference.
    #[instrument(skip(self))]
    pub fn process_single(&self, reference: &str) -> Outcome<ImageReport> {
        let start = Instant::now();
        let outcome = self.process_image(reference);
        info!(
            "Request completed in {:.2}s: {}",
            start.elapsed().as_secs_f64(),
            outcome_label(&outcome)
        );
        outcome
    }

    /// Process references in order, one at a time. A failing item becomes an
    /// error record and never stops the rest.
    #[instrument(skip(self, references), fields(total_images = references.len()))]
    pub fn process_bulk(&self, references: &[String]) -> Vec<BatchItemResult> {
        let start = Instant::now();
        let total = references.len();
        let mut results = Vec::with_capacity(total);

        for (i, reference) in references.iter().enumerate() {
            let processing_index = i + 1;
            info!("📸 Processing image {}/{}: {}", processing_index, total, reference);

            let item = match self.process_image(reference) {
                Outcome::Success(mut report) => {
                    report.image_url = Some(reference.clone());
                    report.processing_index = Some(processing_index);
                    BatchItemResult::Success(report)
                }
                Outcome::EmptySubject { reason: message } | Outcome::Failure { message, .. } => {
                    BatchItemResult::Error(BatchItemError {
                        error: message,
                        timestamp: timestamp_now(),
                        image_processed: false,
                        image_url: reference.clone(),
                        processing_index,
                    })
                }
            };
            results.push(item);
        }

        let failed = results.iter().filter(|r| r.is_error()).count();
        info!(
            "Bulk completed in {:.2}s: {} successful, {} failed",
            start.elapsed().as_secs_f64(),
            total - failed,
            failed
        );
        results
    }

    fn process_image(&self, reference: &str) -> Outcome<ImageReport> {
        let image = match self.fetch_image(reference) {
            Ok(image) => image,
            Err(e) => {
                warn!("Fetch failed for {}: {}", reference, e);
                self.metrics.record_image_failed(true);
                return Outcome::Failure {
                    kind: FailureKind::Input,
                    message: e.to_string(),
                };
            }
        };

        let records = match self.pipeline.run(&image) {
            Outcome::Success(records) => records,
            Outcome::EmptySubject { reason } => {
                warn!("⚠️ {}", reason);
                self.metrics.record_image_empty();
                return Outcome::EmptySubject { reason };
            }
            Outcome::Failure { kind, message } => {
                error!("Processing failed for {}: {}", reference, message);
                self.metrics.record_image_failed(false);
                return Outcome::Failure { kind, message };
            }
        };

        match self.publish(&records) {
            Ok(leafs) => {
                self.metrics.record_image_processed();
                Outcome::Success(ImageReport {
                    leafs,
                    summary: LeafSummary::from_records(&records),
                    timestamp: timestamp_now(),
                    image_processed: true,
                    image_url: None,
                    processing_index: None,
                })
            }
            Err(e) => {
                error!("Artifact publishing failed for {}: {}", reference, e);
                self.metrics.record_image_failed(false);
                e.into()
            }
        }
    }

    fn fetch_image(&self, reference: &str) -> Result<image::RgbImage, FetchError> {
        let bytes = self.fetcher.fetch(reference)?;
        Ok(decode_rgb(&bytes)?)
    }

    /// Persist leaf, heatmap and overlay JPEGs and build the per-leaf objects.
    fn publish(&self, records: &[LeafRecord]) -> PipelineResult<Vec<LeafReport>> {
        let mut reports = Vec::with_capacity(records.len());

        for record in records {
            let names = self.namer.next();
            let leaf = &record.leaf.image;
            let encode = |img: &image::RgbImage, name: &str| {
                encode_jpeg(img).map_err(|source| ArtifactError::Encode {
                    name: name.to_string(),
                    source,
                })
            };

            let image_url = self.store.put(&encode(leaf, &names.leaf)?, &names.leaf)?;

            let (heatmap_url, overlay_url) = match &record.anomaly.heatmap {
                Some(heatmap) if heatmap.dimensions() == leaf.dimensions() => {
                    let heatmap_url = self.store.put(&encode(heatmap, &names.heatmap)?, &names.heatmap)?;
                    let overlay = blend(leaf, heatmap, OVERLAY_LEAF_WEIGHT, OVERLAY_HEATMAP_WEIGHT);
                    let overlay_url = self.store.put(&encode(&overlay, &names.overlay)?, &names.overlay)?;
                    (Some(heatmap_url), Some(overlay_url))
                }
                Some(_) => {
                    warn!("Leaf {}: heatmap size does not match leaf, not publishing", record.index);
                    (None, None)
                }
                None => (None, None),
            };

            reports.push(LeafReport {
                image: image_url,
                heatmap: heatmap_url,
                overlay: overlay_url,
                diseases: record.diseases.clone(),
                anomaly_score: record.anomaly.score,
                is_diseased: record.anomaly.is_diseased,
            });
        }
        Ok(reports)
    }
}

fn outcome_label<T>(outcome: &Outcome<T>) -> &'static str {
    match outcome {
        Outcome::Success(_) => "success",
        Outcome::EmptySubject { .. } => "no leaves",
        Outcome::Failure { kind: FailureKind::Input, .. } => "input error",
        Outcome::Failure { kind: FailureKind::Processing, .. } => "processing error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::SegmentationConfig;
    use crate::core::errors::ArtifactResult;
    use crate::core::types::{BoundingBox, Detection, FeatureMap, Point};
    use crate::phases::anomaly::FeatureStatisticsFile;
    use crate::services::detection::ObjectDetector;
    use crate::services::features::FeatureExtractor;
    use crate::services::segmentation::{PreparedImage, PromptSegmenter};
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use ndarray::Array3;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MapFetcher(HashMap<String, Vec<u8>>);

    impl ImageFetcher for MapFetcher {
        fn fetch(&self, reference: &str) -> Result<Vec<u8>, FetchError> {
            self.0
                .get(reference)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(reference.to_string()))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<String>>,
    }

    impl ArtifactStore for MemoryStore {
        fn put(&self, bytes: &[u8], name: &str) -> ArtifactResult<String> {
            assert!(!bytes.is_empty());
            self.saved.lock().push(name.to_string());
            Ok(format!("http://test/static/{}", name))
        }
    }

    /// One leaf covering the whole image unless the image is pure white.
    struct WholeImageDetector;

    impl ObjectDetector for WholeImageDetector {
        fn detect(&self, image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            if image.pixels().all(|p| *p == Rgb([255, 255, 255])) {
                return Ok(vec![]);
            }
            Ok(vec![Detection {
                bbox: BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32),
                class_id: 0,
                class_name: "leaf".to_string(),
                confidence: 0.9,
            }])
        }
    }

    struct NoDiseases;

    impl ObjectDetector for NoDiseases {
        fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            Ok(vec![])
        }
    }

    struct FullMask;

    impl PromptSegmenter for FullMask {
        fn prepare<'a>(&'a self, image: &'a RgbImage) -> anyhow::Result<Box<dyn PreparedImage + 'a>> {
            let mask = GrayImage::from_pixel(image.width(), image.height(), Luma([255]));
            Ok(Box::new(move |_: Point| -> anyhow::Result<Option<GrayImage>> { Ok(Some(mask.clone())) }))
        }
    }

    /// Pools to [1, 0] with a spatially varying second channel so the heatmap is not flat.
    struct GradientExtractor;

    impl FeatureExtractor for GradientExtractor {
        fn extract(&self, _image: &RgbImage, layers: &[String], _size: u32) -> anyhow::Result<Vec<FeatureMap>> {
            let data = Array3::from_shape_fn((2, 4, 4), |(c, _, x)| if c == 0 { 1.0 } else { x as f32 * 0.1 });
            Ok(vec![FeatureMap {
                layer: layers[0].clone(),
                data,
            }])
        }
    }

    fn png(img: &RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn coordinator(images: &[(&str, Vec<u8>)]) -> (BatchCoordinator, Arc<MemoryStore>, Metrics) {
        let metrics = Metrics::new();
        let statistics = FeatureStatistics::from_file(FeatureStatisticsFile {
            memory_bank: vec![vec![1.0, 0.0]],
            feature_mean: vec![0.0, 0.0],
            feature_std: vec![1.0, 1.0],
            threshold: 1.0,
            num_neighbors: 1,
            backbone_name: String::new(),
            layers: vec!["layer2".to_string()],
            image_size: 32,
        })
        .unwrap();
        let pipeline = LeafPipeline::new(
            LeafExtractor::new(Arc::new(WholeImageDetector), Arc::new(FullMask), 0),
            AnomalyScorer::new(Arc::new(statistics), Arc::new(GradientExtractor), 4),
            Arc::new(NoDiseases),
            DiseaseRegionSegmenter::new(SegmentationConfig::default()),
            Arc::new(DiseaseCatalog::builtin().clone()),
            metrics.clone(),
        );
        let store = Arc::new(MemoryStore::default());
        let fetcher = MapFetcher(
            images
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.clone()))
                .collect(),
        );
        let coordinator = BatchCoordinator::new(
            Arc::new(fetcher),
            Arc::new(pipeline),
            store.clone(),
            Arc::new(ArtifactNamer::new()),
            metrics.clone(),
        );
        (coordinator, store, metrics)
    }

    fn leaf_png() -> Vec<u8> {
        png(&RgbImage::from_pixel(16, 12, Rgb([40, 160, 40])))
    }

    #[test]
    fn test_single_publishes_leaf_heatmap_and_overlay() {
        let (coordinator, store, metrics) = coordinator(&[("a.png", leaf_png())]);

        let Outcome::Success(report) = coordinator.process_single("a.png") else {
            panic!("expected success");
        };
        assert!(report.image_processed);
        assert_eq!(report.summary.total_leafs, 1);
        assert_eq!(report.summary.healthy_leafs, 1);
        assert!(report.image_url.is_none());

        let leaf = &report.leafs[0];
        assert!(leaf.image.starts_with("http://test/static/leaf_1_"));
        assert!(leaf.heatmap.as_deref().unwrap().contains("heatmap_1_"));
        assert!(leaf.overlay.as_deref().unwrap().contains("overlay_1_"));
        assert!(leaf.diseases.contains_key("healthy"));
        assert_eq!(store.saved.lock().len(), 3);
        assert_eq!(metrics.snapshot().images_processed, 1);
    }

    #[test]
    fn test_single_without_leaves_is_empty_subject() {
        let blank = png(&RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])));
        let (coordinator, store, metrics) = coordinator(&[("blank.png", blank)]);

        assert!(matches!(
            coordinator.process_single("blank.png"),
            Outcome::EmptySubject { .. }
        ));
        assert!(store.saved.lock().is_empty());
        assert_eq!(metrics.snapshot().images_empty, 1);
    }

    #[test]
    fn test_single_fetch_and_decode_failures_are_input_errors() {
        let (coordinator, _, metrics) = coordinator(&[("text.png", b"not an image".to_vec())]);

        assert!(matches!(
            coordinator.process_single("missing.png"),
            Outcome::Failure { kind: FailureKind::Input, .. }
        ));
        assert!(matches!(
            coordinator.process_single("text.png"),
            Outcome::Failure { kind: FailureKind::Input, .. }
        ));
        assert_eq!(metrics.snapshot().fetch_failures, 2);
    }

    #[test]
    fn test_bulk_isolates_failures_and_keeps_order() {
        let (coordinator, _, _) = coordinator(&[("one.png", leaf_png()), ("three.png", leaf_png())]);
        let references = vec![
            "one.png".to_string(),
            "two.png".to_string(),
            "three.png".to_string(),
        ];

        let results = coordinator.process_bulk(&references);
        assert_eq!(results.len(), 3);
        let indices: Vec<_> = results.iter().map(|r| r.processing_index()).collect();
        assert_eq!(indices, vec![Some(1), Some(2), Some(3)]);

        match &results[1] {
            BatchItemResult::Error(err) => {
                assert_eq!(err.image_url, "two.png");
                assert!(!err.image_processed);
            }
            other => panic!("expected an error record, got {:?}", other),
        }
        match &results[2] {
            BatchItemResult::Success(report) => {
                assert_eq!(report.image_url.as_deref(), Some("three.png"));
            }
            other => panic!("expected a report, got {:?}", other),
        }
        assert!(!results[0].is_error());
    }

    #[test]
    fn test_bulk_artifact_names_never_repeat() {
        let (coordinator, store, _) = coordinator(&[("a.png", leaf_png())]);
        let references = vec!["a.png".to_string(); 3];
        coordinator.process_bulk(&references);

        let saved = store.saved.lock();
        let unique: std::collections::HashSet<_> = saved.iter().collect();
        assert_eq!(saved.len(), 9);
        assert_eq!(unique.len(), 9);
    }
}
