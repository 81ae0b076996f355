// Leaf extraction: detector boxes -> point-prompted masks -> black-background crops

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{ModelError, ModelResult};
use crate::core::types::{LeafImage, PixelRect};
use crate::services::detection::ObjectDetector;
use crate::services::segmentation::PromptSegmenter;

pub struct LeafExtractor {
    detector: Arc<dyn ObjectDetector>,
    segmenter: Arc<dyn PromptSegmenter>,
    padding: u32,
}

impl LeafExtractor {
    pub fn new(detector: Arc<dyn ObjectDetector>, segmenter: Arc<dyn PromptSegmenter>, padding: u32) -> Self {
        Self {
            detector,
            segmenter,
            padding,
        }
    }

    /// Every leaf found in `image`, in detection order.
    ///
    /// The segmenter encodes the image once and answers one prompt per leaf.
    /// A leaf whose mask cannot be produced is skipped; a detector or encoder
    /// failure fails the whole image.
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn extract(&self, image: &RgbImage) -> ModelResult<Vec<LeafImage>> {
        let start = Instant::now();
        let detections = self
            .detector
            .detect(image)
            .map_err(|e| ModelError::DetectionFailed(format!("{:#}", e)))?;
        debug!("Detected {} leaf candidates", detections.len());
        if detections.is_empty() {
            return Ok(vec![]);
        }

        let prepared = self
            .segmenter
            .prepare(image)
            .map_err(|e| ModelError::SegmentationFailed(format!("{:#}", e)))?;

        let mut leaves = Vec::with_capacity(detections.len());
        for (index, detection) in detections.into_iter().enumerate() {
            let center = detection.bbox.center();
            let mask = match prepared.segment(center) {
                Ok(Some(mask)) => mask,
                Ok(None) => {
                    debug!("Leaf {}: segmenter produced an empty mask, skipping", index);
                    continue;
                }
                Err(e) => {
                    warn!("Leaf {}: segmentation failed, skipping: {:#}", index, e);
                    continue;
                }
            };
            if mask.dimensions() != image.dimensions() {
                warn!(
                    "Leaf {}: mask is {:?}, image is {:?}; skipping",
                    index,
                    mask.dimensions(),
                    image.dimensions()
                );
                continue;
            }

            let Some(crop) = largest_component_bounds(&mask)
                .map(|r| pad_rect(r, self.padding, image.width(), image.height()))
            else {
                continue;
            };

            leaves.push(LeafImage {
                index,
                image: masked_crop(image, &mask, &crop),
                bbox: detection.bbox,
                center,
            });
        }

        info!(
            "✓ Extracted {} leaves in {:.2}ms",
            leaves.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(leaves)
    }
}

/// Bounding rectangle of the largest 8-connected foreground component.
pub fn largest_component_bounds(mask: &GrayImage) -> Option<PixelRect> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let max_label = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if max_label == 0 {
        return None;
    }

    let mut areas = vec![0usize; max_label + 1];
    for p in labels.pixels() {
        areas[p[0] as usize] += 1;
    }
    let (best, _) = areas
        .iter()
        .enumerate()
        .skip(1)
        .max_by_key(|(label, area)| (**area, std::cmp::Reverse(*label)))?;
    let best = best as u32;

    let mut rect: Option<PixelRect> = None;
    for (x, y, p) in labels.enumerate_pixels() {
        if p[0] != best {
            continue;
        }
        rect = Some(match rect {
            None => PixelRect { x0: x, y0: y, x1: x + 1, y1: y + 1 },
            Some(r) => PixelRect {
                x0: r.x0.min(x),
                y0: r.y0.min(y),
                x1: r.x1.max(x + 1),
                y1: r.y1.max(y + 1),
            },
        });
    }
    rect
}

fn pad_rect(rect: PixelRect, padding: u32, width: u32, height: u32) -> PixelRect {
    PixelRect {
        x0: rect.x0.saturating_sub(padding),
        y0: rect.y0.saturating_sub(padding),
        x1: (rect.x1 + padding).min(width),
        y1: (rect.y1 + padding).min(height),
    }
}

fn masked_crop(image: &RgbImage, mask: &GrayImage, crop: &PixelRect) -> RgbImage {
    RgbImage::from_fn(crop.width(), crop.height(), |x, y| {
        let (sx, sy) = (crop.x0 + x, crop.y0 + y);
        if mask.get_pixel(sx, sy)[0] > 0 {
            *image.get_pixel(sx, sy)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BoundingBox, Detection, Point};
    use crate::services::segmentation::PreparedImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDetector(anyhow::Result<Vec<Detection>>);

    impl ObjectDetector for FixedDetector {
        fn detect(&self, _image: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            match &self.0 {
                Ok(d) => Ok(d.clone()),
                Err(e) => anyhow::bail!("{}", e),
            }
        }
    }

    /// Marks a 10x10 square centred on the prompt; fails for prompts left of `fail_below_x`.
    struct SquareSegmenter {
        fail_below_x: f32,
        encodes: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SquareSegmenter {
        fn new(fail_below_x: f32) -> Self {
            Self {
                fail_below_x,
                encodes: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PromptSegmenter for SquareSegmenter {
        fn prepare<'a>(&'a self, image: &'a RgbImage) -> anyhow::Result<Box<dyn PreparedImage + 'a>> {
            self.encodes.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(move |prompt: Point| -> anyhow::Result<Option<GrayImage>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if prompt.x < self.fail_below_x {
                    anyhow::bail!("decoder crashed");
                }
                let (cx, cy) = (prompt.x as i64, prompt.y as i64);
                Ok(Some(GrayImage::from_fn(image.width(), image.height(), |x, y| {
                    let inside = (x as i64 - cx).abs() < 5 && (y as i64 - cy).abs() < 5;
                    Luma([if inside { 255 } else { 0 }])
                })))
            }))
        }
    }

    struct BrokenEncoder;

    impl PromptSegmenter for BrokenEncoder {
        fn prepare<'a>(&'a self, _image: &'a RgbImage) -> anyhow::Result<Box<dyn PreparedImage + 'a>> {
            anyhow::bail!("encoder out of memory")
        }
    }

    fn leaf_detection(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_id: 0,
            class_name: "leaf".to_string(),
            confidence: 0.9,
        }
    }

    fn source() -> RgbImage {
        RgbImage::from_pixel(100, 60, Rgb([30, 150, 40]))
    }

    #[test]
    fn test_crops_with_padding_and_black_background() {
        let extractor = LeafExtractor::new(
            Arc::new(FixedDetector(Ok(vec![leaf_detection(40.0, 20.0, 60.0, 40.0)]))),
            Arc::new(SquareSegmenter::new(0.0)),
            3,
        );

        let leaves = extractor.extract(&source()).unwrap();
        assert_eq!(leaves.len(), 1);
        let leaf = &leaves[0];
        assert_eq!(leaf.index, 0);
        assert_eq!(leaf.center, Point { x: 50.0, y: 30.0 });
        // mask spans 46..55 in both axes (9 px), plus 3 px padding each side
        assert_eq!(leaf.image.dimensions(), (15, 15));
        assert_eq!(*leaf.image.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*leaf.image.get_pixel(7, 7), Rgb([30, 150, 40]));
    }

    #[test]
    fn test_padding_is_clamped_to_image() {
        let extractor = LeafExtractor::new(
            Arc::new(FixedDetector(Ok(vec![leaf_detection(0.0, 0.0, 4.0, 4.0)]))),
            Arc::new(SquareSegmenter::new(-1.0)),
            10,
        );
        let leaves = extractor.extract(&source()).unwrap();
        // mask covers 0..7 in both axes, padding stops at the image edge
        assert_eq!(leaves[0].image.dimensions(), (17, 17));
    }

    #[test]
    fn test_failed_leaf_is_skipped_and_indices_kept() {
        let segmenter = Arc::new(SquareSegmenter::new(30.0));
        let extractor = LeafExtractor::new(
            Arc::new(FixedDetector(Ok(vec![
                leaf_detection(0.0, 0.0, 20.0, 20.0),
                leaf_detection(60.0, 20.0, 80.0, 40.0),
            ]))),
            segmenter.clone(),
            10,
        );

        let leaves = extractor.extract(&source()).unwrap();
        // one encoder pass serves both prompts
        assert_eq!(segmenter.encodes.load(Ordering::SeqCst), 1);
        assert_eq!(segmenter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].index, 1);
    }

    #[test]
    fn test_detector_failure_is_an_error() {
        let extractor = LeafExtractor::new(
            Arc::new(FixedDetector(Err(anyhow::anyhow!("session lost")))),
            Arc::new(SquareSegmenter::new(0.0)),
            10,
        );
        assert!(matches!(
            extractor.extract(&source()),
            Err(ModelError::DetectionFailed(_))
        ));
    }

    #[test]
    fn test_encoder_failure_is_an_error() {
        let extractor = LeafExtractor::new(
            Arc::new(FixedDetector(Ok(vec![leaf_detection(40.0, 20.0, 60.0, 40.0)]))),
            Arc::new(BrokenEncoder),
            10,
        );
        assert!(matches!(
            extractor.extract(&source()),
            Err(ModelError::SegmentationFailed(_))
        ));
    }

    #[test]
    fn test_no_detections_yields_no_leaves() {
        let extractor = LeafExtractor::new(
            Arc::new(FixedDetector(Ok(vec![]))),
            Arc::new(SquareSegmenter::new(0.0)),
            10,
        );
        assert!(extractor.extract(&source()).unwrap().is_empty());
    }

    #[test]
    fn test_largest_component_wins() {
        let mask = GrayImage::from_fn(30, 30, |x, y| {
            let small = x < 2 && y < 2;
            let large = (10..20).contains(&x) && (12..18).contains(&y);
            Luma([if small || large { 255 } else { 0 }])
        });
        assert_eq!(
            largest_component_bounds(&mask),
            Some(PixelRect { x0: 10, y0: 12, x1: 20, y1: 18 })
        );
        assert_eq!(largest_component_bounds(&GrayImage::new(5, 5)), None);
    }
}
