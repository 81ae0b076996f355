// Pixel-accurate disease regions inside detector boxes
//
// Healthy reference tissue (green, outside every box) gives Lab/hue statistics;
// box pixels that drift far from it are diseased. Too little reference tissue
// falls back to a plain "not green" rule.

use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::{close, open};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array2;
use std::time::Instant;
use tracing::{debug, instrument};

use crate::core::config::SegmentationConfig;
use crate::core::disease_catalog::HsvRange;
use crate::core::types::{
    DiseaseCandidate, DiseaseCoverage, DiseaseRegionResult, PixelRect, ReferenceStats, SegmentationPath,
};
use crate::utils::image_ops::{color_planes, count_set};

/// Pure black (the masked-out surroundings of an extracted leaf).
pub const BACKGROUND_BAND: HsvRange = HsvRange::new((0, 1), (0, 1), (0, 1));
/// Plausibly healthy leaf tissue.
pub const GREEN_BAND: HsvRange = HsvRange::new((35, 85), (40, 255), (40, 255));

const HUE_RANGE: f32 = 180.0;

/// Per-pixel classification of one leaf image.
struct PixelPlanes {
    width: u32,
    height: u32,
    hue: Vec<u8>,
    lab: Vec<[f32; 3]>,
    background: Vec<bool>,
    green: Vec<bool>,
}

impl PixelPlanes {
    fn new(leaf: &RgbImage) -> Self {
        let (hsv, lab) = color_planes(leaf);
        Self {
            width: leaf.width(),
            height: leaf.height(),
            hue: hsv.iter().map(|p| p[0]).collect(),
            background: hsv.iter().map(|p| BACKGROUND_BAND.contains(*p)).collect(),
            green: hsv.iter().map(|p| GREEN_BAND.contains(*p)).collect(),
            lab,
        }
    }

    fn idx(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    fn background_mask(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.background[self.idx(x, y)] { 255 } else { 0 }])
        })
    }
}

pub struct DiseaseRegionSegmenter {
    params: SegmentationConfig,
}

impl DiseaseRegionSegmenter {
    pub fn new(params: SegmentationConfig) -> Self {
        Self { params }
    }

    /// Segment every candidate box on `leaf`. `None` when there are no candidates.
    #[instrument(skip(self, leaf, candidates), fields(candidates = candidates.len()))]
    pub fn segment(&self, leaf: &RgbImage, candidates: &[DiseaseCandidate]) -> Option<DiseaseRegionResult> {
        if candidates.is_empty() {
            return None;
        }
        let start = Instant::now();
        let planes = PixelPlanes::new(leaf);
        let (width, height) = (planes.width, planes.height);

        let rects: Vec<Option<PixelRect>> = candidates
            .iter()
            .map(|c| c.bbox.clamp_to(width, height))
            .collect();

        let in_any_box = |x: u32, y: u32| rects.iter().flatten().any(|r| r.contains(x, y));
        let mut reference_idx = Vec::new();
        for y in 0..height {
            for x in 0..width {
                let i = planes.idx(x, y);
                if !in_any_box(x, y) && !planes.background[i] && planes.green[i] {
                    reference_idx.push(i);
                }
            }
        }

        let total_leaf_pixels = planes.background.iter().filter(|b| !**b).count();
        let reference = if reference_idx.len() > self.params.min_reference_pixels {
            Some(reference_stats(&planes, &reference_idx))
        } else {
            None
        };
        let path = if reference.is_some() {
            SegmentationPath::Statistical
        } else {
            SegmentationPath::Simple
        };
        debug!(
            "{} reference pixels → {:?} path",
            reference_idx.len(),
            path
        );

        let mut disease_mask = GrayImage::new(width, height);
        let mut distance_heatmap = Array2::<f32>::zeros((height as usize, width as usize));
        let mut per_disease = Vec::with_capacity(candidates.len());

        for (candidate, rect) in candidates.iter().zip(&rects) {
            let Some(rect) = rect else {
                debug!("Skipping '{}': box lies outside the leaf", candidate.class_name);
                continue;
            };

            let region = match &reference {
                Some(stats) => self.statistical_region(&planes, rect, stats, &mut distance_heatmap),
                None => self.simple_region(&planes, rect),
            };

            let pixel_count = count_set(&region);
            for (x, y, p) in region.enumerate_pixels() {
                if p[0] > 0 {
                    disease_mask.put_pixel(rect.x0 + x, rect.y0 + y, Luma([255]));
                }
            }

            per_disease.push(DiseaseCoverage {
                name: candidate.class_name.clone(),
                detector_confidence: candidate.detector_confidence,
                pixel_count,
                percentage: percentage(pixel_count, total_leaf_pixels),
            });
        }

        let total_diseased_pixels = count_set(&disease_mask);
        debug!(
            "✓ {} diseased / {} leaf pixels ({:?}) in {:.2}ms",
            total_diseased_pixels,
            total_leaf_pixels,
            path,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Some(DiseaseRegionResult {
            disease_mask,
            per_disease,
            total_leaf_pixels,
            total_diseased_pixels,
            total_diseased_percentage: percentage(total_diseased_pixels, total_leaf_pixels),
            distance_heatmap,
            background_mask: planes.background_mask(),
            path,
            reference,
        })
    }

    /// Box-local mask from colour distance to the healthy reference.
    fn statistical_region(
        &self,
        planes: &PixelPlanes,
        rect: &PixelRect,
        stats: &ReferenceStats,
        distance_heatmap: &mut Array2<f32>,
    ) -> GrayImage {
        let mean_std = stats.lab_std.iter().sum::<f32>() / 3.0;
        let distance_threshold = self.params.std_multiplier * mean_std + self.params.distance_margin;

        let mut raw = GrayImage::new(rect.width(), rect.height());
        for (x, y, p) in raw.enumerate_pixels_mut() {
            let (gx, gy) = (rect.x0 + x, rect.y0 + y);
            let i = planes.idx(gx, gy);

            let lab = planes.lab[i];
            let distance = lab
                .iter()
                .zip(&stats.lab_mean)
                .map(|(v, m)| (v - m) * (v - m))
                .sum::<f32>()
                .sqrt();
            let cell = &mut distance_heatmap[[gy as usize, gx as usize]];
            *cell = cell.max(distance);

            if planes.green[i] || planes.background[i] {
                continue;
            }
            let d = (planes.hue[i] as f32 - stats.mean_hue).abs();
            let hue_diff = d.min(HUE_RANGE - d);
            if distance > distance_threshold || hue_diff > self.params.hue_threshold {
                *p = Luma([255]);
            }
        }

        let cleaned = close(&raw, Norm::LInf, 2);
        let cleaned = open(&cleaned, Norm::LInf, 1);
        let cleaned = median_filter(&cleaned, 2, 2);
        let mut cleaned = drop_small_components(&cleaned, self.params.min_component_area);
        clear_background(&mut cleaned, planes, rect);
        cleaned
    }

    /// Box-local mask of every non-green leaf pixel.
    fn simple_region(&self, planes: &PixelPlanes, rect: &PixelRect) -> GrayImage {
        let raw = GrayImage::from_fn(rect.width(), rect.height(), |x, y| {
            let i = planes.idx(rect.x0 + x, rect.y0 + y);
            Luma([if !planes.green[i] && !planes.background[i] { 255 } else { 0 }])
        });
        let cleaned = close(&raw, Norm::LInf, 2);
        let mut cleaned = median_filter(&cleaned, 2, 2);
        clear_background(&mut cleaned, planes, rect);
        cleaned
    }
}

fn reference_stats(planes: &PixelPlanes, indices: &[usize]) -> ReferenceStats {
    let n = indices.len() as f32;
    let mut mean = [0.0f32; 3];
    for &i in indices {
        for (c, m) in mean.iter_mut().enumerate() {
            *m += planes.lab[i][c];
        }
    }
    mean.iter_mut().for_each(|m| *m /= n);

    let mut var = [0.0f32; 3];
    for &i in indices {
        for (c, v) in var.iter_mut().enumerate() {
            let d = planes.lab[i][c] - mean[c];
            *v += d * d;
        }
    }

    ReferenceStats {
        lab_mean: mean,
        lab_std: var.map(|v| (v / n).sqrt()),
        mean_hue: indices.iter().map(|&i| planes.hue[i] as f32).sum::<f32>() / n,
        pixel_count: indices.len(),
    }
}

/// Remove 8-connected foreground components smaller than `min_area`.
fn drop_small_components(mask: &GrayImage, min_area: usize) -> GrayImage {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let max_label = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    let mut areas = vec![0usize; max_label + 1];
    for p in labels.pixels() {
        areas[p[0] as usize] += 1;
    }

    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        let label = labels.get_pixel(x, y)[0] as usize;
        Luma([if label != 0 && areas[label] >= min_area { 255 } else { 0 }])
    })
}

/// Morphology can grow into the black surroundings; keep the mask inside the leaf.
fn clear_background(mask: &mut GrayImage, planes: &PixelPlanes, rect: &PixelRect) {
    for (x, y, p) in mask.enumerate_pixels_mut() {
        if planes.background[planes.idx(rect.x0 + x, rect.y0 + y)] {
            *p = Luma([0]);
        }
    }
}

fn percentage(pixels: usize, total: usize) -> f32 {
    if total == 0 {
        0.0
    } else {
        pixels as f32 / total as f32 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BoundingBox;
    use image::Rgb;

    const GREEN: Rgb<u8> = Rgb([40, 160, 40]);
    const BROWN: Rgb<u8> = Rgb([120, 70, 20]);
    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn candidate(name: &str, confidence: f32, bbox: BoundingBox) -> DiseaseCandidate {
        DiseaseCandidate {
            bbox,
            class_name: name.to_string(),
            detector_confidence: confidence,
        }
    }

    fn segmenter() -> DiseaseRegionSegmenter {
        DiseaseRegionSegmenter::new(SegmentationConfig::default())
    }

    /// 40x40 green leaf with a brown 8x8 spot at (16..24, 16..24).
    fn spotted_leaf() -> RgbImage {
        RgbImage::from_fn(40, 40, |x, y| {
            if (16..24).contains(&x) && (16..24).contains(&y) {
                BROWN
            } else {
                GREEN
            }
        })
    }

    #[test]
    fn test_colour_bands() {
        use crate::utils::image_ops::rgb_to_hsv;
        assert!(GREEN_BAND.contains(rgb_to_hsv(&GREEN)));
        assert!(!GREEN_BAND.contains(rgb_to_hsv(&BROWN)));
        assert!(BACKGROUND_BAND.contains(rgb_to_hsv(&BLACK)));
        assert!(!BACKGROUND_BAND.contains(rgb_to_hsv(&BROWN)));
    }

    #[test]
    fn test_no_candidates_is_absent() {
        assert!(segmenter().segment(&spotted_leaf(), &[]).is_none());
    }

    #[test]
    fn test_statistical_path_finds_spot() {
        let leaf = spotted_leaf();
        let result = segmenter()
            .segment(
                &leaf,
                &[candidate("Black Rot", 0.9, BoundingBox::new(12.0, 12.0, 28.0, 28.0))],
            )
            .unwrap();

        assert_eq!(result.path, SegmentationPath::Statistical);
        let reference = result.reference.as_ref().unwrap();
        assert_eq!(reference.pixel_count, 40 * 40 - 16 * 16);
        assert!((reference.mean_hue - 60.0).abs() < 1.0);

        assert_eq!(result.total_leaf_pixels, 1600);
        let coverage = &result.per_disease[0];
        assert_eq!(coverage.name, "Black Rot");
        assert!(coverage.pixel_count >= 30 && coverage.pixel_count <= 64);
        assert_eq!(result.total_diseased_pixels, coverage.pixel_count);
        assert!((result.total_diseased_percentage - coverage.pixel_count as f32 / 16.0).abs() < 1e-4);

        // Healthy tissue inside the box stays clear, the spot centre is flagged
        assert_eq!(result.disease_mask.get_pixel(13, 13)[0], 0);
        assert_eq!(result.disease_mask.get_pixel(20, 20)[0], 255);
        assert!(result.distance_heatmap[[20, 20]] > result.distance_heatmap[[13, 13]]);
        assert_eq!(result.distance_heatmap[[0, 0]], 0.0);
    }

    #[test]
    fn test_hue_shift_alone_flags_pixels() {
        // A huge distance margin leaves only the hue test able to flag anything
        let hue_only = DiseaseRegionSegmenter::new(SegmentationConfig {
            distance_margin: 1000.0,
            ..SegmentationConfig::default()
        });
        // Dark green: outside the green band (V < 40) but the same hue as the reference
        let dark_green = Rgb([10, 35, 10]);
        let lesion = |colour: Rgb<u8>| {
            RgbImage::from_fn(40, 40, move |x, y| {
                if (15..25).contains(&x) && (15..25).contains(&y) {
                    colour
                } else {
                    GREEN
                }
            })
        };
        let boxes = [candidate("Leaf Blight", 0.7, BoundingBox::new(10.0, 10.0, 30.0, 30.0))];

        // brown sits 45 hue steps from the reference
        let result = hue_only.segment(&lesion(BROWN), &boxes).unwrap();
        assert_eq!(result.path, SegmentationPath::Statistical);
        assert!(result.total_diseased_pixels >= 64);
        assert_eq!(result.disease_mask.get_pixel(20, 20)[0], 255);

        let result = hue_only.segment(&lesion(dark_green), &boxes).unwrap();
        assert_eq!(result.path, SegmentationPath::Statistical);
        assert_eq!(result.total_diseased_pixels, 0);
    }

    #[test]
    fn test_small_specks_are_dropped() {
        let leaf = RgbImage::from_fn(40, 40, |x, y| {
            if (20..23).contains(&x) && (20..23).contains(&y) {
                BROWN
            } else {
                GREEN
            }
        });
        let result = segmenter()
            .segment(&leaf, &[candidate("Leaf Spot", 0.6, BoundingBox::new(10.0, 10.0, 30.0, 30.0))])
            .unwrap();
        assert_eq!(result.path, SegmentationPath::Statistical);
        assert_eq!(result.total_diseased_pixels, 0);
        assert_eq!(result.per_disease[0].percentage, 0.0);
    }

    #[test]
    fn test_forty_reference_pixels_uses_simple_path() {
        // 10x10 green leaf, box covers the left 6 columns: 40 reference pixels remain
        let leaf = RgbImage::from_fn(10, 10, |x, y| if x < 3 && y < 3 { BROWN } else { GREEN });
        let result = segmenter()
            .segment(&leaf, &[candidate("Esca", 0.5, BoundingBox::new(0.0, 0.0, 6.0, 10.0))])
            .unwrap();

        assert_eq!(result.path, SegmentationPath::Simple);
        assert!(result.reference.is_none());
        assert!(result.distance_heatmap.iter().all(|v| *v == 0.0));
        assert!(result.total_diseased_pixels <= result.total_leaf_pixels);
    }

    #[test]
    fn test_disease_mask_stays_inside_leaf() {
        // Left third is background; a brown band straddles the leaf edge
        let leaf = RgbImage::from_fn(60, 40, |x, y| {
            if x < 20 {
                BLACK
            } else if (18..32).contains(&y) && x < 36 {
                BROWN
            } else {
                GREEN
            }
        });
        let result = segmenter()
            .segment(&leaf, &[candidate("Black Rot", 0.8, BoundingBox::new(10.0, 12.0, 40.0, 36.0))])
            .unwrap();

        assert_eq!(result.total_leaf_pixels, 40 * 40);
        assert!(result.total_diseased_pixels > 0);
        assert!(result.total_diseased_pixels <= result.total_leaf_pixels);
        for (x, y, p) in result.disease_mask.enumerate_pixels() {
            if p[0] > 0 {
                assert_eq!(result.background_mask.get_pixel(x, y)[0], 0, "({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_all_background_reports_zero_percentages() {
        let leaf = RgbImage::from_pixel(20, 20, BLACK);
        let result = segmenter()
            .segment(&leaf, &[candidate("Anthracnose", 0.7, BoundingBox::new(2.0, 2.0, 18.0, 18.0))])
            .unwrap();
        assert_eq!(result.total_leaf_pixels, 0);
        assert_eq!(result.total_diseased_pixels, 0);
        assert_eq!(result.total_diseased_percentage, 0.0);
        assert_eq!(result.per_disease[0].percentage, 0.0);
    }

    #[test]
    fn test_union_over_overlapping_boxes() {
        let leaf = spotted_leaf();
        let result = segmenter()
            .segment(
                &leaf,
                &[
                    candidate("Black Rot", 0.9, BoundingBox::new(12.0, 12.0, 28.0, 28.0)),
                    candidate("Leaf Spot", 0.4, BoundingBox::new(14.0, 14.0, 26.0, 26.0)),
                ],
            )
            .unwrap();
        assert_eq!(result.per_disease.len(), 2);
        let largest = result.per_disease.iter().map(|d| d.pixel_count).max().unwrap();
        assert!(result.total_diseased_pixels >= largest);
        assert!(result.total_diseased_pixels <= 64);
    }

    #[test]
    fn test_box_outside_leaf_is_skipped() {
        let result = segmenter()
            .segment(
                &spotted_leaf(),
                &[candidate("Esca", 0.5, BoundingBox::new(100.0, 100.0, 120.0, 120.0))],
            )
            .unwrap();
        assert!(result.per_disease.is_empty());
        assert_eq!(result.total_diseased_pixels, 0);
    }
}
