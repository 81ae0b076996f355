// Leaf anomaly scoring: pooled deep features vs. a memory bank of healthy leaves
//
// Decision path: pool -> L2 normalise -> standardise -> mean k-NN distance.
// The heatmap is a best-effort by-product and never affects the decision.

use image::RgbImage;
use ndarray::{s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::errors::{ModelError, ModelResult, StatisticsError};
use crate::core::types::{AnomalyResult, FeatureMap};
use crate::services::features::FeatureExtractor;
use crate::utils::image_ops::{apply_jet, normalize_to_gray, resize_bilinear_chw, resize_gray};

const NORM_EPSILON: f32 = 1e-8;

/// On-disk layout of the learned statistics (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStatisticsFile {
    pub memory_bank: Vec<Vec<f32>>,
    pub feature_mean: Vec<f32>,
    pub feature_std: Vec<f32>,
    pub threshold: f32,
    pub num_neighbors: usize,
    #[serde(default)]
    pub backbone_name: String,
    pub layers: Vec<String>,
    pub image_size: u32,
}

/// Validated, immutable anomaly statistics shared by every request.
#[derive(Debug, Clone)]
pub struct FeatureStatistics {
    memory_bank: Array2<f32>,
    feature_mean: Vec<f32>,
    feature_std: Vec<f32>,
    threshold: f32,
    num_neighbors: usize,
    backbone_name: String,
    layers: Vec<String>,
    image_size: u32,
}

impl FeatureStatistics {
    pub fn load(path: &Path) -> Result<Self, StatisticsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| StatisticsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: FeatureStatisticsFile = serde_json::from_str(&raw)?;
        let stats = Self::from_file(file)?;
        info!(
            "Loaded feature statistics: backbone={}, layers={:?}, bank={}x{}, k={}, threshold={:.4}",
            if stats.backbone_name.is_empty() { "?" } else { stats.backbone_name.as_str() },
            stats.layers,
            stats.bank_size(),
            stats.dim(),
            stats.num_neighbors,
            stats.threshold
        );
        Ok(stats)
    }

    pub fn from_file(file: FeatureStatisticsFile) -> Result<Self, StatisticsError> {
        let invalid = |msg: String| Err(StatisticsError::Invalid(msg));

        let n = file.memory_bank.len();
        if n == 0 {
            return invalid("memory bank is empty".to_string());
        }
        let d = file.feature_mean.len();
        if d == 0 || file.feature_std.len() != d {
            return invalid(format!(
                "feature_mean ({}) and feature_std ({}) must share a non-zero length",
                d,
                file.feature_std.len()
            ));
        }
        if let Some(row) = file.memory_bank.iter().position(|r| r.len() != d) {
            return invalid(format!(
                "memory bank row {} has length {}, expected {}",
                row,
                file.memory_bank[row].len(),
                d
            ));
        }
        let all_finite = file
            .memory_bank
            .iter()
            .flatten()
            .chain(&file.feature_mean)
            .chain(&file.feature_std)
            .all(|v| v.is_finite());
        if !all_finite {
            return invalid("statistics contain non-finite values".to_string());
        }
        if !(file.threshold.is_finite() && file.threshold > 0.0) {
            return invalid(format!("threshold must be > 0, got {}", file.threshold));
        }
        if file.num_neighbors == 0 {
            return invalid("num_neighbors must be >= 1".to_string());
        }
        if file.layers.is_empty() {
            return invalid("no feature layers configured".to_string());
        }
        if file.image_size == 0 {
            return invalid("image_size must be > 0".to_string());
        }

        let num_neighbors = if file.num_neighbors > n {
            warn!(
                "num_neighbors ({}) exceeds memory bank size ({}); clamping",
                file.num_neighbors, n
            );
            n
        } else {
            file.num_neighbors
        };

        let flat: Vec<f32> = file.memory_bank.into_iter().flatten().collect();
        let memory_bank = Array2::from_shape_vec((n, d), flat)
            .map_err(|e| StatisticsError::Invalid(e.to_string()))?;

        Ok(Self {
            memory_bank,
            feature_mean: file.feature_mean,
            feature_std: file.feature_std,
            threshold: file.threshold,
            num_neighbors,
            backbone_name: file.backbone_name,
            layers: file.layers,
            image_size: file.image_size,
        })
    }

    /// Feature dimension D.
    pub fn dim(&self) -> usize {
        self.feature_mean.len()
    }

    pub fn bank_size(&self) -> usize {
        self.memory_bank.nrows()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Effective k, already clamped to the bank size.
    pub fn num_neighbors(&self) -> usize {
        self.num_neighbors
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn backbone_name(&self) -> &str {
        &self.backbone_name
    }

    /// L2 normalise then standardise a raw pooled vector; non-finite values become 0.
    pub fn prepare_query(&self, raw: &[f32]) -> Vec<f32> {
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPSILON);
        raw.iter()
            .zip(self.feature_mean.iter().zip(&self.feature_std))
            .map(|(v, (mean, std))| finite_or_zero((v / norm - mean) / std))
            .collect()
    }

    /// Mean Euclidean distance from an already prepared query to its k nearest bank vectors.
    pub fn knn_score(&self, query: &[f32]) -> f32 {
        mean_knn_distance(query, self.memory_bank.view(), self.num_neighbors)
    }

    /// `(is_diseased, confidence)` for a score.
    pub fn classify(&self, score: f32) -> (bool, f32) {
        let is_diseased = score > self.threshold;
        let confidence = ((score - self.threshold).abs() / self.threshold * 100.0).min(100.0);
        (is_diseased, confidence)
    }
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Mean distance to the `k` closest rows of `bank`. `bank` must have `query.len()` columns.
fn mean_knn_distance(query: &[f32], bank: ArrayView2<'_, f32>, k: usize) -> f32 {
    let mut distances: Vec<f32> = bank
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .zip(query)
                .map(|(b, q)| (q - b) * (q - b))
                .sum::<f32>()
                .sqrt()
        })
        .collect();

    let k = k.clamp(1, distances.len().max(1));
    if distances.is_empty() {
        return 0.0;
    }
    distances.select_nth_unstable_by(k - 1, |a, b| a.total_cmp(b));
    distances[..k].iter().sum::<f32>() / k as f32
}

/// Scores leaves against the healthy-leaf memory bank.
pub struct AnomalyScorer {
    statistics: Arc<FeatureStatistics>,
    extractor: Arc<dyn FeatureExtractor>,
    grid_size: usize,
}

impl AnomalyScorer {
    pub fn new(
        statistics: Arc<FeatureStatistics>,
        extractor: Arc<dyn FeatureExtractor>,
        grid_size: usize,
    ) -> Self {
        Self {
            statistics,
            extractor,
            grid_size,
        }
    }

    /// Average-pool every configured layer and concatenate in layer order.
    pub fn pooled_vector(&self, maps: &[FeatureMap]) -> ModelResult<Vec<f32>> {
        let stats = &self.statistics;
        let mut vector = Vec::with_capacity(stats.dim());

        for layer in stats.layers() {
            let map = maps
                .iter()
                .find(|m| &m.layer == layer)
                .ok_or_else(|| ModelError::MissingLayer(layer.clone()))?;
            let (channels, h, w) = map.data.dim();
            if channels == 0 || h == 0 || w == 0 {
                return Err(ModelError::MalformedFeatureMap {
                    layer: layer.clone(),
                    reason: format!("empty map {}x{}x{}", channels, h, w),
                });
            }
            let area = (h * w) as f32;
            vector.extend(
                map.data
                    .axis_iter(Axis(0))
                    .map(|plane| finite_or_zero(plane.sum() / area)),
            );
        }

        if vector.len() != stats.dim() {
            return Err(ModelError::MalformedFeatureMap {
                layer: stats.layers().join("+"),
                reason: format!(
                    "pooled vector has {} values, statistics expect {}",
                    vector.len(),
                    stats.dim()
                ),
            });
        }
        Ok(vector)
    }

    #[instrument(skip(self, leaf), fields(width = leaf.width(), height = leaf.height()))]
    pub fn score_leaf(&self, leaf: &RgbImage) -> ModelResult<AnomalyResult> {
        let start = Instant::now();
        let stats = &self.statistics;

        let maps = self
            .extractor
            .extract(leaf, stats.layers(), stats.image_size())
            .map_err(|e| ModelError::ExtractionFailed(format!("{:#}", e)))?;

        let pooled = self.pooled_vector(&maps)?;
        let query = stats.prepare_query(&pooled);
        let score = stats.knn_score(&query);
        let (is_diseased, confidence) = stats.classify(score);

        let heatmap = self.synthesize_heatmap(&maps, leaf.width(), leaf.height());
        if heatmap.is_none() {
            warn!("Heatmap synthesis failed; continuing without heatmap");
        }

        debug!(
            "✓ Anomaly score {:.4} (threshold {:.4}) → {} ({:.1}%) in {:.2}ms",
            score,
            stats.threshold(),
            if is_diseased { "diseased" } else { "healthy" },
            confidence,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(AnomalyResult {
            score,
            is_diseased,
            confidence,
            heatmap,
        })
    }

    /// Per-cell k-NN distance map, JET-coloured at `width` x `height`.
    ///
    /// Each layer's cells are compared against that layer's channel slice of the
    /// memory bank. Returns `None` when the layer widths do not tile the bank
    /// dimension or any intermediate value is unusable.
    pub fn synthesize_heatmap(&self, maps: &[FeatureMap], width: u32, height: u32) -> Option<RgbImage> {
        let stats = &self.statistics;
        let grid = self.grid_size;
        if width == 0 || height == 0 || grid == 0 {
            return None;
        }

        let layer_maps: Vec<&FeatureMap> = stats
            .layers()
            .iter()
            .map(|layer| maps.iter().find(|m| &m.layer == layer))
            .collect::<Option<_>>()?;

        let widths: Vec<usize> = layer_maps.iter().map(|m| m.data.dim().0).collect();
        if widths.iter().sum::<usize>() != stats.dim() || widths.contains(&0) {
            debug!("Layer widths {:?} do not tile bank dimension {}", widths, stats.dim());
            return None;
        }

        let d = stats.dim() as f32;
        let mean = stats.feature_mean.iter().sum::<f32>() / d;
        let std = stats.feature_std.iter().sum::<f32>() / d + NORM_EPSILON;
        let k = stats.num_neighbors();

        let mut combined = Array2::<f32>::zeros((grid, grid));
        let mut offset = 0;
        for (map, channels) in layer_maps.iter().zip(&widths) {
            let (_, h, w) = map.data.dim();
            if h == 0 || w == 0 {
                return None;
            }
            let resized = resize_bilinear_chw(&map.data, grid, grid);
            let bank = stats.memory_bank.slice(s![.., offset..offset + channels]);

            let cells: Vec<f32> = (0..grid * grid)
                .into_par_iter()
                .map(|idx| {
                    let (y, x) = (idx / grid, idx % grid);
                    let cell = resized.slice(s![.., y, x]);
                    let norm = cell.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPSILON);
                    let query: Vec<f32> = cell.iter().map(|v| (v / norm - mean) / std).collect();
                    mean_knn_distance(&query, bank, k)
                })
                .collect();

            for (idx, value) in cells.into_iter().enumerate() {
                combined[[idx / grid, idx % grid]] += value;
            }
            offset += channels;
        }
        combined /= layer_maps.len() as f32;

        if combined.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let gray = normalize_to_gray(&combined);
        Some(apply_jet(&resize_gray(&gray, width, height)))
    }
}
