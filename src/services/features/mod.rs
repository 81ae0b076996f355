// Deep feature extraction for anomaly scoring
//
// The backbone is exported to ONNX with one named output per hooked layer
// (e.g. `layer2`, `layer3`), each shaped [1, C, H, W].

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array3, Array4};
use ort::value::Value;
use std::path::Path;
use tracing::{debug, instrument};

use crate::core::types::FeatureMap;
use crate::services::onnx_builder::SessionPool;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Feature extractor collaborator. Must be deterministic for a given image and
/// return one map per requested layer, in request order.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &RgbImage, layers: &[String], input_size: u32) -> Result<Vec<FeatureMap>>;
}

pub struct OnnxFeatureExtractor {
    pool: SessionPool,
}

impl OnnxFeatureExtractor {
    pub fn new(model_path: &Path, pool_size: usize) -> Result<Self> {
        Ok(Self {
            pool: SessionPool::from_file(model_path, "feature-extractor", pool_size)?,
        })
    }
}

/// Resize to `size` x `size` and apply ImageNet normalisation, NCHW.
pub fn preprocess(img: &RgbImage, size: u32) -> Array4<f32> {
    let resized = image::imageops::resize(img, size, size, FilterType::Triangle);
    let size = size as usize;
    let mut array = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            array[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    array
}

impl FeatureExtractor for OnnxFeatureExtractor {
    #[instrument(skip(self, image, layers), fields(layers = layers.len()))]
    fn extract(&self, image: &RgbImage, layers: &[String], input_size: u32) -> Result<Vec<FeatureMap>> {
        let start = std::time::Instant::now();
        let input_value = Value::from_array(preprocess(image, input_size))?;

        let mut session = self.pool.acquire();
        let outputs = session.run(ort::inputs!["input" => input_value])?;

        let mut maps = Vec::with_capacity(layers.len());
        for layer in layers {
            let value = outputs
                .get(layer.as_str())
                .with_context(|| format!("feature extractor has no output named '{}'", layer))?;
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            let shape_slice: &[i64] = shape.as_ref();
            anyhow::ensure!(
                shape_slice.len() == 4 && shape_slice[0] == 1,
                "layer '{}' has unexpected shape {:?}",
                layer,
                shape_slice
            );
            let data = Array3::from_shape_vec(
                (
                    shape_slice[1] as usize,
                    shape_slice[2] as usize,
                    shape_slice[3] as usize,
                ),
                data.to_vec(),
            )?;
            maps.push(FeatureMap {
                layer: layer.clone(),
                data,
            });
        }

        debug!("✓ Extracted {} feature maps in {:.2}ms", maps.len(), start.elapsed().as_secs_f64() * 1000.0);
        Ok(maps)
    }
}
