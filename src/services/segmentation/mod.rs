// Promptable leaf segmentation (SAM encoder/decoder pair)
//
// The encoder embeds the whole image once; the decoder turns each positive
// point into candidate masks against those embeddings and keeps the best one.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use ort::value::Value;
use std::path::Path;
use tracing::{debug, instrument};

use crate::core::types::Point;
use crate::services::onnx_builder::SessionPool;

const ENCODER_SIZE: u32 = 1024;

/// Promptable segmenter collaborator.
///
/// `prepare` runs the image-level stage once; the returned handle answers any
/// number of point prompts on that image.
pub trait PromptSegmenter: Send + Sync {
    fn prepare<'a>(&'a self, image: &'a RgbImage) -> Result<Box<dyn PreparedImage + 'a>>;
}

/// One image ready for prompting: point -> binary mask (0/255) or absent.
pub trait PreparedImage {
    fn segment(&self, prompt: Point) -> Result<Option<GrayImage>>;
}

impl<F> PreparedImage for F
where
    F: Fn(Point) -> Result<Option<GrayImage>>,
{
    fn segment(&self, prompt: Point) -> Result<Option<GrayImage>> {
        self(prompt)
    }
}

/// Embeddings from encoder to pass to decoder
struct SamEmbeddings {
    image_embeddings: Array4<f32>,   // [1, 256, 64, 64]
    high_res_features1: Array4<f32>, // [1, 32, 256, 256]
    high_res_features2: Array4<f32>, // [1, 64, 128, 128]
}

pub struct SamSegmenter {
    encoder_pool: SessionPool,
    decoder_pool: SessionPool,
}

impl SamSegmenter {
    pub fn new(encoder_path: &Path, decoder_path: &Path, pool_size: usize) -> Result<Self> {
        let encoder_pool = SessionPool::from_file(encoder_path, "sam-encoder", pool_size)?;
        let decoder_pool = SessionPool::from_file(decoder_path, "sam-decoder", pool_size)?;
        Ok(Self {
            encoder_pool,
            decoder_pool,
        })
    }

    fn run_encoder(&self, img: &RgbImage) -> Result<SamEmbeddings> {
        let resized = image::imageops::resize(img, ENCODER_SIZE, ENCODER_SIZE, FilterType::Triangle);

        // [0, 1] NCHW
        let size = ENCODER_SIZE as usize;
        let mut input_array = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            input_array[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
            input_array[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
            input_array[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
        }
        let input_value = Value::from_array(input_array)?;

        let mut session = self.encoder_pool.acquire();
        let outputs = session.run(ort::inputs!["input" => input_value])?;

        let (_, img_emb_data) = outputs["image_embeddings"].try_extract_tensor::<f32>()?;
        let image_embeddings = Array4::from_shape_vec((1, 256, 64, 64), img_emb_data.to_vec())?;

        let (_, hr1_data) = outputs["high_res_features_0"].try_extract_tensor::<f32>()?;
        let high_res_features1 = Array4::from_shape_vec((1, 32, 256, 256), hr1_data.to_vec())?;

        let (_, hr2_data) = outputs["high_res_features_1"].try_extract_tensor::<f32>()?;
        let high_res_features2 = Array4::from_shape_vec((1, 64, 128, 128), hr2_data.to_vec())?;

        Ok(SamEmbeddings {
            image_embeddings,
            high_res_features1,
            high_res_features2,
        })
    }

    /// Returns masks [1, N, H, W] at the original image size and their IoU predictions.
    fn run_decoder(
        &self,
        embeddings: &SamEmbeddings,
        prompt: Point,
        width: u32,
        height: u32,
    ) -> Result<(Array4<f32>, Vec<f32>)> {
        // Point in encoder space, labelled foreground
        let scale_x = ENCODER_SIZE as f32 / width as f32;
        let scale_y = ENCODER_SIZE as f32 / height as f32;
        let point_coords = Array3::from_shape_vec((1, 1, 2), vec![prompt.x * scale_x, prompt.y * scale_y])?;
        let point_labels = Array2::from_shape_vec((1, 1), vec![1.0f32])?;

        let mask_input = Array4::<f32>::zeros((1, 1, 256, 256));
        let has_mask = Array1::<f32>::from_vec(vec![0.0]);
        let orig_size = Array1::<i64>::from_vec(vec![height as i64, width as i64]);

        let mut session = self.decoder_pool.acquire();
        let outputs = session.run(ort::inputs![
            "image_embeddings" => Value::from_array(embeddings.image_embeddings.clone())?,
            "high_res_features_0" => Value::from_array(embeddings.high_res_features1.clone())?,
            "high_res_features_1" => Value::from_array(embeddings.high_res_features2.clone())?,
            "point_coords" => Value::from_array(point_coords)?,
            "point_labels" => Value::from_array(point_labels)?,
            "mask_input" => Value::from_array(mask_input)?,
            "has_mask_input" => Value::from_array(has_mask)?,
            "orig_im_size" => Value::from_array(orig_size)?,
        ])?;

        let (masks_shape, masks_data) = outputs["masks"].try_extract_tensor::<f32>()?;
        let shape_slice: &[i64] = masks_shape.as_ref();
        anyhow::ensure!(shape_slice.len() == 4, "unexpected mask shape {:?}", shape_slice);
        let masks = Array4::from_shape_vec(
            (
                shape_slice[0] as usize,
                shape_slice[1] as usize,
                shape_slice[2] as usize,
                shape_slice[3] as usize,
            ),
            masks_data.to_vec(),
        )?;

        let (_, iou_data) = outputs["iou_predictions"].try_extract_tensor::<f32>()?;
        Ok((masks, iou_data.to_vec()))
    }
}

/// Pick the mask with the best predicted IoU and binarise it (logit > 0).
/// `None` when no mask has any foreground pixel.
pub fn best_mask(masks: &Array4<f32>, iou_scores: &[f32]) -> Option<GrayImage> {
    let candidates = masks.shape()[1];
    if masks.shape()[0] == 0 || candidates == 0 {
        return None;
    }
    let best_idx = iou_scores
        .iter()
        .take(candidates)
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .unwrap_or(0);

    let mask = masks.index_axis(Axis(0), 0);
    let mask = mask.index_axis(Axis(0), best_idx);
    let (h, w) = mask.dim();
    let binary = GrayImage::from_fn(w as u32, h as u32, |x, y| {
        Luma([if mask[[y as usize, x as usize]] > 0.0 { 255 } else { 0 }])
    });

    if binary.pixels().any(|p| p[0] > 0) {
        Some(binary)
    } else {
        None
    }
}

impl PromptSegmenter for SamSegmenter {
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    fn prepare<'a>(&'a self, image: &'a RgbImage) -> Result<Box<dyn PreparedImage + 'a>> {
        let start = std::time::Instant::now();
        let embeddings = self.run_encoder(image).context("SAM encoder failed")?;
        debug!("SAM: image encoded in {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);

        Ok(Box::new(SamPrepared {
            segmenter: self,
            embeddings,
            width: image.width(),
            height: image.height(),
        }))
    }
}

/// Encoder output for one image, reused by every prompt on it.
struct SamPrepared<'a> {
    segmenter: &'a SamSegmenter,
    embeddings: SamEmbeddings,
    width: u32,
    height: u32,
}

impl PreparedImage for SamPrepared<'_> {
    fn segment(&self, prompt: Point) -> Result<Option<GrayImage>> {
        let start = std::time::Instant::now();
        let (masks, iou_scores) = self
            .segmenter
            .run_decoder(&self.embeddings, prompt, self.width, self.height)
            .context("SAM decoder failed")?;

        let mask = best_mask(&masks, &iou_scores).filter(|m| m.dimensions() == (self.width, self.height));
        debug!(
            "SAM: point ({:.0}, {:.0}) → {} in {:.2}ms",
            prompt.x,
            prompt.y,
            if mask.is_some() { "mask" } else { "no mask" },
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(mask)
    }
}
