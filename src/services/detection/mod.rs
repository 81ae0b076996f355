// YOLO-style ONNX detector used for both leaves and disease regions

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::value::Value;
use std::path::Path;
use tracing::{debug, info, instrument, trace};

use crate::core::types::{BoundingBox, Detection};
use crate::services::onnx_builder::SessionPool;

/// Object detector collaborator. An empty result is a valid outcome.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>>;
}

/// Thresholds applied after inference.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

/// Ultralytics YOLOv8 export: `images` [1,3,S,S] -> `output0` [1, 4 + classes, anchors]
/// with boxes as (cx, cy, w, h) in input pixels.
pub struct YoloDetector {
    pool: SessionPool,
    class_names: Vec<String>,
    settings: DetectorSettings,
}

impl YoloDetector {
    /// `class_names` overrides the `names` entry the exporter embeds in the model.
    /// Loading fails when neither is available.
    pub fn new(
        model_path: &Path,
        model_name: &str,
        class_names: Option<Vec<String>>,
        settings: DetectorSettings,
        pool_size: usize,
    ) -> Result<Self> {
        let pool = SessionPool::from_file(model_path, model_name, pool_size)?;
        let class_names = match class_names {
            Some(names) => names,
            None => {
                let raw = pool.metadata_entry("names")?.with_context(|| {
                    format!("{} model has no class names metadata; set them explicitly", model_name)
                })?;
                parse_class_names(&raw)
                    .with_context(|| format!("{} model has malformed names metadata: {}", model_name, raw))?
            }
        };
        info!("{} classes: {}", model_name, class_names.join(", "));

        Ok(Self {
            pool,
            class_names,
            settings,
        })
    }

    pub fn device_type(&self) -> &str {
        self.pool.backend()
    }

    fn preprocess_image(&self, img: &RgbImage) -> Array4<f32> {
        let target = self.settings.input_size;
        trace!("Preprocessing image: {}x{} → {}x{}", img.width(), img.height(), target, target);

        let resized = image::imageops::resize(img, target, target, FilterType::Triangle);
        let target = target as usize;
        let mut array = Array4::<f32>::zeros((1, 3, target, target));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }
        array
    }
}

/// Parse the exporter's `names` entry, a Python dict literal such as
/// `{0: 'Black Rot', 1: "Downy Mildew"}`, into names ordered by class id.
///
/// Ids must cover `0..n` exactly once.
pub fn parse_class_names(raw: &str) -> Option<Vec<String>> {
    let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut entries: Vec<(usize, String)> = Vec::new();
    let mut rest = body.trim_start();

    while !rest.is_empty() {
        let (id, after) = rest.split_once(':')?;
        let id: usize = id.trim().parse().ok()?;
        let after = after.trim_start();
        let quote = after.chars().next().filter(|c| *c == '\'' || *c == '"')?;
        let (name, after) = after[1..].split_once(quote)?;
        entries.push((id, name.to_string()));

        rest = after.trim_start();
        if let Some(next) = rest.strip_prefix(',') {
            rest = next.trim_start();
        } else if !rest.is_empty() {
            return None;
        }
    }

    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|(id, _)| *id);
    if entries.iter().enumerate().any(|(i, (id, _))| i != *id) {
        return None;
    }
    Some(entries.into_iter().map(|(_, name)| name).collect())
}

/// Turn the raw `[1, 4 + classes, anchors]` tensor into thresholded detections
/// in original image coordinates.
pub fn decode_yolo_output(
    shape: &[i64],
    data: &[f32],
    scale_x: f32,
    scale_y: f32,
    class_names: &[String],
    settings: &DetectorSettings,
) -> Result<Vec<Detection>> {
    anyhow::ensure!(
        shape.len() == 3 && shape[1] > 4,
        "unexpected detector output shape {:?}",
        shape
    );
    let rows = shape[1] as usize;
    let anchors = shape[2] as usize;
    anyhow::ensure!(data.len() >= rows * anchors, "detector output is truncated");

    let num_classes = rows - 4;
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];
    let mut detections = Vec::new();

    for a in 0..anchors {
        let (class_id, confidence) = (0..num_classes)
            .map(|c| (c, at(4 + c, a)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        if confidence < settings.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, a), at(1, a), at(2, a), at(3, a));
        detections.push(Detection {
            bbox: BoundingBox::new(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            ),
            class_id,
            class_name: class_names
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", class_id)),
            confidence,
        });
    }

    Ok(non_max_suppression(detections, settings.iou_threshold))
}

impl ObjectDetector for YoloDetector {
    #[instrument(skip(self, image), fields(model = self.pool.name(), width = image.width(), height = image.height()))]
    fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let start = std::time::Instant::now();
        let input = self.preprocess_image(image);
        let input_value = Value::from_array(input)?;

        let (shape, data) = {
            let mut session = self.pool.acquire();
            let outputs = session.run(ort::inputs!["images" => input_value])?;
            let (shape, data) = outputs["output0"]
                .try_extract_tensor::<f32>()
                .context("detector output0 is not an f32 tensor")?;
            let shape_slice: &[i64] = shape.as_ref();
            (shape_slice.to_vec(), data.to_vec())
        };

        let size = self.settings.input_size as f32;
        let detections = decode_yolo_output(
            &shape,
            &data,
            image.width() as f32 / size,
            image.height() as f32 / size,
            &self.class_names,
            &self.settings,
        )?;

        debug!(
            "✓ {} detections in {:.2}ms",
            detections.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(detections)
    }
}

/// Class-aware greedy NMS; output sorted by descending confidence.
pub fn non_max_suppression(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..sorted.len() {
            if !suppressed[j]
                && sorted[j].class_id == sorted[i].class_id
                && sorted[i].bbox.iou(&sorted[j].bbox) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
        keep.push(sorted[i].clone());
    }

    trace!("NMS: kept {}/{} detections", keep.len(), sorted.len());
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_id: usize, confidence: f32, x1: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, 0.0, x1 + 10.0, 10.0),
            class_id,
            class_name: format!("c{}", class_id),
            confidence,
        }
    }

    #[test]
    fn test_nms_suppresses_overlaps_within_class() {
        let kept = non_max_suppression(
            vec![det(0, 0.6, 1.0), det(0, 0.9, 0.0), det(0, 0.5, 50.0)],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.5);
    }

    #[test]
    fn test_nms_keeps_overlaps_across_classes() {
        let kept = non_max_suppression(vec![det(0, 0.9, 0.0), det(1, 0.8, 0.0)], 0.4);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_decode_scales_and_thresholds() {
        let settings = DetectorSettings {
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.4,
        };
        let names = vec!["leaf".to_string()];
        // rows: cx, cy, w, h, score; two anchors
        let data = vec![
            100.0, 300.0, // cx
            100.0, 300.0, // cy
            40.0, 40.0, // w
            20.0, 20.0, // h
            0.9, 0.1, // leaf score
        ];
        let detections =
            decode_yolo_output(&[1, 5, 2], &data, 2.0, 0.5, &names, &settings).unwrap();
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.class_name, "leaf");
        assert_eq!(d.bbox, BoundingBox::new(160.0, 45.0, 240.0, 55.0));
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let settings = DetectorSettings {
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.4,
        };
        assert!(decode_yolo_output(&[1, 3, 2], &[0.0; 6], 1.0, 1.0, &[], &settings).is_err());
    }

    #[test]
    fn test_parse_exported_class_names() {
        assert_eq!(
            parse_class_names("{0: 'Black Rot', 1: \"Downy Mildew\", 2: 'ESCA'}"),
            Some(vec![
                "Black Rot".to_string(),
                "Downy Mildew".to_string(),
                "ESCA".to_string()
            ])
        );
        // ids decide the order, not their position in the literal
        assert_eq!(
            parse_class_names("{1: 'b', 0: 'a',}"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_parse_rejects_malformed_class_names() {
        assert_eq!(parse_class_names(""), None);
        assert_eq!(parse_class_names("{}"), None);
        assert_eq!(parse_class_names("['a', 'b']"), None);
        assert_eq!(parse_class_names("{0: 'a', 2: 'c'}"), None);
        assert_eq!(parse_class_names("{0: 'a', 0: 'b'}"), None);
        assert_eq!(parse_class_names("{0: a}"), None);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(vec![], 0.5).is_empty());
    }
}
