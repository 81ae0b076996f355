use crate::core::errors::ConfigError;
use std::env;
use std::path::{Path, PathBuf};
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Model file locations
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub leaf_detector_path: PathBuf,
    pub leaf_segmenter_encoder_path: PathBuf,
    pub leaf_segmenter_decoder_path: PathBuf,
    pub feature_extractor_path: PathBuf,
    pub feature_statistics_path: PathBuf,
    pub disease_detector_path: PathBuf,
    /// Class index -> disease name override; the detector's embedded names are used when unset
    pub disease_class_names: Option<Vec<String>>,
    /// Number of ONNX sessions per model
    pub onnx_pool_size: usize,
}

/// Detector thresholds
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub leaf_confidence_threshold: f32,
    pub leaf_iou_threshold: f32,
    pub disease_confidence_threshold: f32,
    pub disease_iou_threshold: f32,
    pub input_size: u32,
    /// Padding around the largest mask component when cropping a leaf
    pub leaf_crop_padding: u32,
}

/// Anomaly heatmap configuration
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub heatmap_grid_size: usize,
}

/// Statistical thresholds for disease region segmentation.
///
/// The defaults are the empirically calibrated values; every knob can be
/// overridden from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationConfig {
    /// Multiplier applied to the mean reference Lab std
    pub std_multiplier: f32,
    /// Constant added to the Lab distance threshold
    pub distance_margin: f32,
    /// Circular hue difference threshold (OpenCV hue units, 0..180)
    pub hue_threshold: f32,
    /// Healthy reference pixels required for the statistical path (exclusive)
    pub min_reference_pixels: usize,
    /// Connected components below this area are discarded
    pub min_component_area: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            std_multiplier: 1.5,
            distance_margin: 10.0,
            hue_threshold: 15.0,
            min_reference_pixels: 50,
            min_component_area: 30,
        }
    }
}

/// Remote image fetching
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout_seconds: u64,
}

/// Published artifacts (leaf, heatmap, overlay JPEGs)
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub static_dir: PathBuf,
    pub public_base_url: String,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub models: ModelConfig,
    pub detection: DetectionConfig,
    pub anomaly: AnomalyConfig,
    pub segmentation: SegmentationConfig,
    pub fetch: FetchConfig,
    pub artifacts: ArtifactConfig,
}

/// Parse an environment variable, falling back to `default` when unset or malformed.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let port: u16 = env_or("SERVER_PORT", 8888);
        let model_dir = PathBuf::from(env::var("MODEL_DIR").unwrap_or_else(|_| "models".to_string()));
        let model_path = |key: &str, file: &str| {
            env::var(key)
                .map(PathBuf::from)
                .unwrap_or_else(|_| model_dir.join(file))
        };

        let disease_class_names = env::var("DISEASE_CLASS_NAMES")
            .ok()
            .map(|names| {
                names
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty());

        Ok(Self {
            server: ServerConfig {
                port,
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            models: ModelConfig {
                leaf_detector_path: model_path("LEAF_DETECTOR_MODEL_PATH", "leaf_detector.onnx"),
                leaf_segmenter_encoder_path: model_path("LEAF_SEGMENTER_ENCODER_PATH", "sam_encoder.onnx"),
                leaf_segmenter_decoder_path: model_path("LEAF_SEGMENTER_DECODER_PATH", "sam_decoder.onnx"),
                feature_extractor_path: model_path("FEATURE_EXTRACTOR_MODEL_PATH", "feature_extractor.onnx"),
                feature_statistics_path: model_path("FEATURE_STATISTICS_PATH", "feature_statistics.json"),
                disease_detector_path: model_path("DISEASE_DETECTOR_MODEL_PATH", "disease_detector.onnx"),
                disease_class_names,
                onnx_pool_size: env::var("ONNX_POOL_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| std::cmp::max(num_cpus::get() / 2, 2)),
            },
            detection: DetectionConfig {
                leaf_confidence_threshold: env_or("LEAF_CONFIDENCE_THRESHOLD", 0.25),
                leaf_iou_threshold: env_or("LEAF_IOU_THRESHOLD", 0.4),
                disease_confidence_threshold: env_or("DISEASE_CONFIDENCE_THRESHOLD", 0.25),
                disease_iou_threshold: env_or("DISEASE_IOU_THRESHOLD", 0.7),
                input_size: env_or("DETECTOR_INPUT_SIZE", 640),
                leaf_crop_padding: env_or("LEAF_CROP_PADDING", 10),
            },
            anomaly: AnomalyConfig {
                heatmap_grid_size: env_or("HEATMAP_GRID_SIZE", 28),
            },
            segmentation: SegmentationConfig {
                std_multiplier: env_or("SEG_STD_MULTIPLIER", 1.5),
                distance_margin: env_or("SEG_DISTANCE_MARGIN", 10.0),
                hue_threshold: env_or("SEG_HUE_THRESHOLD", 15.0),
                min_reference_pixels: env_or("SEG_MIN_REFERENCE_PIXELS", 50),
                min_component_area: env_or("SEG_MIN_COMPONENT_AREA", 30),
            },
            fetch: FetchConfig {
                timeout_seconds: env_or("FETCH_TIMEOUT_SECONDS", 30),
            },
            artifacts: ArtifactConfig {
                static_dir: PathBuf::from(env::var("STATIC_DIR").unwrap_or_else(|_| "static".to_string())),
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .map(|s| s.trim_end_matches('/').to_string())
                    .unwrap_or_else(|_| format!("http://localhost:{}", port)),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let detection = &self.detection;
        for threshold in [detection.leaf_confidence_threshold, detection.disease_confidence_threshold] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidConfidenceThreshold(threshold));
            }
        }
        for threshold in [detection.leaf_iou_threshold, detection.disease_iou_threshold] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidIoUThreshold(threshold));
            }
        }

        if !(320..=2048).contains(&detection.input_size) || detection.input_size % 32 != 0 {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "input_size must be a multiple of 32 between 320 and 2048, got {}",
                detection.input_size
            )));
        }

        if self.models.onnx_pool_size == 0 {
            return Err(ConfigError::InvalidDetectionConfig(
                "onnx_pool_size must be > 0".to_string(),
            ));
        }

        if !(2..=256).contains(&self.anomaly.heatmap_grid_size) {
            return Err(ConfigError::InvalidAnomalyConfig(format!(
                "heatmap_grid_size must be between 2 and 256, got {}",
                self.anomaly.heatmap_grid_size
            )));
        }

        let seg = &self.segmentation;
        if !(seg.std_multiplier.is_finite() && seg.std_multiplier >= 0.0) {
            return Err(ConfigError::InvalidSegmentationConfig(format!(
                "std_multiplier must be a non-negative number, got {}",
                seg.std_multiplier
            )));
        }
        if !seg.distance_margin.is_finite() {
            return Err(ConfigError::InvalidSegmentationConfig(format!(
                "distance_margin must be finite, got {}",
                seg.distance_margin
            )));
        }
        if !(0.0..=90.0).contains(&seg.hue_threshold) {
            return Err(ConfigError::InvalidSegmentationConfig(format!(
                "hue_threshold must be between 0 and 90, got {}",
                seg.hue_threshold
            )));
        }

        if self.fetch.timeout_seconds == 0 {
            return Err(ConfigError::InvalidFetchConfig(
                "fetch timeout must be > 0 seconds".to_string(),
            ));
        }

        // Static directory is created on startup, but its parent must exist
        let static_dir: &Path = &self.artifacts.static_dir;
        if let Some(parent) = static_dir.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidStaticDir(format!(
                    "Parent directory does not exist: {}",
                    parent.display()
                )));
            }
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.models.onnx_pool_size
    }

    pub fn detector_input_size(&self) -> u32 {
        self.detection.input_size
    }

    pub fn heatmap_grid_size(&self) -> usize {
        self.anomaly.heatmap_grid_size
    }

    pub fn fetch_timeout_seconds(&self) -> u64 {
        self.fetch.timeout_seconds
    }

    pub fn static_dir(&self) -> &Path {
        &self.artifacts.static_dir
    }

    pub fn public_base_url(&self) -> &str {
        &self.artifacts.public_base_url
    }
}

#[cfg(test)]
impl Config {
    /// Defaults without touching the process environment.
    pub fn for_tests() -> Self {
        Self {
            server: ServerConfig {
                port: 8888,
                host: "127.0.0.1".to_string(),
                log_level: Level::DEBUG,
            },
            models: ModelConfig {
                leaf_detector_path: PathBuf::from("models/leaf_detector.onnx"),
                leaf_segmenter_encoder_path: PathBuf::from("models/sam_encoder.onnx"),
                leaf_segmenter_decoder_path: PathBuf::from("models/sam_decoder.onnx"),
                feature_extractor_path: PathBuf::from("models/feature_extractor.onnx"),
                feature_statistics_path: PathBuf::from("models/feature_statistics.json"),
                disease_detector_path: PathBuf::from("models/disease_detector.onnx"),
                disease_class_names: None,
                onnx_pool_size: 2,
            },
            detection: DetectionConfig {
                leaf_confidence_threshold: 0.25,
                leaf_iou_threshold: 0.4,
                disease_confidence_threshold: 0.25,
                disease_iou_threshold: 0.7,
                input_size: 640,
                leaf_crop_padding: 10,
            },
            anomaly: AnomalyConfig { heatmap_grid_size: 28 },
            segmentation: SegmentationConfig::default(),
            fetch: FetchConfig { timeout_seconds: 30 },
            artifacts: ArtifactConfig {
                static_dir: PathBuf::from("static"),
                public_base_url: "http://localhost:8888".to_string(),
            },
        }
    }
}
