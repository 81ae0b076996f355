// Typed errors for every stage of the leaf diagnosis workflow.
//
// Service adapters talk to ONNX Runtime through anyhow; the pipeline converts
// those into the enums below so that the HTTP layer can map them onto status codes.

use thiserror::Error;

/// Model inference errors raised by the ONNX-backed collaborators
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Leaf detection failed: {0}")]
    DetectionFailed(String),

    #[error("Leaf segmentation failed: {0}")]
    SegmentationFailed(String),

    #[error("Feature extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Feature extractor returned no map for layer '{0}'")]
    MissingLayer(String),

    #[error("Malformed feature map for layer '{layer}': {reason}")]
    MalformedFeatureMap { layer: String, reason: String },
}

/// Image fetch errors (always client-side input problems)
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Empty image reference")]
    EmptyReference,

    #[error("Unsupported image reference {0} (expected http://, https:// or file://)")]
    UnsupportedScheme(String),

    #[error("Local file not found: {0}")]
    NotFound(String),

    #[error("Unsupported image extension for {0} (allowed: jpg, jpeg, png, gif, bmp)")]
    UnsupportedExtension(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to download image: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download returned HTTP {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("URL does not point to an image (content-type: {0})")]
    NotAnImage(String),

    #[error("Unable to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Feature statistics loading errors
#[derive(Debug, Error)]
pub enum StatisticsError {
    #[error("Failed to read feature statistics from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Feature statistics are not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid feature statistics: {0}")]
    Invalid(String),
}

/// Artifact persistence errors
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to encode artifact {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to write artifact {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pipeline errors for a single source image
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl PipelineError {
    /// Fetch and decode problems are the caller's fault; everything else is ours.
    pub fn is_input_error(&self) -> bool {
        matches!(self, PipelineError::Fetch(_))
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid segmentation config: {0}")]
    InvalidSegmentationConfig(String),

    #[error("Invalid anomaly config: {0}")]
    InvalidAnomalyConfig(String),

    #[error("Invalid fetch config: {0}")]
    InvalidFetchConfig(String),

    #[error("Invalid static directory: {0}")]
    InvalidStaticDir(String),
}

pub type ModelResult<T> = Result<T, ModelError>;
pub type FetchResult<T> = Result<T, FetchError>;
pub type ArtifactResult<T> = Result<T, ArtifactError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
