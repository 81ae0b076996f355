pub mod artifacts;
pub mod detection;
pub mod features;
pub mod fetch;
pub mod onnx_builder;
pub mod segmentation;

pub use artifacts::{ArtifactNamer, ArtifactStore, StaticDirStore};
pub use detection::{DetectorSettings, ObjectDetector, YoloDetector};
pub use features::{FeatureExtractor, OnnxFeatureExtractor};
pub use fetch::{HttpImageFetcher, ImageFetcher};
pub use segmentation::{PreparedImage, PromptSegmenter, SamSegmenter};
