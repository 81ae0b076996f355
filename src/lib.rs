// Library exports for the grape leaf diagnosis workflow

// Core modules
pub mod core;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{ArtifactError, ConfigError, FetchError, ModelError, PipelineError, StatisticsError},
    types::{
        AnomalyResult, BatchItemResult, DiseaseMap, DiseaseRegionResult, FailureKind, ImageReport,
        LeafRecord, LeafReport, Outcome,
    },
};

pub use orchestration::BatchCoordinator;

pub use phases::{AnomalyScorer, DiseaseRegionSegmenter, FeatureStatistics, LeafExtractor, LeafPipeline};

pub use services::{
    ArtifactNamer, ArtifactStore, FeatureExtractor, ImageFetcher, ObjectDetector, PreparedImage, PromptSegmenter,
};

pub use utils::Metrics;
