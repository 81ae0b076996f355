pub mod config;
pub mod disease_catalog;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::{Config, SegmentationConfig};
pub use disease_catalog::{DiseaseCatalog, DiseaseProfile, Severity};
pub use errors::{
    ArtifactError, ConfigError, FetchError, ModelError, PipelineError, StatisticsError,
};
pub use types::{
    AnomalyResult, BatchItemResult, BoundingBox, DiseaseCandidate, DiseaseEntry, DiseaseMap,
    DiseaseRegionResult, FailureKind, FeatureMap, ImageReport, LeafImage, LeafRecord, Outcome,
};
