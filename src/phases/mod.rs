pub mod anomaly;
pub mod disease_regions;
pub mod leaf_extraction;
pub mod leaf_pipeline;

pub use anomaly::{AnomalyScorer, FeatureStatistics};
pub use disease_regions::DiseaseRegionSegmenter;
pub use leaf_extraction::LeafExtractor;
pub use leaf_pipeline::{merge_diseases, LeafPipeline, LeafStage};
