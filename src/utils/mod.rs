pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{apply_jet, blend, color_planes, decode_rgb, encode_jpeg, rgb_to_hsv, rgb_to_lab};
pub use metrics::Metrics;
