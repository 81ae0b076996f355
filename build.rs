use std::env;

fn main() {
    // Models are loaded from MODEL_DIR at runtime; only report the inference backends compiled in.
    println!("cargo:rerun-if-changed=build.rs");

    let mut enabled_features = Vec::new();

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        enabled_features.push("CUDA");
    }
    if env::var("CARGO_FEATURE_TENSORRT").is_ok() {
        enabled_features.push("TensorRT");
    }

    if !enabled_features.is_empty() {
        println!("cargo:warning=GPU acceleration enabled: {}", enabled_features.join(", "));
    }

    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("windows-gnu") && enabled_features.contains(&"CUDA") {
        println!("cargo:warning=CUDA binaries may not be available for Windows GNU target");
    }
}
