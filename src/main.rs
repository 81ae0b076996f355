// Main entry point for the grape leaf diagnosis service

use grape_leaf_workflow::{
    core::{types::timestamp_now, Config},
    orchestration::BatchCoordinator,
    utils::Metrics,
    FailureKind, ImageReport, Outcome,
};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    coordinator: Arc<BatchCoordinator>,
    metrics: Metrics,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "grape_leaf_workflow={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== GRAPE LEAF DISEASE DIAGNOSIS ===");
    info!(
        "Config: models={} detector_input={} heatmap_grid={} pool={}",
        config.models.feature_statistics_path.parent().map(|p| p.display().to_string()).unwrap_or_default(),
        config.detector_input_size(),
        config.heatmap_grid_size(),
        config.onnx_pool_size()
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Model loading and the blocking HTTP client stay off the async runtime
    info!("Initializing batch coordinator...");
    let coordinator = {
        let config = config.clone();
        let metrics = metrics.clone();
        tokio::task::spawn_blocking(move || BatchCoordinator::from_config(&config, metrics)).await??
    };

    let state = AppState {
        config: config.clone(),
        coordinator: Arc::new(coordinator),
        metrics,
    };

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    let app = router(state);

    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                       - Root endpoint");
    info!("  GET  /health                 - Health check");
    info!("  GET  /metrics                - Prometheus metrics");
    info!("  GET  /stats                  - Detailed statistics");
    info!("  GET  /api/process?url=<ref>  - Diagnose one image");
    info!("  GET  /api/process?urls=a,b   - Diagnose several images in order");
    info!("  GET  /static/<name>          - Published leaf/heatmap/overlay images");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let static_files = ServeDir::new(state.config.static_dir());

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/api/process", get(process))
        .nest_service("/static", static_files)
        .with_state(state)
        .layer(cors)
}

async fn root() -> &'static str {
    "Grape Leaf Disease Diagnosis Service"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.coordinator.backend_type(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot)
        .map(Json)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize metrics: {}", e),
            )
        })
}

#[derive(Debug, Default, Deserialize)]
struct ProcessParams {
    url: Option<String>,
    urls: Option<String>,
}

/// Error envelope for single-image requests
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
    timestamp: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: message.into(),
        status: status.as_u16(),
        timestamp: timestamp_now(),
    };
    (status, Json(body)).into_response()
}

fn outcome_response(outcome: Outcome<ImageReport>) -> Response {
    match outcome {
        Outcome::Success(report) => (StatusCode::OK, Json(report)).into_response(),
        Outcome::EmptySubject { reason } => error_response(StatusCode::NOT_FOUND, reason),
        Outcome::Failure {
            kind: FailureKind::Input,
            message,
        } => error_response(StatusCode::BAD_REQUEST, message),
        Outcome::Failure {
            kind: FailureKind::Processing,
            message,
        } => error_response(StatusCode::INTERNAL_SERVER_ERROR, message),
    }
}

/// Comma-separated references, trimmed, blanks dropped.
fn parse_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Diagnose one image (`url`) or several in order (`urls`).
///
/// # Response:
/// - single: per-image report, or `{error, status, timestamp}` with 400 / 404 / 500
/// - bulk: ordered list of per-image reports and error records, always 200
async fn process(State(state): State<AppState>, Query(params): Query<ProcessParams>) -> Response {
    let start_time = Instant::now();
    state.metrics.record_endpoint_request("/api/process");

    let response = if let Some(urls) = params.urls {
        let references = parse_urls(&urls);
        if references.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "No valid URLs provided in urls parameter");
        }
        info!("🖼️ Processing {} images in bulk", references.len());

        let coordinator = state.coordinator.clone();
        match tokio::task::spawn_blocking(move || coordinator.process_bulk(&references)).await {
            Ok(results) => (StatusCode::OK, Json(results)).into_response(),
            Err(e) => {
                error!("Bulk worker failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Worker task failed: {}", e))
            }
        }
    } else if let Some(url) = params.url.filter(|u| !u.trim().is_empty()) {
        info!("🖼️ Processing single image: {}", url);

        let coordinator = state.coordinator.clone();
        match tokio::task::spawn_blocking(move || coordinator.process_single(&url)).await {
            Ok(outcome) => outcome_response(outcome),
            Err(e) => {
                error!("Worker failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("Worker task failed: {}", e))
            }
        }
    } else {
        warn!("Request without url or urls parameter");
        error_response(StatusCode::BAD_REQUEST, "Missing url or urls parameter")
    };

    state.metrics.record_request_duration(start_time.elapsed());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use grape_leaf_workflow::core::types::LeafSummary;

    fn report() -> ImageReport {
        ImageReport {
            leafs: vec![],
            summary: LeafSummary::default(),
            timestamp: timestamp_now(),
            image_processed: true,
            image_url: None,
            processing_index: None,
        }
    }

    #[test]
    fn test_parse_urls() {
        assert_eq!(
            parse_urls(" a.jpg, ,b.png ,"),
            vec!["a.jpg".to_string(), "b.png".to_string()]
        );
        assert!(parse_urls(" , ").is_empty());
    }

    #[test]
    fn test_outcome_status_codes() {
        assert_eq!(outcome_response(Outcome::Success(report())).status(), StatusCode::OK);
        assert_eq!(
            outcome_response(Outcome::EmptySubject {
                reason: "No grape leaves detected in the image".to_string()
            })
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            outcome_response(Outcome::Failure {
                kind: FailureKind::Input,
                message: "Failed to download image".to_string()
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            outcome_response(Outcome::Failure {
                kind: FailureKind::Processing,
                message: "Leaf detection failed".to_string()
            })
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let response = error_response(StatusCode::NOT_FOUND, "No grape leaves detected in the image");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "No grape leaves detected in the image");
        assert_eq!(body["status"], 404);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_root_banner() {
        assert!(root().await.contains("Grape Leaf"));
    }
}
