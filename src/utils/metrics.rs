use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Most recent samples kept per duration series.
const DURATION_WINDOW: usize = 1024;

/// Process-wide counters for the diagnosis service.
///
/// Cheap to clone; every clone shares the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Image outcomes
    images_processed: AtomicUsize,
    images_empty: AtomicUsize,
    images_failed: AtomicUsize,
    fetch_failures: AtomicUsize,

    // Leaf outcomes
    leaves_scored: AtomicUsize,
    leaves_diseased: AtomicUsize,
    segmentations_run: AtomicUsize,
    heatmap_failures: AtomicUsize,

    // Stage durations, last DURATION_WINDOW samples each
    scoring_duration_ms: RwLock<VecDeque<u64>>,
    segmentation_duration_ms: RwLock<VecDeque<u64>>,
    request_duration_ms: RwLock<VecDeque<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                images_processed: AtomicUsize::new(0),
                images_empty: AtomicUsize::new(0),
                images_failed: AtomicUsize::new(0),
                fetch_failures: AtomicUsize::new(0),
                leaves_scored: AtomicUsize::new(0),
                leaves_diseased: AtomicUsize::new(0),
                segmentations_run: AtomicUsize::new(0),
                heatmap_failures: AtomicUsize::new(0),
                scoring_duration_ms: RwLock::new(VecDeque::with_capacity(DURATION_WINDOW)),
                segmentation_duration_ms: RwLock::new(VecDeque::with_capacity(DURATION_WINDOW)),
                request_duration_ms: RwLock::new(VecDeque::with_capacity(DURATION_WINDOW)),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_image_processed(&self) {
        self.inner.images_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_image_empty(&self) {
        self.inner.images_empty.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_image_failed(&self, fetch_failure: bool) {
        self.inner.images_failed.fetch_add(1, Ordering::Relaxed);
        if fetch_failure {
            self.inner.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_leaf_scored(&self, diseased: bool, heatmap_ok: bool, duration: Duration) {
        self.inner.leaves_scored.fetch_add(1, Ordering::Relaxed);
        if diseased {
            self.inner.leaves_diseased.fetch_add(1, Ordering::Relaxed);
        }
        if !heatmap_ok {
            self.inner.heatmap_failures.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.inner.scoring_duration_ms, duration);
    }

    pub fn record_segmentation(&self, duration: Duration) {
        self.inner.segmentations_run.fetch_add(1, Ordering::Relaxed);
        push_sample(&self.inner.segmentation_duration_ms, duration);
    }

    pub fn record_request_duration(&self, duration: Duration) {
        push_sample(&self.inner.request_duration_ms, duration);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner.endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut scoring = self.inner.scoring_duration_ms.write();
        let scoring_avg = avg(scoring.make_contiguous());
        let scoring_p95 = percentile(scoring.make_contiguous(), 0.95);
        drop(scoring);

        let mut segmentation = self.inner.segmentation_duration_ms.write();
        let segmentation_avg = avg(segmentation.make_contiguous());
        drop(segmentation);

        let mut requests = self.inner.request_duration_ms.write();
        let requests = requests.make_contiguous();
        let request_avg = avg(requests);
        let request_p50 = percentile(requests, 0.5);
        let request_p95 = percentile(requests, 0.95);
        let request_p99 = percentile(requests, 0.99);

        let mut endpoint_requests: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        endpoint_requests.sort();

        let leaves_scored = self.inner.leaves_scored.load(Ordering::Relaxed);
        let leaves_diseased = self.inner.leaves_diseased.load(Ordering::Relaxed);
        let diseased_rate = if leaves_scored > 0 {
            leaves_diseased as f64 / leaves_scored as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            images_processed: self.inner.images_processed.load(Ordering::Relaxed),
            images_empty: self.inner.images_empty.load(Ordering::Relaxed),
            images_failed: self.inner.images_failed.load(Ordering::Relaxed),
            fetch_failures: self.inner.fetch_failures.load(Ordering::Relaxed),
            leaves_scored,
            leaves_diseased,
            diseased_rate,
            segmentations_run: self.inner.segmentations_run.load(Ordering::Relaxed),
            heatmap_failures: self.inner.heatmap_failures.load(Ordering::Relaxed),
            scoring_avg_ms: scoring_avg,
            scoring_p95_ms: scoring_p95,
            segmentation_avg_ms: segmentation_avg,
            request_avg_ms: request_avg,
            request_p50_ms: request_p50,
            request_p95_ms: request_p95,
            request_p99_ms: request_p99,
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP images_processed_total Images that produced a leaf report
# TYPE images_processed_total counter
images_processed_total {{}} {}

# HELP images_empty_total Images in which no leaf was found
# TYPE images_empty_total counter
images_empty_total {{}} {}

# HELP images_failed_total Images that failed to fetch or process
# TYPE images_failed_total counter
images_failed_total {{}} {}

# HELP fetch_failures_total Image references that could not be fetched
# TYPE fetch_failures_total counter
fetch_failures_total {{}} {}

# HELP leaves_scored_total Leaves passed through anomaly scoring
# TYPE leaves_scored_total counter
leaves_scored_total {{}} {}

# HELP leaves_diseased_total Leaves flagged as diseased
# TYPE leaves_diseased_total counter
leaves_diseased_total {{}} {}

# HELP segmentations_total Disease region segmentations run
# TYPE segmentations_total counter
segmentations_total {{}} {}

# HELP heatmap_failures_total Anomaly heatmaps that could not be synthesised
# TYPE heatmap_failures_total counter
heatmap_failures_total {{}} {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms {{stage="scoring"}} {}
stage_avg_duration_ms {{stage="segmentation"}} {}
stage_avg_duration_ms {{stage="request"}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}

# HELP endpoint_requests_total Requests per endpoint
# TYPE endpoint_requests_total counter
"#,
            snapshot.images_processed,
            snapshot.images_empty,
            snapshot.images_failed,
            snapshot.fetch_failures,
            snapshot.leaves_scored,
            snapshot.leaves_diseased,
            snapshot.segmentations_run,
            snapshot.heatmap_failures,
            snapshot.scoring_avg_ms,
            snapshot.segmentation_avg_ms,
            snapshot.request_avg_ms,
            snapshot.uptime_seconds,
        );
        for (endpoint, count) in &snapshot.endpoint_requests {
            out.push_str(&format!(
                "endpoint_requests_total {{endpoint=\"{}\"}} {}\n",
                endpoint, count
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub images_processed: usize,
    pub images_empty: usize,
    pub images_failed: usize,
    pub fetch_failures: usize,
    pub leaves_scored: usize,
    pub leaves_diseased: usize,
    pub diseased_rate: f64,
    pub segmentations_run: usize,
    pub heatmap_failures: usize,
    pub scoring_avg_ms: u64,
    pub scoring_p95_ms: u64,
    pub segmentation_avg_ms: u64,
    pub request_avg_ms: u64,
    pub request_p50_ms: u64,
    pub request_p95_ms: u64,
    pub request_p99_ms: u64,
    pub endpoint_requests: Vec<(String, usize)>,
    pub uptime_seconds: u64,
}

fn push_sample(window: &RwLock<VecDeque<u64>>, duration: Duration) {
    let mut samples = window.write();
    if samples.len() >= DURATION_WINDOW {
        samples.pop_front();
    }
    samples.push_back(duration.as_millis() as u64);
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_leaf_scored(true, true, Duration::from_millis(40));
        metrics.record_leaf_scored(false, false, Duration::from_millis(20));
        metrics.record_segmentation(Duration::from_millis(10));
        metrics.record_image_processed();
        metrics.record_image_failed(true);
        metrics.record_image_empty();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.leaves_scored, 2);
        assert_eq!(snapshot.leaves_diseased, 1);
        assert_eq!(snapshot.diseased_rate, 0.5);
        assert_eq!(snapshot.heatmap_failures, 1);
        assert_eq!(snapshot.segmentations_run, 1);
        assert_eq!(snapshot.scoring_avg_ms, 30);
        assert_eq!(snapshot.images_processed, 1);
        assert_eq!(snapshot.images_failed, 1);
        assert_eq!(snapshot.fetch_failures, 1);
        assert_eq!(snapshot.images_empty, 1);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_endpoint_request("/api/process");
        metrics.record_endpoint_request("/api/process");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.endpoint_requests, vec![("/api/process".to_string(), 2)]);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_leaf_scored(true, true, Duration::from_millis(5));
        metrics.record_endpoint_request("/health");

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("leaves_scored_total {} 1"));
        assert!(prometheus.contains("leaves_diseased_total {} 1"));
        assert!(prometheus.contains("endpoint_requests_total {endpoint=\"/health\"} 1"));
    }

    #[test]
    fn test_duration_window_keeps_latest_samples() {
        let metrics = Metrics::new();
        for _ in 0..DURATION_WINDOW {
            metrics.record_request_duration(Duration::from_millis(1000));
        }
        for _ in 0..DURATION_WINDOW {
            metrics.record_request_duration(Duration::from_millis(10));
        }

        assert_eq!(metrics.inner.request_duration_ms.read().len(), DURATION_WINDOW);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.request_avg_ms, 10);
        assert_eq!(snapshot.request_p99_ms, 10);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[1, 9, 5], 0.5), 5);
    }
}
