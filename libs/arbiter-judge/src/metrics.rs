// Prometheus metrics for the judge

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::warn;

lazy_static! {
    // Global registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Submissions admitted (counter with language label)
    pub static ref SUBMISSIONS_SUBMITTED: CounterVec = CounterVec::new(
        Opts::new("arbiter_submissions_submitted_total", "Total number of submissions admitted"),
        &["language"]
    )
    .expect("metric can be created");

    // Submissions reaching a terminal state (language and status labels)
    pub static ref SUBMISSIONS_FINISHED: CounterVec = CounterVec::new(
        Opts::new("arbiter_submissions_finished_total", "Total number of submissions finished"),
        &["language", "status"]
    )
    .expect("metric can be created");

    pub static ref TEST_VERDICTS: CounterVec = CounterVec::new(
        Opts::new("arbiter_test_verdicts_total", "Per-test verdicts"),
        &["verdict"]
    )
    .expect("metric can be created");

    // Wall time of one sandboxed run (seconds)
    pub static ref TEST_WALL_TIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("arbiter_test_wall_time_seconds", "Wall time of a single test run")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
    )
    .expect("metric can be created");

    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "arbiter_queue_depth", "Submissions waiting for a worker"
    )
    .expect("metric can be created");

    pub static ref ACTIVE_WORKERS: IntGauge = IntGauge::new(
        "arbiter_active_workers", "Submissions currently processing"
    )
    .expect("metric can be created");

    // Sandbox acquisitions by source: pooled or adhoc
    pub static ref POOL_ACQUISITIONS: CounterVec = CounterVec::new(
        Opts::new("arbiter_pool_acquisitions_total", "Sandbox handle acquisitions"),
        &["language", "source"]
    )
    .expect("metric can be created");

    // API request counter
    pub static ref API_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("arbiter_api_requests_total", "Total API requests"),
        &["endpoint", "method", "status"]
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry, safe to call more than once
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(SUBMISSIONS_SUBMITTED.clone()),
            Box::new(SUBMISSIONS_FINISHED.clone()),
            Box::new(TEST_VERDICTS.clone()),
            Box::new(TEST_WALL_TIME.clone()),
            Box::new(QUEUE_DEPTH.clone()),
            Box::new(ACTIVE_WORKERS.clone()),
            Box::new(POOL_ACQUISITIONS.clone()),
            Box::new(API_REQUESTS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                warn!(error = %e, "collector could not be registered");
            }
        }
    });
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "metrics encoding failed");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_submission(language: &str) {
    SUBMISSIONS_SUBMITTED.with_label_values(&[language]).inc();
}

pub fn record_submission_finished(language: &str, status: &str) {
    SUBMISSIONS_FINISHED.with_label_values(&[language, status]).inc();
}

pub fn record_test(verdict: &str, wall_time_secs: f64) {
    TEST_VERDICTS.with_label_values(&[verdict]).inc();
    TEST_WALL_TIME.observe(wall_time_secs);
}

pub fn record_acquisition(language: &str, pooled: bool) {
    let source = if pooled { "pooled" } else { "adhoc" };
    POOL_ACQUISITIONS.with_label_values(&[language, source]).inc();
}

pub fn set_queue_gauges(queue_length: usize, active_workers: usize) {
    QUEUE_DEPTH.set(queue_length as i64);
    ACTIVE_WORKERS.set(active_workers as i64);
}

pub fn record_api_request(endpoint: &str, method: &str, status: u16) {
    API_REQUESTS
        .with_label_values(&[endpoint, method, &status.to_string()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_init() {
        init_metrics();
        init_metrics();
        record_submission("python");
        record_test("AC", 0.2);

        let text = render_metrics();
        assert!(text.contains("arbiter_submissions_submitted_total"));
        assert!(text.contains("arbiter_test_wall_time_seconds"));
    }
}
