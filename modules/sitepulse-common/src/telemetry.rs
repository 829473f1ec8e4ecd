//! Tracing and metrics bootstrap.
//!
//! Installs an EnvFilter-driven subscriber and a Prometheus metrics
//! recorder. A background task runs recorder upkeep on the export
//! interval so histogram snapshots stay bounded.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub const EXPORT_INTERVAL: Duration = Duration::from_secs(60);

// Counter names
pub const URLS_DISCOVERED_TOTAL: &str = "urls_discovered_total";
pub const GOOGLE_SUBMISSIONS_TOTAL: &str = "google_submissions_total";
pub const INDEXNOW_SUBMISSIONS_TOTAL: &str = "indexnow_submissions_total";
pub const ERRORS_TOTAL: &str = "errors_total";
pub const JOBS_TOTAL: &str = "jobs_total";

// Histogram names
pub const JOB_DURATION_MS: &str = "job_duration_ms";
pub const SITEMAP_SCAN_DURATION_MS: &str = "sitemap_scan_duration_ms";
pub const API_LATENCY_MS: &str = "api_latency_ms";

// Gauge names
pub const ACTIVE_JOBS: &str = "active_jobs";
pub const QUEUE_SIZE: &str = "queue_size";

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize tracing and the metrics recorder. Idempotent so tests can
/// call it freely.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let handle = PROMETHEUS.get_or_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");
        describe_metrics();
        handle
    });

    let upkeep = handle.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(EXPORT_INTERVAL);
        loop {
            tick.tick().await;
            upkeep.run_upkeep();
        }
    });
}

/// Rendered Prometheus exposition text, for scraping or debugging.
pub fn render() -> Option<String> {
    PROMETHEUS.get().map(|h| h.render())
}

fn describe_metrics() {
    describe_counter!(URLS_DISCOVERED_TOTAL, "URLs discovered by sitemap scans");
    describe_counter!(GOOGLE_SUBMISSIONS_TOTAL, "Google Indexing API submissions by status");
    describe_counter!(INDEXNOW_SUBMISSIONS_TOTAL, "IndexNow submissions by status");
    describe_counter!(ERRORS_TOTAL, "Errors by kind");
    describe_counter!(JOBS_TOTAL, "Jobs processed by type");
    describe_histogram!(JOB_DURATION_MS, "End-to-end job duration");
    describe_histogram!(SITEMAP_SCAN_DURATION_MS, "Single sitemap fetch+parse duration");
    describe_histogram!(API_LATENCY_MS, "Outbound API request latency");
    describe_gauge!(ACTIVE_JOBS, "Jobs currently processing");
    describe_gauge!(QUEUE_SIZE, "Queued jobs per queue");
}
