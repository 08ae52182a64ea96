//! Named counters/gauges/histograms published by components A-L (§4.M).
//!
//! Business logic never calls `metrics::counter!`/`gauge!`/`histogram!`
//! directly; every metric name lives here, once, behind a typed helper.

use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder. Safe to call more than
/// once; later calls are no-ops once a recorder is installed.
pub fn install_default_exporter() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }
    if let Ok(handle) = PrometheusBuilder::new().install_recorder() {
        let _ = PROMETHEUS_HANDLE.set(handle);
    }
}

/// The installed exporter handle, if `install_default_exporter` has run.
#[must_use]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

pub fn cache_hit(source: &str) {
    metrics::counter!("cache_hits_total", "source" => source.to_string()).increment(1);
}

pub fn cache_miss(source: &str) {
    metrics::counter!("cache_misses_total", "source" => source.to_string()).increment(1);
}

pub fn cache_miss_by_pair(source: &str, pair: &str) {
    metrics::counter!(
        "cache_miss_by_pair_total",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .increment(1);
}

pub fn price_not_found(source: &str, pair: &str) {
    metrics::counter!(
        "price_not_found_total",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .increment(1);
}

pub fn quote_request_error(source: &str, pair: &str) {
    metrics::counter!(
        "quote_request_errors_total",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .increment(1);
}

pub fn rate_limit_hit(source: &str) {
    metrics::counter!("rate_limit_hits_total", "source" => source.to_string()).increment(1);
}

pub fn app_error(error_type: &str, source: &str) {
    metrics::counter!(
        "app_errors_total",
        "type" => error_type.to_string(), "source" => source.to_string(),
    )
    .increment(1);
}

pub fn quotes_processed(source: &str, status: &str, by: u64) {
    metrics::counter!(
        "quotes_processed_total",
        "source" => source.to_string(), "status" => status.to_string(),
    )
    .increment(by);
}

pub fn source_api_error(source: &str, status_code: u16, error_type: &str) {
    metrics::counter!(
        "source_api_errors_total",
        "source" => source.to_string(),
        "status_code" => status_code.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

pub fn source_rest_request(source: &str, status: &str) {
    metrics::counter!(
        "source_rest_requests_total",
        "source" => source.to_string(), "status" => status.to_string(),
    )
    .increment(1);
}

pub fn websocket_error(source: &str, error_type: &str) {
    metrics::counter!(
        "websocket_errors_total",
        "source" => source.to_string(), "error_type" => error_type.to_string(),
    )
    .increment(1);
}

pub fn websocket_message_received(source: &str) {
    metrics::counter!("websocket_messages_received_total", "source" => source.to_string())
        .increment(1);
}

pub fn websocket_reconnect(source: &str, reason: &str) {
    metrics::counter!(
        "websocket_reconnects_total",
        "source" => source.to_string(), "reason" => reason.to_string(),
    )
    .increment(1);
}

pub fn failed_pairs_retry_attempt(source: &str, pair: &str) {
    metrics::counter!(
        "failed_pairs_retry_attempts_total",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .increment(1);
}

pub fn failed_pairs_max_attempts_reached(source: &str, pair: &str) {
    metrics::counter!(
        "failed_pairs_max_attempts_reached_total",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .increment(1);
}

pub fn cache_size(source: &str, size: usize) {
    metrics::gauge!("cache_size", "source" => source.to_string()).set(size as f64);
}

pub fn tracked_pairs_total(source: &str, count: usize) {
    metrics::gauge!("tracked_pairs_total", "source" => source.to_string()).set(count as f64);
}

pub fn pairs_total(count: usize) {
    metrics::gauge!("pairs_total").set(count as f64);
}

pub fn registered_pair(source: &str, pair: &str, registered: bool) {
    metrics::gauge!(
        "registered_pairs",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .set(if registered { 1.0 } else { 0.0 });
}

pub fn source_last_update_age_seconds(source: &str, pair: &str, age: Duration) {
    metrics::gauge!(
        "source_last_update_age_seconds",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .set(age.as_secs_f64());
}

pub fn websocket_connections_total(source: &str, count: usize) {
    metrics::gauge!("websocket_connections_total", "source" => source.to_string())
        .set(count as f64);
}

pub fn quote_data_age_seconds(source: &str, pair: &str, age: Duration) {
    metrics::gauge!(
        "quote_data_age_seconds",
        "source" => source.to_string(), "pair" => pair.to_string(),
    )
    .set(age.as_secs_f64());
}

pub fn failed_pairs_count(count: usize) {
    metrics::gauge!("failed_pairs_count").set(count as f64);
}

pub fn http_request_duration(route: &str, method: &str, status: &str, duration: Duration) {
    metrics::histogram!(
        "http_request_duration_seconds",
        "route" => route.to_string(), "method" => method.to_string(), "status" => status.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn source_fetch_duration(source: &str, duration: Duration) {
    metrics::histogram!("source_fetch_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
}

pub fn source_api_duration(source: &str, method: &str, status: &str, duration: Duration) {
    metrics::histogram!(
        "source_api_duration_seconds",
        "source" => source.to_string(), "method" => method.to_string(), "status" => status.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn batch_size(source: &str, size: usize) {
    metrics::histogram!("batch_size", "source" => source.to_string()).record(size as f64);
}

pub fn price_update_frequency(source: &str, seconds: f64) {
    metrics::histogram!("price_update_frequency_seconds", "source" => source.to_string())
        .record(seconds);
}
