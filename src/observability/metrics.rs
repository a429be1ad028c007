//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_auth_total` (counter): authentication attempts by outcome
//! - `proxy_sink_write_failures_total` (counter): failed token writes by sink
//! - `proxy_requests_total` (counter): proxied requests by method, status
//! - `proxy_request_duration_seconds` (histogram): proxy latency
//! - `proxy_cache_lookups_total` (counter): cache hits and misses
//! - `proxy_cache_entries` (gauge): entries currently cached
//! - `proxy_tls_reloads_total` (counter): listener certificate reloads by outcome
//!
//! # Design Decisions
//! - One Prometheus recorder per process, installed on first use
//! - `/proxy/v1/metrics` renders the recorder's handle

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global recorder once and return its handle.
pub fn install() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "Metrics recorder already installed, exposing an empty registry");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

pub fn record_auth(success: bool) {
    counter!("proxy_auth_total", "outcome" => outcome(success)).increment(1);
}

pub fn record_sink_write_failure(sink: &str) {
    counter!("proxy_sink_write_failures_total", "sink" => sink.to_string()).increment(1);
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    let duration = start.elapsed().as_secs_f64();
    counter!(
        "proxy_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_request_duration_seconds", "method" => method.to_string()).record(duration);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("proxy_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_size(entries: usize) {
    gauge!("proxy_cache_entries").set(entries as f64);
}

pub fn record_tls_reload(success: bool) {
    counter!("proxy_tls_reloads_total", "outcome" => outcome(success)).increment(1);
}
