//! Prometheus metrics for the entitlement service.
//!
//! Metrics are exposed in Prometheus text format by a dedicated listener,
//! enabled with `METRICS_BIND`. Without an installed recorder every call
//! here is a no-op.
//!
//! # Metrics Categories
//!
//! - **HTTP Metrics**: Request counts, duration, status codes
//! - **Sweep Metrics**: Expirations, revocations, warnings per sweep
//! - **Lifecycle Metrics**: Configs provisioned and revoked by API calls
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use va_server::metrics;
//! use std::net::SocketAddr;
//!
//! let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
//! metrics::init_metrics(addr).unwrap();
//!
//! metrics::http_requests_total("POST", "/api/v1/configs", 201);
//! ```

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use vpn_access::SweepReport;

/// Initialize Prometheus metrics exporter.
///
/// Metrics will be available at `http://<addr>/metrics`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))
}

// ============================================================================
// HTTP Metrics
// ============================================================================

/// Record HTTP request.
pub fn http_requests_total(method: &str, path: &str, status: u16) {
    metrics::counter!("http_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record HTTP request duration in milliseconds.
pub fn http_request_duration_ms(method: &str, path: &str, duration_ms: f64) {
    metrics::histogram!("http_request_duration_ms",
        "method" => method.to_string(),
        "path" => path.to_string()
    )
    .record(duration_ms);
}

// ============================================================================
// Sweep Metrics
// ============================================================================

/// Record the counters of one finished sweep.
pub fn record_sweep(report: &SweepReport) {
    metrics::counter!("sweeps_total").increment(1);
    metrics::counter!("configs_expired_total").increment(report.deactivated as u64);
    metrics::counter!("revocations_total", "outcome" => "confirmed")
        .increment(report.revoked as u64);
    metrics::counter!("revocations_total", "outcome" => "failed")
        .increment(report.revoke_failures as u64);
    metrics::counter!("expiry_warnings_total", "outcome" => "sent")
        .increment(report.notified as u64);
    metrics::counter!("expiry_warnings_total", "outcome" => "failed")
        .increment(report.notification_failures as u64);
    metrics::counter!("sweep_errors_total").increment(report.errors as u64);
    metrics::gauge!("last_sweep_expired").set(report.expired as f64);
}

// ============================================================================
// Lifecycle Metrics
// ============================================================================

/// Increment provisioned configs counter.
pub fn configs_provisioned_total(trial: bool) {
    metrics::counter!("configs_provisioned_total",
        "trial" => trial.to_string()
    )
    .increment(1);
}

/// Increment interactive revocations counter.
pub fn configs_revoked_total() {
    metrics::counter!("configs_revoked_total").increment(1);
}
