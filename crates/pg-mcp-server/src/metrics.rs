//! Prometheus metrics exposition (§2 ambient stack). Grounded on the
//! `metrics`/`metrics-exporter-prometheus` usage in the teacher's
//! runtime observability module, not the server crate's own hand-rolled
//! atomics collector — this workspace declares the real exporter crate,
//! so the ambient metrics surface uses it directly.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::ServerError;

/// Install the global Prometheus recorder and register every metric
/// this crate emits with a human-readable description.
///
/// # Errors
///
/// Returns [`ServerError::ConfigError`]-shaped failure text if the
/// recorder is already installed or the histogram buckets are invalid.
pub fn init_metrics() -> std::result::Result<PrometheusHandle, ServerError> {
    let buckets = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
    let handle = PrometheusBuilder::new()
        .set_buckets(&buckets)
        .map_err(|e| ServerError::BindError(format!("invalid metric buckets: {e}")))?
        .install_recorder()
        .map_err(|e| ServerError::BindError(format!("failed to install metrics recorder: {e}")))?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!("http_requests_total", "Total HTTP requests handled");
    describe_histogram!("http_request_duration_seconds", "HTTP request duration in seconds");
    describe_counter!("query_requests_total", "Total `query` requests, by outcome");
    describe_histogram!("query_duration_seconds", "End-to-end query execution duration");
    describe_counter!("schema_refresh_total", "Schema cache refreshes triggered");
    describe_counter!("rate_limit_rejections_total", "Requests rejected by the rate limiter");
    describe_gauge!("audit_queue_dropped_total", "Audit events dropped for queue overflow");
}

/// HTTP-level request metrics, mirroring the teacher's
/// `metrics_middleware` (path normalized, method/status as labels).
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    counter!("http_requests_total", "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!("http_request_duration_seconds", "method" => method, "path" => path).record(start.elapsed().as_secs_f64());

    response
}

/// Known static route segments. Anything else (the `:database` path
/// parameter) is replaced with `:id` so label cardinality stays bounded
/// regardless of how many databases are configured.
const STATIC_SEGMENTS: &[&str] = &["", "query", "refresh_schema", "resources", "databases", "schema", "healthz", "metrics"];

fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| if STATIC_SEGMENTS.contains(&segment) { segment.to_string() } else { ":id".to_string() })
        .collect::<Vec<_>>()
        .join("/")
}

/// `GET /metrics`: render the Prometheus text exposition format.
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_is_identity_for_static_routes() {
        assert_eq!(normalize_path("/healthz"), "/healthz");
        assert_eq!(normalize_path("/resources/databases"), "/resources/databases");
    }

    #[test]
    fn normalize_path_collapses_database_name() {
        assert_eq!(normalize_path("/resources/schema/main"), "/resources/schema/:id");
        assert_eq!(normalize_path("/resources/schema/analytics_warehouse"), "/resources/schema/:id");
    }
}
