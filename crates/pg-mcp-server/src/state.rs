//! Shared application state handed to every route handler.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use pg_mcp_core::AppConfig;
use pg_mcp_orchestrator::Orchestrator;
use pg_mcp_pool::PoolManager;
use pg_mcp_schema::SchemaCache;

/// Everything a route handler needs, cloned cheaply per request (every
/// field is an `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// The per-request state machine (§4.8).
    pub orchestrator: Arc<Orchestrator>,
    /// Shared so `/resources/schema/:database` can render a snapshot
    /// without the orchestrator exposing its internals.
    pub schema_cache: Arc<SchemaCache>,
    /// Shared so the same pool registered at startup backs both the
    /// orchestrator and the schema resource.
    pub pool: Arc<PoolManager>,
    /// Read-only: used to enumerate configured databases and validate
    /// `refresh_schema` targets before dispatch.
    pub config: Arc<AppConfig>,
    /// Prometheus text-exposition handle for `GET /metrics`.
    pub metrics_handle: PrometheusHandle,
}
