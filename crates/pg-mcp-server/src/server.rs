//! The HTTP server: route wiring and the bind/serve loop.

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::metrics::{metrics_handler, metrics_middleware};
use crate::middleware::{cors_layer, trace_layer};
use crate::routes::{health_handler, list_databases_handler, query_handler, refresh_schema_handler, schema_resource_handler};
use crate::state::AppState;
use crate::{Result, ServerError};

/// Owns the bind address and shared state; builds the router on demand
/// so tests can exercise it without binding a socket.
pub struct Server {
    bind_addr: SocketAddr,
    state: AppState,
}

impl Server {
    /// Construct a server that will listen on `bind_addr` once served.
    #[must_use]
    pub fn new(bind_addr: SocketAddr, state: AppState) -> Self {
        Self { bind_addr, state }
    }

    /// Build the full route table with its middleware stack. Public so
    /// integration tests can drive it directly via `tower::ServiceExt`.
    #[must_use]
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/query", post(query_handler))
            .route("/refresh_schema", post(refresh_schema_handler))
            .route("/resources/databases", get(list_databases_handler))
            .route("/resources/schema/{database}", get(schema_resource_handler))
            .route("/healthz", get(health_handler))
            .with_state(self.state.clone())
            .route("/metrics", get(metrics_handler).with_state(self.state.metrics_handle.clone()))
            .layer(axum::middleware::from_fn(metrics_middleware))
            .layer(trace_layer())
            .layer(cors_layer())
    }

    /// Bind and serve until the process is signalled to stop.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::BindError`] if the address is already in
    /// use, or [`ServerError::IoError`] if the accept loop fails.
    pub async fn serve(self) -> Result<()> {
        let app = self.build_router();

        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| ServerError::BindError(e.to_string()))?;
        info!(bind_addr = %self.bind_addr, "pg-mcp-server listening");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(ServerError::IoError)?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received, draining in-flight requests");
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, OnceLock};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use pg_mcp_core::config::{AppConfig, OpenAiConfig, Secret};
    use pg_mcp_llm::OpenAiClient;
    use pg_mcp_orchestrator::{AuditQueue, FileAuditBackend, Orchestrator};
    use pg_mcp_pool::PoolManager;
    use pg_mcp_ratelimit::RateLimiter;
    use pg_mcp_schema::SchemaCache;
    use tower::ServiceExt;

    use super::*;
    use crate::metrics::init_metrics;

    // The Prometheus recorder is process-global; install it once and
    // clone the handle for every test that builds an `AppState`.
    fn shared_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
        static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();
        HANDLE.get_or_init(|| init_metrics().expect("metrics install")).clone()
    }

    // No database is configured here: `PoolManager::add` is never called,
    // so building this state needs no live Postgres or OpenAI endpoint.
    async fn test_state() -> AppState {
        let config = Arc::new(AppConfig {
            databases: Vec::new(),
            openai: OpenAiConfig {
                api_key: Secret::from("test-key".to_string()),
                model: "gpt-4o-mini".to_string(),
                base_url: None,
                max_retries: 1,
                timeout: 5.0,
            },
            server: Default::default(),
        });

        let pool = Arc::new(PoolManager::new());
        let schema_cache = Arc::new(SchemaCache::new(Duration::from_secs(60)));
        let rate_limiter = Arc::new(RateLimiter::new(config.server.rate_limit.clone()));
        let sql_generator = Arc::new(OpenAiClient::new(config.openai.clone()));

        static AUDIT_FILE_COUNTER: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let n = AUDIT_FILE_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let audit_queue = Arc::new(AuditQueue::new(16));
        let audit_dir = std::env::temp_dir().join(format!("pg-mcp-server-test-{}-{n}.jsonl", std::process::id()));
        let audit_backend = Arc::new(
            FileAuditBackend::new(audit_dir.to_string_lossy().to_string())
                .await
                .expect("audit backend opens"),
        );
        audit_queue.spawn_consumer(audit_backend);

        let orchestrator = Arc::new(Orchestrator::new(
            (*config).clone(),
            Arc::clone(&pool),
            Arc::clone(&schema_cache),
            Arc::clone(&rate_limiter),
            sql_generator,
            Arc::clone(&audit_queue),
        ));

        AppState {
            orchestrator,
            schema_cache,
            pool,
            config,
            metrics_handle: shared_metrics_handle(),
        }
    }

    #[tokio::test]
    async fn healthz_reports_healthy_with_no_configured_databases() {
        let router = Server::new("127.0.0.1:0".parse().unwrap(), test_state().await).build_router();

        let response = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .expect("router responds");

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn resources_databases_lists_configured_names() {
        let router = Server::new("127.0.0.1:0".parse().unwrap(), test_state().await).build_router();

        let response = router
            .oneshot(Request::builder().uri("/resources/databases").body(Body::empty()).unwrap())
            .await
            .expect("router responds");

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn schema_resource_for_unknown_database_is_not_found() {
        let router = Server::new("127.0.0.1:0".parse().unwrap(), test_state().await).build_router();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/resources/schema/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("router responds");

        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
