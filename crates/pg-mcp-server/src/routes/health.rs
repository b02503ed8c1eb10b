//! `GET /healthz`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

use crate::state::AppState;

/// Per-database connectivity status.
#[derive(Debug, Serialize)]
pub struct DatabaseStatus {
    /// Configured database name.
    pub name: String,
    /// Whether a trivial query against it succeeded.
    pub connected: bool,
}

/// Overall health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `"healthy"` if every configured database answered, else `"unhealthy"`.
    pub status: String,
    /// Per-database detail.
    pub databases: Vec<DatabaseStatus>,
    /// `CARGO_PKG_VERSION` of this binary.
    pub version: String,
}

/// `GET /healthz`: 200 if every configured pool answers a health
/// check, 503 otherwise.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    debug!("health check requested");

    let mut databases = Vec::with_capacity(state.config.databases.len());
    let mut all_healthy = true;
    for db in &state.config.databases {
        let connected = state.pool.health_check(&db.name).await.unwrap_or(false);
        if !connected {
            all_healthy = false;
            warn!(database = %db.name, "health check failed");
        }
        databases.push(DatabaseStatus {
            name: db.name.clone(),
            connected,
        });
    }

    let response = HealthResponse {
        status: if all_healthy { "healthy" } else { "unhealthy" }.to_string(),
        databases,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let status_code = if all_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            databases: vec![DatabaseStatus {
                name: "main".to_string(),
                connected: true,
            }],
            version: "0.1.0".to_string(),
        };
        let json = serde_json::to_string(&response).expect("serializes");
        assert!(json.contains("healthy"));
        assert!(json.contains("main"));
    }
}
