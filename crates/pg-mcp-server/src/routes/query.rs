//! `POST /query` and `POST /refresh_schema` (§6 request surface).

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use metrics::{counter, histogram};
use pg_mcp_orchestrator::{QueryRequest, ReturnType};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::routes::error::ApiError;
use crate::state::AppState;

/// Wire shape of a `query` request (§6). `client_id` defaults to
/// `"anonymous"` since this transport stub has no auth layer (§1
/// Non-goals: user authentication) to derive a caller identity from.
#[derive(Debug, Deserialize)]
pub struct QueryHttpRequest {
    /// The natural-language question.
    pub question: String,
    /// Target database name; omitted resolves to the sole configured one.
    #[serde(default)]
    pub database: Option<String>,
    /// `sql`, `result`, or `both` (default `both`).
    #[serde(default)]
    pub return_type: Option<String>,
    /// Caller-supplied row cap.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Opaque client identifier for rate limiting and audit.
    #[serde(default)]
    pub client_id: Option<String>,
}

fn parse_return_type(raw: Option<&str>) -> Result<ReturnType, ApiError> {
    match raw {
        None | Some("both") => Ok(ReturnType::Both),
        Some("sql") => Ok(ReturnType::Sql),
        Some("result") => Ok(ReturnType::Result),
        Some(other) => Err(ApiError(pg_mcp_error::PgMcpError::validation(format!(
            "return_type must be one of sql, result, both; got '{other}'"
        )))),
    }
}

/// `POST /query`: run one natural-language question through the full
/// pipeline and return the deterministic response shape (§4.8).
pub async fn query_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<QueryHttpRequest>,
) -> Result<Response, ApiError> {
    let return_type = parse_return_type(body.return_type.as_deref())?;
    let client_id = body.client_id.unwrap_or_else(|| "anonymous".to_string());

    let request = QueryRequest {
        question: body.question,
        database: body.database,
        return_type,
        limit: body.limit,
        client_id: client_id.clone(),
        ip_address: Some(addr.ip().to_string()),
    };

    let start = Instant::now();
    let cancellation = CancellationToken::new();
    let response = state.orchestrator.execute_query(request, cancellation).await;
    let elapsed = start.elapsed().as_secs_f64();

    let outcome = if response.success { "success" } else { "failure" };
    counter!("query_requests_total", "outcome" => outcome).increment(1);
    histogram!("query_duration_seconds").record(elapsed);
    info!(client_id, success = response.success, elapsed_ms = (elapsed * 1000.0) as u64, "query request handled");

    let status = if response.success {
        StatusCode::OK
    } else {
        response.error_code.map_or(StatusCode::INTERNAL_SERVER_ERROR, crate::routes::error::status_for)
    };
    Ok((status, Json(response)).into_response())
}

/// Wire shape of a `refresh_schema` request (§6).
#[derive(Debug, Deserialize, Default)]
pub struct RefreshSchemaHttpRequest {
    /// Database to refresh; omitted refreshes every configured database.
    #[serde(default)]
    pub database: Option<String>,
}

/// `POST /refresh_schema`: force an immediate re-introspection.
pub async fn refresh_schema_handler(
    State(state): State<AppState>,
    body: Option<Json<RefreshSchemaHttpRequest>>,
) -> Result<Response, ApiError> {
    let database = body.and_then(|Json(b)| b.database);
    let result = state.orchestrator.refresh_schema(database.as_deref()).await?;
    counter!("schema_refresh_total").increment(1);
    Ok((StatusCode::OK, Json(result)).into_response())
}
