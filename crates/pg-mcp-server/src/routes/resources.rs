//! `GET /resources/databases` and `GET /resources/schema/:database`
//! (§6: `resources: databases://list` / `schema://<database>`).

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use pg_mcp_error::PgMcpError;
use serde::Serialize;

use crate::routes::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
struct DatabaseList {
    databases: Vec<String>,
}

/// `GET /resources/databases`: one line per configured database name.
pub async fn list_databases_handler(State(state): State<AppState>) -> Response {
    Json(DatabaseList {
        databases: state.config.database_names(),
    })
    .into_response()
}

#[derive(Serialize)]
struct SchemaResource {
    database: String,
    text: String,
}

/// `GET /resources/schema/:database`: the cached (or freshly
/// introspected) snapshot rendered as LM-grounding prompt text.
pub async fn schema_resource_handler(State(state): State<AppState>, Path(database): Path<String>) -> Result<Response, ApiError> {
    let db_config = state.config.get_database(&database).ok_or_else(|| {
        ApiError(PgMcpError::UnknownDatabase {
            requested: database.clone(),
            available: state.config.database_names(),
        })
    })?;

    let schema = state.schema_cache.get_or_refresh(&db_config.name, &state.pool).await?;
    Ok(Json(SchemaResource {
        database: db_config.name.clone(),
        text: schema.to_prompt_text(),
    })
    .into_response())
}
