//! Maps failures raised before the orchestrator's own state machine
//! takes over (bad request shape, unknown resource) onto the same
//! `{success, error_code, error_message}` wire shape §6 defines for
//! query failures, so every failure from this transport looks the same
//! regardless of which stage produced it.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pg_mcp_error::{ErrorCode, PgMcpError};
use serde::Serialize;

/// A failure surfaced directly by a route handler, outside the
/// orchestrator's own `QueryResponse::failure` path.
pub struct ApiError(pub PgMcpError);

impl From<PgMcpError> for ApiError {
    fn from(error: PgMcpError) -> Self {
        Self(error)
    }
}

#[derive(Serialize)]
struct WireError {
    success: bool,
    error_code: ErrorCode,
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.error_code());
        let body = WireError {
            success: false,
            error_code: self.0.error_code(),
            error_message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// The HTTP status that best fits a wire `error_code` (§6). Every
/// variant is non-2xx since this path only ever runs on failure.
#[must_use]
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::UnknownDatabase | ErrorCode::AmbiguousQuery => StatusCode::NOT_FOUND,
        ErrorCode::UnsafeSql | ErrorCode::SyntaxError | ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
        ErrorCode::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::ConnectionError | ErrorCode::OpenaiError => StatusCode::BAD_GATEWAY,
        ErrorCode::ResultTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::AccessDenied
        | ErrorCode::TableAccessDenied
        | ErrorCode::ColumnAccessDenied
        | ErrorCode::SchemaAccessDenied
        | ErrorCode::QueryTooExpensive
        | ErrorCode::SeqScanDenied => StatusCode::FORBIDDEN,
        ErrorCode::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_denials_map_to_forbidden() {
        assert_eq!(status_for(ErrorCode::TableAccessDenied), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorCode::SeqScanDenied), StatusCode::FORBIDDEN);
    }

    #[test]
    fn unknown_database_maps_to_not_found() {
        assert_eq!(status_for(ErrorCode::UnknownDatabase), StatusCode::NOT_FOUND);
    }
}
