//! HTTP transport stub for the query gateway (§6: "Transport stub").
//!
//! A real MCP server exposes `query`/`refresh_schema`/`resources` over
//! the Model Context Protocol; that framing is an external collaborator
//! here (§1). This crate deserializes the same request/response shapes
//! over a minimal `axum` surface instead, so the orchestrator and every
//! component behind it can be exercised end-to-end without a real MCP
//! SDK in the loop.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;

pub use server::Server;
pub use state::AppState;

/// Server error type: only configuration/binding failures happen at
/// startup; per-request failures are reported in the response body
/// (§6 Wire errors), never as an HTTP transport failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind server: {0}")]
    BindError(String),

    /// Startup-time configuration was invalid.
    #[error("configuration error: {0}")]
    ConfigError(#[from] pg_mcp_error::PgMcpError),

    /// The listener or accept loop failed at runtime.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Server-level result type (startup/transport failures only).
pub type Result<T> = std::result::Result<T, ServerError>;
