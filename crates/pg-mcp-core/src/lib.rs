//! Data model and configuration loading shared across pg-mcp components.
//!
//! This crate has no database driver or LM client dependency: it defines
//! the immutable records the rest of the workspace operates on (§3 of the
//! design) plus the YAML/env-var configuration loader (§6).

pub mod audit;
pub mod config;
pub mod policy;
pub mod redact;
pub mod schema;

pub use audit::{AuditEvent, AuditEventType, ClientInfo, PolicyCheckInfo, QueryInfo, ResultInfo};
pub use config::{AppConfig, DatabaseConfig, OpenAiConfig, RateLimitConfig, ServerConfig, SslMode};
pub use policy::{AccessPolicy, ExplainPolicy, OnDenied, SelectStarPolicy};
pub use schema::{ColumnInfo, DatabaseSchema, EnumTypeInfo, IndexInfo, IndexType, TableInfo, ViewInfo};
