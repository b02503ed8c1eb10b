//! Error types for the pg-mcp query gateway.
//!
//! This crate defines the error taxonomy shared by every component crate
//! and the mapping from that taxonomy to the wire `error_code` contract.
//!
//! # Error Hierarchy
//!
//! ```text
//! PgMcpError
//! ├── UnknownDatabase       - requested database not configured
//! ├── AmbiguousQuery        - no database given, more than one configured
//! ├── UnsafeSql             - statement kind other than SELECT/UNION/VALUES
//! ├── SyntaxError           - SQL failed to parse
//! ├── ExecutionTimeout      - statement exceeded query_timeout
//! ├── ConnectionError       - pool/connection failure
//! ├── OpenAiError           - language-model client failure
//! ├── ResultTooLarge        - result exceeded max_result_rows irrecoverably
//! ├── ValidationError       - request-shape validation failure
//! ├── RateLimitExceeded     - per-client admission control rejected
//! ├── AccessDenied          - generic policy denial
//! ├── TableAccessDenied     - table not in allow-list / in deny-list
//! ├── ColumnAccessDenied    - column matched a deny pattern
//! ├── SchemaAccessDenied    - schema outside allowed_schemas
//! ├── QueryTooExpensive     - EXPLAIN row estimate over budget
//! ├── SeqScanDenied         - sequential scan on a large table
//! ├── ConfigurationError    - invalid or missing configuration
//! └── Internal              - unexpected internal errors
//! ```

use serde::Serialize;
use thiserror::Error;

/// Result type alias for pg-mcp operations.
pub type Result<T> = std::result::Result<T, PgMcpError>;

/// Main error type shared by every pg-mcp component.
///
/// Lower layers raise a specific variant; the orchestrator is the only
/// layer that maps a variant to a wire [`ErrorCode`].
#[derive(Error, Debug)]
pub enum PgMcpError {
    /// The requested database name is not configured.
    #[error("Unknown database '{requested}'")]
    UnknownDatabase {
        /// The name that was requested.
        requested: String,
        /// The configured database names, for the orchestrator's own use
        /// (never echoed verbatim to the caller).
        available: Vec<String>,
    },

    /// No database was named and more than one is configured.
    #[error("Database is ambiguous, {} configured", .available.len())]
    AmbiguousQuery {
        /// The configured database names.
        available: Vec<String>,
    },

    /// The generated SQL is not a read-only statement.
    #[error("Unsafe SQL: {reason}")]
    UnsafeSql {
        /// Why the statement was rejected.
        reason: String,
    },

    /// The SQL failed to parse.
    #[error("Syntax error: {message}")]
    SyntaxError {
        /// Parser error message.
        message: String,
        /// Best-effort position in the source text.
        position: Option<String>,
    },

    /// A statement exceeded `query_timeout`.
    #[error("Execution timed out after {timeout_secs}s")]
    ExecutionTimeout {
        /// The configured timeout that was exceeded.
        timeout_secs: f64,
    },

    /// A pool or connection-level failure.
    #[error("Connection error for '{database}': {message}")]
    ConnectionError {
        /// The database the connection was for.
        database: String,
        /// Error detail.
        message: String,
        /// Whether the failure is transient (connection lost) and thus retryable.
        retryable: bool,
    },

    /// The language-model client failed.
    #[error("Language-model error ({kind}): {message}")]
    OpenAiError {
        /// Error detail from the provider.
        message: String,
        /// Classification used to decide retryability.
        kind: LmErrorKind,
    },

    /// The result could not be bounded to `max_result_rows` without
    /// discarding data the caller explicitly required.
    #[error("Result too large: {row_count} rows exceeds cap of {cap}")]
    ResultTooLarge {
        /// Rows actually produced.
        row_count: usize,
        /// The configured cap.
        cap: usize,
    },

    /// The request shape failed validation (question length, limit range, …).
    #[error("Validation error: {message}")]
    ValidationError {
        /// Error detail.
        message: String,
    },

    /// A per-client rate limit was exceeded.
    #[error("Rate limit exceeded on {window} window (limit={limit})")]
    RateLimitExceeded {
        /// `"minute"` or `"hour"`, or `"tokens"` for the token bucket.
        window: String,
        /// The configured limit.
        limit: u64,
        /// Remaining admissions in the current window (0 when denied).
        remaining: u64,
        /// Unix-seconds estimate of when the window frees capacity.
        reset_at: i64,
    },

    /// A generic access-policy denial not covered by a more specific variant.
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Error detail (never dumps catalog alternatives).
        message: String,
    },

    /// A table is outside the allow-list or inside the deny-list.
    #[error("Access to table '{schema}.{table}' is denied")]
    TableAccessDenied {
        /// Schema name.
        schema: String,
        /// Table name.
        table: String,
    },

    /// A column matched a deny pattern.
    #[error("Access to column '{table}.{column}' is denied")]
    ColumnAccessDenied {
        /// Table (or alias) the column belongs to.
        table: String,
        /// Column name.
        column: String,
    },

    /// A referenced schema is outside `allowed_schemas`.
    #[error("Access to schema '{schema}' is denied")]
    SchemaAccessDenied {
        /// Schema name.
        schema: String,
    },

    /// The EXPLAIN row estimate exceeded `max_estimated_rows`.
    #[error("Query too expensive: estimated {estimated_rows} rows exceeds cap of {max_estimated_rows}")]
    QueryTooExpensive {
        /// EXPLAIN's root `Plan Rows`.
        estimated_rows: i64,
        /// The configured cap.
        max_estimated_rows: i64,
    },

    /// A sequential scan on a large table was denied.
    #[error("Sequential scan on large table '{table}' denied (~{estimated_rows} rows)")]
    SeqScanDenied {
        /// The table that would be scanned.
        table: String,
        /// Estimated row count backing the denial.
        estimated_rows: i64,
    },

    /// Configuration is invalid or missing.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Error detail.
        message: String,
    },

    /// Unexpected internal error. Should be rare; caller sees a generic message.
    #[error("Internal error: {message}")]
    Internal {
        /// Error message (logged in full; never echoed to the caller verbatim).
        message: String,
        /// Optional source error for debugging.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Classification of a language-model client failure, used to decide
/// whether the retry executor should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LmErrorKind {
    /// Provider-side rate limiting.
    RateLimit,
    /// Request exceeded the configured timeout.
    Timeout,
    /// Provider returned a 5xx-equivalent failure.
    ServerError,
    /// Authentication failed.
    Auth,
    /// The request itself was invalid (bad model name, malformed body, …).
    InvalidRequest,
}

impl LmErrorKind {
    /// Whether this failure kind should be retried by the executor.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::ServerError)
    }
}

/// The wire `error_code` contract from the external interface (§6).
///
/// `PgMcpError` values are mapped to exactly one of these by the
/// orchestrator before they reach the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Requested database is not configured.
    UnknownDatabase,
    /// No database named, more than one configured.
    AmbiguousQuery,
    /// Generated SQL was not a read-only statement.
    UnsafeSql,
    /// SQL failed to parse.
    SyntaxError,
    /// Statement exceeded the configured timeout.
    ExecutionTimeout,
    /// Pool/connection failure.
    ConnectionError,
    /// Language-model client failure.
    OpenaiError,
    /// Result exceeded the configured cap irrecoverably.
    ResultTooLarge,
    /// Request-shape validation failure.
    ValidationError,
    /// Rate limit exceeded.
    RateLimitExceeded,
    /// Generic access-policy denial.
    AccessDenied,
    /// Table access denial.
    TableAccessDenied,
    /// Column access denial.
    ColumnAccessDenied,
    /// Schema access denial.
    SchemaAccessDenied,
    /// EXPLAIN row estimate over budget.
    QueryTooExpensive,
    /// Sequential scan on a large table denied.
    SeqScanDenied,
    /// Invalid or missing configuration.
    ConfigurationError,
    /// Unexpected internal error.
    InternalError,
}

impl PgMcpError {
    /// Map this error to its wire [`ErrorCode`].
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::UnknownDatabase { .. } => ErrorCode::UnknownDatabase,
            Self::AmbiguousQuery { .. } => ErrorCode::AmbiguousQuery,
            Self::UnsafeSql { .. } => ErrorCode::UnsafeSql,
            Self::SyntaxError { .. } => ErrorCode::SyntaxError,
            Self::ExecutionTimeout { .. } => ErrorCode::ExecutionTimeout,
            Self::ConnectionError { .. } => ErrorCode::ConnectionError,
            Self::OpenAiError { .. } => ErrorCode::OpenaiError,
            Self::ResultTooLarge { .. } => ErrorCode::ResultTooLarge,
            Self::ValidationError { .. } => ErrorCode::ValidationError,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::AccessDenied { .. } => ErrorCode::AccessDenied,
            Self::TableAccessDenied { .. } => ErrorCode::TableAccessDenied,
            Self::ColumnAccessDenied { .. } => ErrorCode::ColumnAccessDenied,
            Self::SchemaAccessDenied { .. } => ErrorCode::SchemaAccessDenied,
            Self::QueryTooExpensive { .. } => ErrorCode::QueryTooExpensive,
            Self::SeqScanDenied { .. } => ErrorCode::SeqScanDenied,
            Self::ConfigurationError { .. } => ErrorCode::ConfigurationError,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether the retry executor should retry this error.
    ///
    /// Only connection-transient and LM-transient kinds are retryable;
    /// policy/cost denials and syntax errors are handled by the
    /// orchestrator's own bounded SQL-retry loop, not this executor.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError { retryable, .. } => *retryable,
            Self::OpenAiError { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error should be audited as `policy_violation`
    /// rather than `query_denied` or `query_failed`.
    #[must_use]
    pub const fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::AccessDenied { .. }
                | Self::TableAccessDenied { .. }
                | Self::ColumnAccessDenied { .. }
                | Self::SchemaAccessDenied { .. }
        )
    }

    /// Whether this error should be audited as `query_denied`
    /// (cost/safety denials that are not access-policy violations).
    #[must_use]
    pub const fn is_query_denial(&self) -> bool {
        matches!(
            self,
            Self::UnsafeSql { .. } | Self::QueryTooExpensive { .. } | Self::SeqScanDenied { .. }
        )
    }

    /// Construct a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Construct an internal error with no source.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Construct a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for PgMcpError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {e}"),
            source: Some(Box::new(e)),
        }
    }
}

impl From<serde_json::Error> for PgMcpError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("serialization error: {e}"),
            source: Some(Box::new(e)),
        }
    }
}

/// Extension trait for adding context to a fallible result.
pub trait ErrorContext<T> {
    /// Wrap the error (if any) as an [`PgMcpError::Internal`] prefixed
    /// with `message`.
    ///
    /// # Errors
    ///
    /// Returns the original error with additional context prepended.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<PgMcpError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let inner = e.into();
            PgMcpError::Internal {
                message: format!("{}: {inner}", message.into()),
                source: None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_schema_denial_to_code() {
        let err = PgMcpError::SchemaAccessDenied {
            schema: "secret".to_string(),
        };
        assert_eq!(err.error_code(), ErrorCode::SchemaAccessDenied);
        assert!(err.is_policy_violation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn connection_error_retryable_flag_drives_retry() {
        let transient = PgMcpError::ConnectionError {
            database: "main".to_string(),
            message: "connection reset".to_string(),
            retryable: true,
        };
        assert!(transient.is_retryable());

        let fatal = PgMcpError::ConnectionError {
            database: "main".to_string(),
            message: "pool closed".to_string(),
            retryable: false,
        };
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn lm_error_kind_classification() {
        let retryable = PgMcpError::OpenAiError {
            message: "rate limited".to_string(),
            kind: LmErrorKind::RateLimit,
        };
        assert!(retryable.is_retryable());

        let fatal = PgMcpError::OpenAiError {
            message: "bad api key".to_string(),
            kind: LmErrorKind::Auth,
        };
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn cost_and_seq_scan_denials_are_query_denials_not_policy_violations() {
        let cost = PgMcpError::QueryTooExpensive {
            estimated_rows: 5_000_000,
            max_estimated_rows: 1_000,
        };
        assert!(cost.is_query_denial());
        assert!(!cost.is_policy_violation());
    }

    #[test]
    fn error_context_wraps_message() {
        fn may_fail() -> std::result::Result<(), std::io::Error> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing file"))
        }

        let result = may_fail().context("failed to load config");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }
}
