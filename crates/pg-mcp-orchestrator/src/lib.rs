//! Query Orchestrator (C8, §4.8): the per-request state machine that
//! wires every other component together.
//!
//! `INIT -> RATE_LIMITED -> SCHEMA_READY -> SQL_GENERATED -> PARSED ->
//! POLICY_OK -> PLAN_OK -> EXECUTED -> AUDITED -> DONE`, with a bounded
//! `SYNTAX_RETRY` loop back to `SQL_GENERATED` and `DENIED`/`FAILED`
//! branches that still reach `AUDITED` before `DONE` (every request
//! produces exactly one audit event, Testable Property 9).

pub mod audit;
mod retry;
mod rewrite;
mod rows;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use pg_mcp_core::audit::{AuditEventType, ClientInfo, PolicyCheckInfo, ResultInfo};
use pg_mcp_core::{AppConfig, ExplainPolicy};
use pg_mcp_error::{ErrorCode, PgMcpError, Result};
use pg_mcp_explain::ExplainCache;
use pg_mcp_llm::SqlGenerator;
use pg_mcp_policy::PolicyViolation;
use pg_mcp_pool::PoolManager;
use pg_mcp_ratelimit::RateLimiter;
use pg_mcp_schema::SchemaCache;
use pg_mcp_sql::StatementKind;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use audit::{AuditBackend, AuditQueue, FileAuditBackend};

/// What shape the caller wants back (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnType {
    /// Only the generated SQL.
    Sql,
    /// Only the execution result.
    Result,
    /// Both the SQL and the result.
    #[default]
    Both,
}

/// One `query` request (§6).
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// The natural-language question.
    pub question: String,
    /// Target database name; `None` resolves to the sole configured one.
    pub database: Option<String>,
    /// What to include in the response.
    pub return_type: ReturnType,
    /// Caller-supplied row cap, bounded by `server.max_result_rows`.
    pub limit: Option<usize>,
    /// Opaque client identifier for rate limiting and audit (§3).
    pub client_id: String,
    /// Origin IP address, if known.
    pub ip_address: Option<String>,
}

/// The `result` payload of a successful response (§6).
#[derive(Debug, Clone, Serialize)]
pub struct QueryResultPayload {
    /// Column names, in projection order.
    pub columns: Vec<String>,
    /// Rows, each a JSON object keyed by column name.
    pub rows: Vec<serde_json::Value>,
    /// Rows actually returned (after any truncation).
    pub row_count: usize,
    /// Whether the result was truncated to `max_result_rows`.
    pub truncated: bool,
}

/// The deterministic response shape every request resolves to (§6).
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    /// Whether the request completed successfully.
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The (possibly rewritten/canonicalized) SQL that ran, or was generated.
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The execution result, present when `return_type` requested it.
    pub result: Option<QueryResultPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The language model's explanation of the query, if it gave one.
    pub explanation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Advisory, non-authoritative result sanity note (§9 Open Question b).
    pub validation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// The wire error code, present only on failure.
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// A human-readable error message, present only on failure.
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Additional structured error detail (redacted before being set).
    pub details: Option<serde_json::Value>,
}

impl QueryResponse {
    fn failure(error: &PgMcpError) -> Self {
        Self {
            success: false,
            sql: None,
            result: None,
            explanation: None,
            validation: None,
            error_code: Some(error.error_code()),
            error_message: Some(error.to_string()),
            details: None,
        }
    }
}

/// The result of `refresh_schema` (§6).
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSchemaResponse {
    /// Whether every targeted database refreshed successfully.
    pub success: bool,
    /// Database names that were refreshed.
    pub databases: Vec<String>,
}

/// Heuristic pre-flight token estimate for the rate limiter's token
/// bucket (§4.7). No original implementation of this formula survived
/// in the retrieved source; this is an authored approximation — a fixed
/// overhead for the system prompt and schema text, plus ~4 characters
/// per token for the question itself — documented honestly rather than
/// presented as derived from anywhere.
fn estimate_tokens(question: &str) -> u32 {
    const PROMPT_OVERHEAD_TOKENS: u32 = 600;
    PROMPT_OVERHEAD_TOKENS + (question.len() as u32 / 4).max(1)
}

fn postgres_error_class(e: &tokio_postgres::Error) -> Option<&str> {
    e.code().map(|s| &s.code()[..2])
}

/// Map a driver-level failure surfaced only at execution time (not at
/// the earlier `pg_mcp_sql::parse` stage) to its `PgMcpError` variant,
/// using the SQLSTATE class: `08` is a connection exception, `42` is a
/// syntax-or-access-rule violation (§4.8 transition 4 can still loop
/// back to SQL generation on this).
fn map_execution_error(database: &str, e: tokio_postgres::Error) -> PgMcpError {
    match postgres_error_class(&e) {
        Some("08") => PgMcpError::ConnectionError {
            database: database.to_string(),
            message: e.to_string(),
            retryable: true,
        },
        Some("42") => PgMcpError::SyntaxError {
            message: e.to_string(),
            position: None,
        },
        _ => PgMcpError::internal(format!("execution failed: {e}")),
    }
}

/// Owns every shared, process-wide resource (§5: pool manager, schema
/// cache, rate limiter, and audit sink are the only state that outlives
/// a single request) and drives the per-request state machine.
pub struct Orchestrator {
    config: AppConfig,
    pool: Arc<PoolManager>,
    schema_cache: Arc<SchemaCache>,
    rate_limiter: Arc<RateLimiter>,
    sql_generator: Arc<dyn SqlGenerator>,
    explain_caches: DashMap<String, ExplainCache>,
    audit_queue: Arc<AuditQueue>,
}

impl Orchestrator {
    /// Assemble an orchestrator from its already-constructed components.
    /// Callers (the binary's `main`) are responsible for registering
    /// every configured database's pool before the first request.
    #[must_use]
    pub fn new(
        config: AppConfig,
        pool: Arc<PoolManager>,
        schema_cache: Arc<SchemaCache>,
        rate_limiter: Arc<RateLimiter>,
        sql_generator: Arc<dyn SqlGenerator>,
        audit_queue: Arc<AuditQueue>,
    ) -> Self {
        Self {
            config,
            pool,
            schema_cache,
            rate_limiter,
            sql_generator,
            explain_caches: DashMap::new(),
            audit_queue,
        }
    }

    fn resolve_database(&self, requested: Option<&str>) -> Result<String> {
        match requested {
            Some(name) => self
                .config
                .get_database(name)
                .map(|d| d.name.clone())
                .ok_or_else(|| PgMcpError::UnknownDatabase {
                    requested: name.to_string(),
                    available: self.config.database_names(),
                }),
            None => self
                .config
                .get_default_database()
                .map(|d| d.name.clone())
                .ok_or_else(|| PgMcpError::AmbiguousQuery {
                    available: self.config.database_names(),
                }),
        }
    }

    fn explain_cache_for(&self, database: &str, policy: &ExplainPolicy) -> ExplainCache {
        if let Some(existing) = self.explain_caches.get(database) {
            return existing.clone();
        }
        let cache = ExplainCache::new(policy);
        self.explain_caches.insert(database.to_string(), cache.clone());
        cache
    }

    /// Force an immediate re-introspection of one database, or every
    /// configured database if `database` is `None` (§6).
    ///
    /// # Errors
    ///
    /// Returns the first refresh failure encountered; databases that
    /// already refreshed successfully are left with their new snapshot.
    pub async fn refresh_schema(&self, database: Option<&str>) -> Result<RefreshSchemaResponse> {
        let targets: Vec<String> = match database {
            Some(name) => vec![self.resolve_database(Some(name))?],
            None => self.config.database_names(),
        };

        for name in &targets {
            self.schema_cache.refresh(name, &self.pool).await?;
        }

        Ok(RefreshSchemaResponse {
            success: true,
            databases: targets,
        })
    }

    /// Run one request through the full state machine (§4.8).
    pub async fn execute_query(&self, request: QueryRequest, cancellation: CancellationToken) -> QueryResponse {
        let start = Instant::now();
        match self.execute_query_inner(&request, &cancellation).await {
            Ok((response, audit_context)) => {
                self.audit_queue.push(audit_context.into_event(start.elapsed(), None));
                response
            }
            Err((error, audit_context)) => {
                let response = QueryResponse::failure(&error);
                let event = audit_context.into_event(start.elapsed(), Some(&error)).with_error(error.to_string());
                self.audit_queue.push(event);
                response
            }
        }
    }

    async fn execute_query_inner(
        &self,
        request: &QueryRequest,
        cancellation: &CancellationToken,
    ) -> std::result::Result<(QueryResponse, AuditContext), (PgMcpError, AuditContext)> {
        let mut audit_context = AuditContext::new(request);

        macro_rules! fail {
            ($err:expr) => {
                return Err(($err, audit_context))
            };
        }
        macro_rules! try_step {
            ($result:expr) => {
                match $result {
                    Ok(value) => value,
                    Err(e) => fail!(e),
                }
            };
        }

        let database = try_step!(self.resolve_database(request.database.as_deref()));
        audit_context.database = database.clone();

        if cancellation.is_cancelled() {
            fail!(PgMcpError::internal("request cancelled"));
        }

        try_step!(self.rate_limiter.check_request(&request.client_id));
        try_step!(self.rate_limiter.check_tokens(&request.client_id, estimate_tokens(&request.question)));

        let schema = try_step!(self.schema_cache.get_or_refresh(&database, &self.pool).await);
        let db_config = self
            .config
            .get_database(&database)
            .expect("resolve_database only returns configured names");
        let server_config = &self.config.server;
        let effective_limit = request
            .limit
            .map_or(server_config.max_result_rows, |l| l.min(server_config.max_result_rows));

        let mut error_context: Option<String> = None;
        let mut attempt: u32 = 0;

        let (canonical_sql, generated_sql, explanation) = loop {
            if cancellation.is_cancelled() {
                fail!(PgMcpError::internal("request cancelled"));
            }

            let generation = match self.sql_generator.generate_sql(&request.question, &schema, error_context.as_deref()).await {
                Ok(g) => g,
                Err(e) => fail!(e),
            };
            self.rate_limiter.record_tokens(&request.client_id, generation.tokens_used);

            let parsed = match pg_mcp_sql::parse(&generation.sql) {
                Ok(p) => p,
                Err(PgMcpError::SyntaxError { message, position }) if attempt < server_config.max_sql_retry => {
                    attempt += 1;
                    warn!(attempt, %message, "generated SQL failed to parse, retrying generation");
                    error_context = Some(message);
                    let _ = position;
                    continue;
                }
                Err(e) => fail!(e),
            };

            if !matches!(parsed.kind, StatementKind::Select | StatementKind::Union) {
                fail!(PgMcpError::UnsafeSql {
                    reason: format!("generated statement is not read-only ({:?})", parsed.kind),
                });
            }

            let policy_result = pg_mcp_policy::validate(&parsed, &db_config.access_policy);
            if !policy_result.is_allowed() {
                audit_context.policy_violations = policy_result.violations.iter().map(describe_violation).collect();
                fail!(policy_denial_error(&policy_result.violations));
            }

            let needs_rewrite = policy_result.needs_star_expansion || !policy_result.redacted_columns.is_empty();
            let sql_for_execution = if needs_rewrite {
                match rewrite::rewrite_projection(&generation.sql, &schema, &db_config.access_policy) {
                    Ok((rewritten, _redacted)) => rewritten,
                    Err(e) => fail!(e),
                }
            } else {
                generation.sql.clone()
            };

            let canonical = match pg_mcp_sql::canonicalize(&sql_for_execution, effective_limit as u64) {
                Ok(c) => c,
                Err(e) => fail!(e),
            };

            break (canonical, generation.sql, generation.explanation);
        };
        audit_context.generated_sql = Some(generated_sql.clone());
        audit_context.policy_passed = true;

        if cancellation.is_cancelled() {
            fail!(PgMcpError::internal("request cancelled"));
        }

        let row_counts = self.schema_cache.table_row_counts(&database);
        let explain_policy = db_config.access_policy.explain_policy.clone();
        let explain_cache = self.explain_cache_for(&database, &explain_policy);
        let use_readonly = server_config.use_readonly_transactions;
        let query_timeout = server_config.query_timeout;
        let max_result_rows = effective_limit;
        let sql_to_run = canonical_sql.clone();

        let exec_result = retry::with_connection_retry(&database, || {
            let sql_to_run = sql_to_run.clone();
            let row_counts = row_counts.clone();
            let explain_policy = explain_policy.clone();
            let database_for_client = database.clone();
            self.pool.acquire(&database, move |mut client| {
                let sql_to_run = sql_to_run.clone();
                let row_counts = row_counts.clone();
                let explain_policy = explain_policy.clone();
                async move {
                    let tx = client
                        .build_transaction()
                        .read_only(use_readonly)
                        .start()
                        .await
                        .map_err(|e| PgMcpError::ConnectionError {
                            database: database_for_client.clone(),
                            message: format!("failed to start transaction: {e}"),
                            retryable: true,
                        })?;

                    let explain = pg_mcp_explain::validate(&tx, &sql_to_run, &explain_policy, &row_counts, &explain_cache).await;
                    if !explain.passed {
                        let _ = tx.rollback().await;
                        return Err(explain_denial_error(&explain, &explain_policy));
                    }

                    let rows = match tokio::time::timeout(Duration::from_secs_f64(query_timeout), tx.query(&sql_to_run, &[])).await {
                        Ok(Ok(rows)) => rows,
                        Ok(Err(e)) => {
                            let _ = tx.rollback().await;
                            return Err(map_execution_error(&database_for_client, e));
                        }
                        Err(_) => {
                            let _ = tx.rollback().await;
                            return Err(PgMcpError::ExecutionTimeout { timeout_secs: query_timeout });
                        }
                    };

                    tx.commit().await.map_err(|e| PgMcpError::ConnectionError {
                        database: database_for_client.clone(),
                        message: format!("failed to commit read-only transaction: {e}"),
                        retryable: false,
                    })?;

                    let columns = rows.first().map(|r| r.columns().iter().map(|c| c.name().to_string()).collect()).unwrap_or_default();
                    let mut json_rows: Vec<serde_json::Value> = rows.iter().map(rows::row_to_json).collect();
                    let truncated = json_rows.len() > max_result_rows;
                    json_rows.truncate(max_result_rows);
                    let row_count = json_rows.len();

                    Ok((columns, json_rows, row_count, truncated))
                }
            })
        })
        .await;

        let (columns, json_rows, row_count, truncated) = match exec_result {
            Ok(value) => value,
            Err(e) => fail!(e),
        };

        info!(database, rows = row_count, truncated, "query executed");

        let advisory_note = if server_config.enable_result_validation {
            let (_, note) = pg_mcp_llm::OpenAiClient::validate_result_advisory(&request.question, &canonical_sql, row_count);
            note
        } else {
            None
        };

        audit_context.row_count = Some(row_count);
        audit_context.truncated = Some(truncated);

        let include_sql = !matches!(request.return_type, ReturnType::Result);
        let include_result = !matches!(request.return_type, ReturnType::Sql);

        let response = QueryResponse {
            success: true,
            sql: include_sql.then(|| canonical_sql.clone()),
            result: include_result.then_some(QueryResultPayload {
                columns,
                rows: json_rows,
                row_count,
                truncated,
            }),
            explanation,
            validation: advisory_note,
            error_code: None,
            error_message: None,
            details: None,
        };

        Ok((response, audit_context))
    }
}

fn describe_violation(violation: &PolicyViolation) -> String {
    match violation {
        PolicyViolation::SchemaDenied { schema } => format!("schema '{schema}' is not allowed"),
        PolicyViolation::TableDenied { schema, table } => format!("table '{schema}.{table}' is denied"),
        PolicyViolation::SelectStarDenied => "SELECT * is denied by policy".to_string(),
        PolicyViolation::ColumnDenied { table, column } => format!("column '{table}.{column}' is denied"),
    }
}

fn policy_denial_error(violations: &[PolicyViolation]) -> PgMcpError {
    match violations.first() {
        Some(PolicyViolation::SchemaDenied { schema }) => PgMcpError::SchemaAccessDenied { schema: schema.clone() },
        Some(PolicyViolation::TableDenied { schema, table }) => PgMcpError::TableAccessDenied {
            schema: schema.clone(),
            table: table.clone(),
        },
        Some(PolicyViolation::ColumnDenied { table, column }) => PgMcpError::ColumnAccessDenied {
            table: table.clone(),
            column: column.clone(),
        },
        Some(PolicyViolation::SelectStarDenied) => PgMcpError::AccessDenied {
            message: "SELECT * is denied by policy".to_string(),
        },
        None => PgMcpError::AccessDenied {
            message: "access denied".to_string(),
        },
    }
}

fn explain_denial_error(explain: &pg_mcp_explain::ExplainValidationResult, policy: &ExplainPolicy) -> PgMcpError {
    let reason = explain.denial_reason.clone().unwrap_or_default();
    if let Some(result) = &explain.result {
        if reason.contains("sequential scan") {
            if let Some((table, _)) = result.seq_scans.first() {
                return PgMcpError::SeqScanDenied {
                    table: table.clone(),
                    estimated_rows: result.estimated_rows,
                };
            }
        }
        return PgMcpError::QueryTooExpensive {
            estimated_rows: result.estimated_rows,
            max_estimated_rows: policy.max_estimated_rows,
        };
    }
    PgMcpError::internal(reason)
}

struct AuditContext {
    client_id: String,
    ip_address: Option<String>,
    question: String,
    database: String,
    generated_sql: Option<String>,
    policy_passed: bool,
    policy_violations: Vec<String>,
    row_count: Option<usize>,
    truncated: Option<bool>,
}

impl AuditContext {
    fn new(request: &QueryRequest) -> Self {
        Self {
            client_id: request.client_id.clone(),
            ip_address: request.ip_address.clone(),
            question: request.question.clone(),
            database: request.database.clone().unwrap_or_default(),
            generated_sql: None,
            policy_passed: true,
            policy_violations: Vec::new(),
            row_count: None,
            truncated: None,
        }
    }

    fn into_event(self, duration: Duration, error: Option<&PgMcpError>) -> pg_mcp_core::AuditEvent {
        let event_type = match error {
            None => AuditEventType::QueryExecuted,
            Some(e) if e.is_policy_violation() => AuditEventType::PolicyViolation,
            Some(e) if e.is_query_denial() => AuditEventType::QueryDenied,
            Some(_) => AuditEventType::QueryFailed,
        };

        let event = pg_mcp_core::AuditEvent::new(
            event_type,
            ClientInfo {
                client_id: self.client_id,
                ip_address: self.ip_address,
            },
            self.question,
            self.generated_sql,
            self.database,
        );

        let event = event.with_policy_check(PolicyCheckInfo {
            passed: self.policy_passed && self.policy_violations.is_empty(),
            violations: self.policy_violations,
        });

        match (self.row_count, self.truncated) {
            (Some(row_count), Some(truncated)) => event.with_result(ResultInfo {
                row_count,
                duration_ms: duration.as_millis() as u64,
                truncated,
            }),
            _ => event,
        }
    }
}
