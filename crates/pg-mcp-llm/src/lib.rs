//! Language-Model Client (C6, §4.6): builds the grounding prompt from a
//! schema snapshot, requests a SQL generation from the provider, and
//! retries transient failures (§7).
//!
//! This is the single place in the workspace that knows the vendor
//! wire format. It is expressed as the narrow [`SqlGenerator`] capability
//! interface so the orchestrator can be tested against a mock (§9).

mod backoff;

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use pg_mcp_core::{DatabaseSchema, OpenAiConfig};
use pg_mcp_error::{LmErrorKind, PgMcpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a PostgreSQL expert. Convert the user's natural-language \
question into a single, safe, read-only SQL query.\n\n\
Rules:\n\
1. Only generate SELECT (or UNION/INTERSECT/EXCEPT of SELECTs) statements — never INSERT, \
UPDATE, DELETE, or any DDL.\n\
2. Do not add a LIMIT clause; the caller appends one.\n\
3. Always qualify table names with their schema (schema.table) and use the exact table/column \
names given in the schema below.\n\
4. Never call dangerous functions (pg_sleep, dblink, pg_read_file, lo_import/lo_export, or any \
function that performs I/O or sleeps).\n\
5. Prefer explicit JOINs over implicit comma joins.\n\n\
Respond with a JSON object with exactly two fields: \"sql\" (the query, or null if the question \
cannot be answered from the schema) and \"explanation\" (a brief explanation, or your reasoning \
for returning null).";

/// The structured result a [`SqlGenerator`] produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlGenerationResult {
    /// The generated SQL statement text.
    pub sql: String,
    /// An optional brief explanation of what the query does.
    pub explanation: Option<String>,
    /// Tokens consumed by this single call, for `record_tokens` (§4.7).
    pub tokens_used: u32,
}

/// The narrow capability interface the orchestrator consumes (§9): a
/// mock implementation can replace the vendor client 1:1 in tests.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Generate SQL grounded in `schema` for `question`. `error_context`
    /// carries the previous attempt's database error text on a syntax
    /// retry (§4.8 transition 4).
    ///
    /// # Errors
    ///
    /// Returns `PgMcpError::OpenAiError` on any provider failure; the
    /// `kind` field drives the orchestrator's retry decision (§7).
    async fn generate_sql(
        &self,
        question: &str,
        schema: &DatabaseSchema,
        error_context: Option<&str>,
    ) -> Result<SqlGenerationResult>;
}

/// OpenAI-compatible chat-completions client. Works against the real
/// OpenAI API or any compatible proxy via `base_url`.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: OpenAiConfig,
    backoff: ExponentialBackoff,
}

impl OpenAiClient {
    /// Build a client from the configured `openai.*` settings.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be constructed, which only
    /// happens for a malformed TLS configuration baked into the binary.
    #[must_use]
    pub fn new(config: OpenAiConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()
            .expect("reqwest client with default TLS settings always builds");
        Self {
            http,
            config,
            backoff: ExponentialBackoff::default(),
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.as_deref().unwrap_or("https://api.openai.com/v1");
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn user_message(schema: &DatabaseSchema, question: &str, error_context: Option<&str>) -> String {
        let mut message = format!("Database Schema:\n{}\n\nQuestion: {question}\n\n", schema.to_prompt_text());
        if let Some(err) = error_context {
            message.push_str(&format!("Previous attempt failed with error: {err}\nPlease fix the SQL query.\n"));
        }
        message
    }

    async fn send_once(&self, question: &str, schema: &DatabaseSchema, error_context: Option<&str>) -> Result<SqlGenerationResult> {
        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::user_message(schema, question, error_context)},
            ],
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PgMcpError::OpenAiError {
                message: format!("HTTP {status}: {text}"),
                kind: classify_status(status.as_u16()),
            });
        }

        let payload: ChatCompletion = response.json().await.map_err(|e| PgMcpError::OpenAiError {
            message: format!("failed to decode provider response: {e}"),
            kind: LmErrorKind::ServerError,
        })?;

        parse_completion(payload)
    }

    /// Advisory LM-based result sanity check (§9 Open Question b). It
    /// returns `is_valid=true` on an empty result set, matching the
    /// original's deliberately non-authoritative behavior; its output
    /// must never participate in audit-event-type classification.
    #[must_use]
    pub fn validate_result_advisory(_question: &str, _sql: &str, row_count: usize) -> (bool, Option<String>) {
        if row_count == 0 {
            return (true, Some("Empty result set".to_string()));
        }
        (true, None)
    }
}

#[async_trait]
impl SqlGenerator for OpenAiClient {
    async fn generate_sql(&self, question: &str, schema: &DatabaseSchema, error_context: Option<&str>) -> Result<SqlGenerationResult> {
        info!(database = %schema.name, retry = error_context.is_some(), "requesting SQL generation");

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(question, schema, error_context).await {
                Ok(result) => return Ok(result),
                Err(PgMcpError::OpenAiError { kind, message }) if kind.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.backoff.delay_for(attempt);
                    warn!(attempt, ?kind, %message, delay_ms = delay.as_millis(), "language-model call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify_status(status: u16) -> LmErrorKind {
    match status {
        401 | 403 => LmErrorKind::Auth,
        400 | 404 | 422 => LmErrorKind::InvalidRequest,
        429 => LmErrorKind::RateLimit,
        500..=599 => LmErrorKind::ServerError,
        _ => LmErrorKind::ServerError,
    }
}

fn classify_transport_error(e: &reqwest::Error) -> PgMcpError {
    let kind = if e.is_timeout() {
        LmErrorKind::Timeout
    } else if e.is_connect() {
        LmErrorKind::ServerError
    } else {
        LmErrorKind::ServerError
    };
    PgMcpError::OpenAiError {
        message: e.to_string(),
        kind,
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct SqlPayload {
    sql: Option<String>,
    explanation: Option<String>,
}

fn parse_completion(payload: ChatCompletion) -> Result<SqlGenerationResult> {
    let tokens_used = payload.usage.map(|u| u.total_tokens).unwrap_or(0);
    let content = payload
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| PgMcpError::OpenAiError {
            message: "empty response from provider".to_string(),
            kind: LmErrorKind::ServerError,
        })?;

    let parsed: SqlPayload = serde_json::from_str(&content).map_err(|e| PgMcpError::OpenAiError {
        message: format!("invalid JSON response: {e}"),
        kind: LmErrorKind::InvalidRequest,
    })?;

    let sql = parsed.sql.filter(|s| !s.trim().is_empty()).ok_or_else(|| PgMcpError::OpenAiError {
        message: format!(
            "no SQL generated: {}",
            parsed.explanation.as_deref().unwrap_or("unable to generate SQL")
        ),
        kind: LmErrorKind::InvalidRequest,
    })?;

    debug!(tokens_used, sql_len = sql.len(), "SQL generated successfully");
    Ok(SqlGenerationResult {
        sql: sql.trim().to_string(),
        explanation: parsed.explanation,
        tokens_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_mcp_core::config::Secret;
    use serde_json::json as j;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> OpenAiConfig {
        OpenAiConfig {
            api_key: Secret::from("sk-test".to_string()),
            model: "gpt-4o-mini".to_string(),
            base_url: Some(base_url),
            max_retries: 2,
            timeout: 5.0,
        }
    }

    fn completion_body(content: &str) -> serde_json::Value {
        j({
            "choices": [{"message": {"content": content}}],
            "usage": {"total_tokens": 42}
        })
    }

    #[tokio::test]
    async fn parses_successful_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
                r#"{"sql": "SELECT 1", "explanation": "trivial"}"#,
            )))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(test_config(server.uri()));
        let schema = DatabaseSchema {
            name: "main".to_string(),
            ..Default::default()
        };
        let result = client.generate_sql("anything", &schema, None).await.expect("generates");
        assert_eq!(result.sql, "SELECT 1");
        assert_eq!(result.tokens_used, 42);
    }

    #[tokio::test]
    async fn retries_on_server_error_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(r#"{"sql": "SELECT 2"}"#)))
            .mount(&server)
            .await;

        let mut config = test_config(server.uri());
        config.max_retries = 3;
        let mut client = OpenAiClient::new(config);
        client.backoff = ExponentialBackoff {
            initial: Duration::from_millis(1),
            multiplier: 1.0,
            max: Duration::from_millis(2),
        };
        let schema = DatabaseSchema {
            name: "main".to_string(),
            ..Default::default()
        };
        let result = client.generate_sql("anything", &schema, None).await.expect("eventually generates");
        assert_eq!(result.sql, "SELECT 2");
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let client = OpenAiClient::new(test_config(server.uri()));
        let schema = DatabaseSchema::default();
        let err = client.generate_sql("anything", &schema, None).await.unwrap_err();
        assert!(matches!(err, PgMcpError::OpenAiError { kind: LmErrorKind::Auth, .. }));
    }

    #[test]
    fn validate_result_advisory_passes_on_empty_result() {
        let (is_valid, note) = OpenAiClient::validate_result_advisory("q", "SELECT 1", 0);
        assert!(is_valid);
        assert_eq!(note.as_deref(), Some("Empty result set"));
    }

    #[test]
    fn null_sql_is_rejected_with_invalid_request_kind() {
        let payload = ChatCompletion {
            choices: vec![ChatChoice {
                message: ChatMessage {
                    content: Some(r#"{"sql": null, "explanation": "ambiguous question"}"#.to_string()),
                },
            }],
            usage: None,
        };
        let err = parse_completion(payload).unwrap_err();
        assert!(matches!(err, PgMcpError::OpenAiError { kind: LmErrorKind::InvalidRequest, .. }));
    }
}
