//! Audit event data model (§3, Testable Property 9).
//!
//! Every request terminates with exactly one audit event. Events are
//! append-only and never mutated after construction; the orchestrator
//! builds one near the end of every terminal transition and hands it to
//! an audit sink (see `pg-mcp-orchestrator::audit`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The outcome an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The query executed and a result was returned.
    QueryExecuted,
    /// The query was denied by cost/safety validation (not access policy).
    QueryDenied,
    /// The query failed for a reason other than a policy/cost denial.
    QueryFailed,
    /// The query was denied by the access policy.
    PolicyViolation,
}

/// Identity of the caller that issued the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Opaque client identifier used by the rate limiter (IP, API-key hash, or `"anonymous"`).
    pub client_id: String,
    /// Origin IP address, if known.
    pub ip_address: Option<String>,
}

/// The question and SQL involved in a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInfo {
    /// The natural-language question.
    pub question: String,
    /// The generated SQL, truncated to 500 bytes before storage.
    pub generated_sql: Option<String>,
    /// The target database name.
    pub database: String,
}

/// The access-policy outcome for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCheckInfo {
    /// Whether the policy check passed.
    pub passed: bool,
    /// Human-readable violation summaries, if any.
    pub violations: Vec<String>,
}

/// The execution outcome for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultInfo {
    /// Rows returned (after truncation).
    pub row_count: usize,
    /// Wall-clock duration of execution, in milliseconds.
    pub duration_ms: u64,
    /// Whether the result was truncated to `max_result_rows`.
    pub truncated: bool,
}

/// An append-only audit record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// The event's outcome classification.
    pub event_type: AuditEventType,
    /// Caller identity.
    pub client_info: ClientInfo,
    /// Question/SQL/database involved.
    pub query_info: QueryInfo,
    /// Access-policy outcome, if the policy check ran.
    pub policy_check_info: Option<PolicyCheckInfo>,
    /// Execution outcome, if execution ran.
    pub result_info: Option<ResultInfo>,
    /// Error detail, if the event represents a failure or denial.
    pub error_info: Option<String>,
}

impl AuditEvent {
    /// Truncation cap, in bytes, applied to `query_info.generated_sql`.
    pub const SQL_TRUNCATE_BYTES: usize = 500;

    /// Build a new audit event, truncating `generated_sql` to
    /// [`Self::SQL_TRUNCATE_BYTES`] bytes on a UTF-8 boundary.
    #[must_use]
    pub fn new(
        event_type: AuditEventType,
        client_info: ClientInfo,
        question: impl Into<String>,
        generated_sql: Option<String>,
        database: impl Into<String>,
    ) -> Self {
        let truncated_sql = generated_sql.map(|sql| truncate_utf8(&sql, Self::SQL_TRUNCATE_BYTES));
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            client_info,
            query_info: QueryInfo {
                question: question.into(),
                generated_sql: truncated_sql,
                database: database.into(),
            },
            policy_check_info: None,
            result_info: None,
            error_info: None,
        }
    }

    /// Attach the access-policy outcome.
    #[must_use]
    pub fn with_policy_check(mut self, info: PolicyCheckInfo) -> Self {
        self.policy_check_info = Some(info);
        self
    }

    /// Attach the execution outcome.
    #[must_use]
    pub fn with_result(mut self, info: ResultInfo) -> Self {
        self.result_info = Some(info);
        self
    }

    /// Attach an error message.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_info = Some(message.into());
        self
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_sql_on_a_char_boundary() {
        let long_sql = "x".repeat(600);
        let event = AuditEvent::new(
            AuditEventType::QueryExecuted,
            ClientInfo {
                client_id: "anonymous".to_string(),
                ip_address: None,
            },
            "question",
            Some(long_sql),
            "main",
        );
        let sql = event.query_info.generated_sql.expect("sql present");
        assert_eq!(sql.len(), AuditEvent::SQL_TRUNCATE_BYTES);
    }

    #[test]
    fn builder_methods_set_optional_fields() {
        let event = AuditEvent::new(
            AuditEventType::PolicyViolation,
            ClientInfo {
                client_id: "client-1".to_string(),
                ip_address: Some("10.0.0.1".to_string()),
            },
            "q",
            None,
            "main",
        )
        .with_policy_check(PolicyCheckInfo {
            passed: false,
            violations: vec!["column denied".to_string()],
        })
        .with_error("access denied");

        assert!(event.policy_check_info.is_some());
        assert_eq!(event.error_info.as_deref(), Some("access denied"));
    }
}
