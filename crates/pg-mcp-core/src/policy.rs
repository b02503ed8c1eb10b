//! Access policy and EXPLAIN policy data model (§3, §4.4, §4.5).

use std::collections::HashSet;
use std::sync::LazyLock;

use pg_mcp_error::{PgMcpError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a bare `SELECT *` is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectStarPolicy {
    /// Leave `SELECT *` as-is.
    Allow,
    /// Expand to the concrete column list, omitting denied columns.
    #[default]
    Expand,
    /// Treat `SELECT *` itself as a column-access violation.
    Deny,
}

/// What happens when a column check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnDenied {
    /// Fail the request with a `ColumnAccessDenied` violation.
    #[default]
    Reject,
    /// Replace the column with `NULL AS column_name` and continue.
    Redact,
}

/// Table allow/deny rules. An empty `allowed` set means "all tables
/// allowed"; `denied` always takes precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableRules {
    /// `schema.table` entries explicitly allowed. Empty means unrestricted.
    #[serde(default)]
    pub allowed: HashSet<String>,
    /// `schema.table` entries explicitly denied; wins over `allowed`.
    #[serde(default)]
    pub denied: HashSet<String>,
}

/// Column deny-pattern rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnRules {
    /// Ordered glob patterns over `table.column`, matched case-insensitively.
    #[serde(default)]
    pub denied_patterns: Vec<String>,
}

/// Access policy for one configured database (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Schemas a query's tables must belong to. Defaults to `{public}`.
    #[serde(default = "default_allowed_schemas")]
    pub allowed_schemas: HashSet<String>,
    /// Table allow/deny rules.
    #[serde(default)]
    pub tables: TableRules,
    /// Column deny-pattern rules.
    #[serde(default)]
    pub columns: ColumnRules,
    /// How bare `SELECT *` is handled.
    #[serde(default)]
    pub select_star_policy: SelectStarPolicy,
    /// What happens on a column-check failure.
    #[serde(default)]
    pub on_denied: OnDenied,
    /// EXPLAIN-based cost and scan policy.
    #[serde(default)]
    pub explain_policy: ExplainPolicy,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            allowed_schemas: default_allowed_schemas(),
            tables: TableRules::default(),
            columns: ColumnRules::default(),
            select_star_policy: SelectStarPolicy::default(),
            on_denied: OnDenied::default(),
            explain_policy: ExplainPolicy::default(),
        }
    }
}

fn default_allowed_schemas() -> HashSet<String> {
    HashSet::from(["public".to_string()])
}

static PATTERN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.*-]+$").expect("valid regex"));

impl AccessPolicy {
    /// Validate static invariants and return non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if a table appears in both `allowed`
    /// and `denied`, or if a deny pattern contains characters outside
    /// `[a-zA-Z0-9_.*-]`.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        let conflict = self.tables.allowed.intersection(&self.tables.denied).next();
        if let Some(table) = conflict {
            return Err(PgMcpError::configuration(format!(
                "table '{table}' appears in both tables.allowed and tables.denied"
            )));
        }

        for pattern in &self.columns.denied_patterns {
            if !PATTERN_RE.is_match(pattern) {
                return Err(PgMcpError::configuration(format!("invalid column deny pattern '{pattern}'")));
            }
            let wildcard_count = pattern.matches('*').count();
            if wildcard_count > 2 {
                warnings.push(format!("deny pattern '{pattern}' has more than 2 wildcards"));
            }
            if pattern == "*.*" || pattern == "*" {
                warnings.push(format!("deny pattern '{pattern}' matches every column"));
            }
        }

        if self.allowed_schemas.is_empty() {
            warnings.push("no allowed_schemas configured; all schemas are implicitly denied".to_string());
        }
        if self.tables.allowed.is_empty() && self.tables.denied.is_empty() {
            warnings.push("no table restrictions configured; all tables in allowed schemas are reachable".to_string());
        }

        Ok(warnings)
    }

    /// Whether `schema.table` is reachable under `tables.allowed`/`tables.denied`.
    #[must_use]
    pub fn table_allowed(&self, schema: &str, table: &str) -> bool {
        let qualified = format!("{schema}.{table}");
        if self.tables.denied.contains(&qualified) {
            return false;
        }
        self.tables.allowed.is_empty() || self.tables.allowed.contains(&qualified)
    }
}

/// EXPLAIN-based cost and sequential-scan policy (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainPolicy {
    /// Whether EXPLAIN validation runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root `Plan Rows` above this denies the query.
    #[serde(default = "default_max_estimated_rows")]
    pub max_estimated_rows: i64,
    /// Root `Total Cost` above this only warns.
    #[serde(default = "default_max_estimated_cost")]
    pub max_estimated_cost: f64,
    /// Whether a sequential scan on a large table denies the query.
    #[serde(default = "default_true")]
    pub deny_seq_scan_on_large_tables: bool,
    /// Row-count threshold above which a table counts as "large".
    #[serde(default = "default_large_table_threshold")]
    pub large_table_threshold: i64,
    /// TTL, seconds, for the EXPLAIN-result cache.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Maximum number of cached EXPLAIN results.
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: u64,
    /// Timeout for the EXPLAIN statement itself, seconds.
    #[serde(default = "default_explain_timeout")]
    pub timeout_seconds: f64,
}

impl Default for ExplainPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_estimated_rows: default_max_estimated_rows(),
            max_estimated_cost: default_max_estimated_cost(),
            deny_seq_scan_on_large_tables: true,
            large_table_threshold: default_large_table_threshold(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_max_size: default_cache_max_size(),
            timeout_seconds: default_explain_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_estimated_rows() -> i64 {
    100_000
}
fn default_max_estimated_cost() -> f64 {
    100_000.0
}
fn default_large_table_threshold() -> i64 {
    100_000
}
fn default_cache_ttl_seconds() -> u64 {
    300
}
fn default_cache_max_size() -> u64 {
    1000
}
fn default_explain_timeout() -> f64 {
    5.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_table_in_both_allow_and_deny() {
        let mut policy = AccessPolicy::default();
        policy.tables.allowed.insert("public.users".to_string());
        policy.tables.denied.insert("public.users".to_string());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn denied_table_wins_at_lookup() {
        let mut policy = AccessPolicy::default();
        policy.tables.denied.insert("public.secrets".to_string());
        assert!(!policy.table_allowed("public", "secrets"));
    }

    #[test]
    fn warns_on_catch_all_pattern() {
        let mut policy = AccessPolicy::default();
        policy.columns.denied_patterns.push("*.*".to_string());
        let warnings = policy.validate().expect("valid");
        assert!(warnings.iter().any(|w| w.contains("matches every column")));
    }

    #[test]
    fn rejects_invalid_pattern_characters() {
        let mut policy = AccessPolicy::default();
        policy.columns.denied_patterns.push("users/password".to_string());
        assert!(policy.validate().is_err());
    }
}
