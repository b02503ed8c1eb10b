//! Access Policy (C4, §4.4): runs the four-check validation pipeline
//! over a parsed statement and a database's `AccessPolicy`.

use pg_mcp_core::{AccessPolicy, OnDenied, SelectStarPolicy};
use pg_mcp_sql::ParsedSqlInfo;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

/// One failed check, in the order the pipeline found it.
#[derive(Debug, Clone, Serialize)]
pub enum PolicyViolation {
    /// A referenced table's schema is outside `allowed_schemas`.
    SchemaDenied {
        /// The offending schema.
        schema: String,
    },
    /// A referenced table is outside `tables.allowed` or inside `tables.denied`.
    TableDenied {
        /// Schema name.
        schema: String,
        /// Table name.
        table: String,
    },
    /// `SELECT *` appeared and `select_star_policy == deny`.
    SelectStarDenied,
    /// A column matched a deny pattern and `on_denied == reject`.
    ColumnDenied {
        /// Table (or unresolved alias) the column belongs to.
        table: String,
        /// Column name.
        column: String,
    },
}

/// Outcome of running the four-check pipeline over one parsed statement.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PolicyValidationResult {
    /// Violations found, in check order. Empty means the statement is
    /// allowed to proceed (modulo `redacted_columns`/`needs_expansion`).
    pub violations: Vec<PolicyViolation>,
    /// Columns that matched a deny pattern but were redacted rather than
    /// denied (`on_denied == redact`); the orchestrator rewrites these as
    /// `NULL AS column`.
    pub redacted_columns: Vec<(String, String)>,
    /// Set when `select_star_policy == expand`: the orchestrator must
    /// re-render the statement's projection from the schema snapshot,
    /// omitting columns that would match a deny pattern.
    pub needs_star_expansion: bool,
}

impl PolicyValidationResult {
    /// Whether the statement passed every check (redaction is still a pass).
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Run the four checks from §4.4 against `parsed` under `policy`.
#[must_use]
pub fn validate(parsed: &ParsedSqlInfo, policy: &AccessPolicy) -> PolicyValidationResult {
    let mut result = PolicyValidationResult::default();

    // 1. Schema check.
    for (schema, _table) in &parsed.tables {
        let schema = schema.as_deref().unwrap_or("public");
        if !policy.allowed_schemas.contains(schema) {
            result.violations.push(PolicyViolation::SchemaDenied {
                schema: schema.to_string(),
            });
        }
    }

    // 2. Table check (`denied` always wins, enforced inside `table_allowed`).
    for (schema, table) in &parsed.tables {
        let schema = schema.as_deref().unwrap_or("public");
        if !policy.table_allowed(schema, table) {
            result.violations.push(PolicyViolation::TableDenied {
                schema: schema.to_string(),
                table: table.clone(),
            });
        }
    }

    // 3. SELECT * handling.
    if parsed.has_select_star {
        match policy.select_star_policy {
            SelectStarPolicy::Allow => {}
            SelectStarPolicy::Expand => result.needs_star_expansion = true,
            SelectStarPolicy::Deny => result.violations.push(PolicyViolation::SelectStarDenied),
        }
    }

    // 4. Column check: each `table.column` matched against every
    // `columns.denied_patterns` entry, in order; first match wins.
    let single_table = single_table_name(parsed);
    for (qualifier, column) in &parsed.columns {
        let Some(table) = qualifier.clone().or_else(|| single_table.clone()) else {
            warn!(column, "column reference has no resolvable table; skipping column check");
            continue;
        };

        let Some(_matched_pattern) = first_matching_pattern(&policy.columns.denied_patterns, &table, column) else {
            continue;
        };

        match policy.on_denied {
            OnDenied::Redact => result.redacted_columns.push((table, column.clone())),
            OnDenied::Reject => result.violations.push(PolicyViolation::ColumnDenied { table, column: column.clone() }),
        }
    }

    result
}

fn single_table_name(parsed: &ParsedSqlInfo) -> Option<String> {
    let mut tables = parsed.tables.iter();
    let (_, first) = tables.next()?;
    if tables.next().is_some() {
        None
    } else {
        Some(first.clone())
    }
}

fn first_matching_pattern<'a>(patterns: &'a [String], table: &str, column: &str) -> Option<&'a str> {
    let candidate = format!("{table}.{column}").to_lowercase();
    patterns.iter().find(|p| glob_matches(p, &candidate)).map(String::as_str)
}

/// Whether `table.column` matches any of `patterns` (§4.4's glob rules).
/// Exposed so the orchestrator's `SELECT *` expansion can drop denied
/// columns using the exact same matching semantics as the column check.
#[must_use]
pub fn column_matches_any(patterns: &[String], table: &str, column: &str) -> bool {
    first_matching_pattern(patterns, table, column).is_some()
}

/// Match `candidate` (already `table.column`, lowercase) against `pattern`,
/// where `*` matches any run of non-`.` characters and `.` is literal.
fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let mut out = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str("[^.]*"),
            '.' => out.push_str(r"\."),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    let Ok(regex) = Regex::new(&out) else {
        warn!(pattern, "deny pattern compiled to an invalid regex; treating as no match");
        return false;
    };
    regex.is_match(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_mcp_core::{ColumnRules, TableRules};
    use std::collections::HashSet;

    fn parsed_from(sql: &str) -> ParsedSqlInfo {
        pg_mcp_sql::parse(sql).expect("test SQL parses")
    }

    #[test]
    fn denies_table_outside_allowed_schema() {
        let parsed = parsed_from("SELECT id FROM secret.accounts");
        let policy = AccessPolicy::default();
        let result = validate(&parsed, &policy);
        assert!(!result.is_allowed());
        assert!(matches!(result.violations[0], PolicyViolation::SchemaDenied { .. }));
    }

    #[test]
    fn denies_table_in_deny_list_even_if_schema_allowed() {
        let parsed = parsed_from("SELECT id FROM public.secrets");
        let mut policy = AccessPolicy::default();
        policy.tables.denied.insert("public.secrets".to_string());
        let result = validate(&parsed, &policy);
        assert!(!result.is_allowed());
        assert!(matches!(result.violations.last().unwrap(), PolicyViolation::TableDenied { .. }));
    }

    #[test]
    fn glob_pattern_denies_matching_column() {
        let parsed = parsed_from("SELECT password FROM users");
        let mut policy = AccessPolicy::default();
        policy.columns.denied_patterns.push("*.password".to_string());
        let result = validate(&parsed, &policy);
        assert!(matches!(result.violations.last().unwrap(), PolicyViolation::ColumnDenied { column, .. } if column == "password"));
    }

    #[test]
    fn redact_on_denied_does_not_produce_a_violation() {
        let parsed = parsed_from("SELECT password FROM users");
        let mut policy = AccessPolicy::default();
        policy.columns.denied_patterns.push("*.password".to_string());
        policy.on_denied = OnDenied::Redact;
        let result = validate(&parsed, &policy);
        assert!(result.is_allowed());
        assert_eq!(result.redacted_columns, vec![("users".to_string(), "password".to_string())]);
    }

    #[test]
    fn select_star_expand_flags_instead_of_denying() {
        let parsed = parsed_from("SELECT * FROM users");
        let policy = AccessPolicy::default();
        let result = validate(&parsed, &policy);
        assert!(result.is_allowed());
        assert!(result.needs_star_expansion);
    }

    #[test]
    fn select_star_deny_produces_violation() {
        let parsed = parsed_from("SELECT * FROM users");
        let mut policy = AccessPolicy::default();
        policy.select_star_policy = SelectStarPolicy::Deny;
        let result = validate(&parsed, &policy);
        assert!(matches!(result.violations[0], PolicyViolation::SelectStarDenied));
    }

    #[test]
    fn resolves_qualified_column_through_alias() {
        let parsed = parsed_from("SELECT u.password FROM users u");
        let mut policy = AccessPolicy::default();
        policy.columns.denied_patterns.push("users.password".to_string());
        let result = validate(&parsed, &policy);
        assert!(!result.is_allowed());
    }

    #[test]
    fn empty_policy_denies_nothing() {
        let parsed = parsed_from("SELECT * FROM public.users JOIN public.orders ON true");
        let policy = AccessPolicy {
            allowed_schemas: HashSet::from(["public".to_string()]),
            tables: TableRules::default(),
            columns: ColumnRules::default(),
            select_star_policy: SelectStarPolicy::Allow,
            on_denied: OnDenied::Reject,
            explain_policy: pg_mcp_core::ExplainPolicy::default(),
        };
        let result = validate(&parsed, &policy);
        assert!(result.is_allowed());
    }
}
