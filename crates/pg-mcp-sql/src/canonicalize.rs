//! LIMIT canonicalization pass (§4.3): a bare top-level `SELECT` with no
//! `LIMIT` gets one injected. `UNION`/`INTERSECT`/`EXCEPT` are left
//! alone — see Open Question (a): the LM was told the column rules, and
//! a set operation's result size is bounded by its slowest branch, not a
//! single `SELECT`'s; injecting a LIMIT into only one side would change
//! the query's meaning, not just its size.

use pg_mcp_error::{PgMcpError, Result};
use sqlparser::ast::{Expr, SetExpr, Statement, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// Append `LIMIT max_result_rows` to `sql` if it is a bare `SELECT` with
/// no `LIMIT` already present. Returns the original text unchanged for
/// any other statement shape (including `UNION`).
///
/// # Errors
///
/// Returns `PgMcpError::SyntaxError` if `sql` does not parse, or parses
/// to anything other than exactly one statement.
pub fn canonicalize(sql: &str, max_result_rows: u64) -> Result<String> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| PgMcpError::SyntaxError {
        message: e.to_string(),
        position: None,
    })?;

    let statement = match statements.as_mut_slice() {
        [statement] => statement,
        other => {
            return Err(PgMcpError::SyntaxError {
                message: format!("expected a single statement, found {}", other.len()),
                position: None,
            })
        }
    };

    if let Statement::Query(query) = statement {
        if matches!(*query.body, SetExpr::Select(_)) && query.limit.is_none() {
            debug!(max_result_rows, "injecting LIMIT into bare SELECT");
            query.limit = Some(Expr::Value(Value::Number(max_result_rows.to_string(), false)));
        }
    }

    Ok(statement.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_limit_on_bare_select() {
        let out = canonicalize("SELECT id FROM users", 100).expect("canonicalizes");
        assert!(out.to_uppercase().contains("LIMIT 100"));
    }

    #[test]
    fn leaves_existing_limit_untouched() {
        let out = canonicalize("SELECT id FROM users LIMIT 10", 100).expect("canonicalizes");
        assert!(out.to_uppercase().contains("LIMIT 10"));
        assert!(!out.to_uppercase().contains("LIMIT 100"));
    }

    #[test]
    fn union_is_not_limited() {
        let sql = "SELECT id FROM a UNION SELECT id FROM b";
        let out = canonicalize(sql, 50).expect("canonicalizes");
        assert!(!out.to_uppercase().contains("LIMIT"));
    }
}
