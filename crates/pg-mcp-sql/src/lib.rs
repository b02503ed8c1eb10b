//! SQL Parser (C3, §4.3): statement classification, table/column
//! reference extraction with alias resolution, and the LIMIT
//! canonicalization pass.

mod canonicalize;
mod extract;

use pg_mcp_error::{PgMcpError, Result};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

pub use canonicalize::canonicalize;
pub use extract::{ParsedSqlInfo, StatementKind};

/// Parse `sql` under the Postgres dialect and extract [`ParsedSqlInfo`].
///
/// # Errors
///
/// Returns `PgMcpError::SyntaxError` if the statement does not parse, or
/// if it parses to zero or more than one statement (a single request is
/// always exactly one statement).
pub fn parse(sql: &str) -> Result<ParsedSqlInfo> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| PgMcpError::SyntaxError {
        message: e.to_string(),
        position: extract_position(&e.to_string()),
    })?;

    match statements.as_slice() {
        [statement] => Ok(extract::extract(statement)),
        [] => Err(PgMcpError::SyntaxError {
            message: "empty statement".to_string(),
            position: None,
        }),
        _ => Err(PgMcpError::SyntaxError {
            message: format!("expected a single statement, found {}", statements.len()),
            position: None,
        }),
    }
}

/// `sqlparser`'s error `Display` sometimes embeds `Line: N, Column: M`;
/// pull it out on a best-effort basis rather than re-parsing the error
/// type across dialect-specific variants.
fn extract_position(message: &str) -> Option<String> {
    message.split("Line: ").nth(1).map(|rest| format!("Line: {rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_select_and_collects_tables() {
        let info = parse("SELECT id, name FROM public.users WHERE active = true").expect("parses");
        assert_eq!(info.kind, StatementKind::Select);
        assert!(info.tables.contains(&(Some("public".to_string()), "users".to_string())));
        assert!(!info.has_select_star);
    }

    #[test]
    fn detects_select_star() {
        let info = parse("SELECT * FROM users").expect("parses");
        assert!(info.has_select_star);
    }

    #[test]
    fn resolves_alias_to_underlying_table_in_column_refs() {
        let info = parse("SELECT u.email FROM users u WHERE u.id = 1").expect("parses");
        assert!(info.columns.contains(&(Some("users".to_string()), "email".to_string())));
    }

    #[test]
    fn classifies_union_as_union_kind() {
        let info = parse("SELECT id FROM a UNION SELECT id FROM b").expect("parses");
        assert_eq!(info.kind, StatementKind::Union);
    }

    #[test]
    fn classifies_insert_update_delete() {
        assert_eq!(parse("INSERT INTO t (a) VALUES (1)").unwrap().kind, StatementKind::Insert);
        assert_eq!(parse("UPDATE t SET a = 1").unwrap().kind, StatementKind::Update);
        assert_eq!(parse("DELETE FROM t").unwrap().kind, StatementKind::Delete);
    }

    #[test]
    fn classifies_ddl() {
        assert_eq!(parse("CREATE TABLE t (a INT)").unwrap().kind, StatementKind::Ddl);
    }

    #[test]
    fn invalid_sql_returns_syntax_error() {
        let err = parse("SELEKT * FROM users").unwrap_err();
        assert!(matches!(err, PgMcpError::SyntaxError { .. }));
    }

    #[test]
    fn traverses_cte_and_subquery_tables() {
        let info = parse(
            "WITH recent AS (SELECT id FROM orders WHERE created_at > now() - interval '1 day') \
             SELECT * FROM recent JOIN customers ON recent.id = customers.order_id",
        )
        .expect("parses");
        assert!(info.tables.contains(&(None, "orders".to_string())));
        assert!(info.tables.contains(&(None, "customers".to_string())));
    }

    #[test]
    fn collects_columns_referenced_only_in_order_by() {
        let info = parse("SELECT id FROM public.events ORDER BY secret_col").expect("parses");
        assert!(info.columns.contains(&(None, "secret_col".to_string())));
    }

    #[test]
    fn collects_columns_referenced_only_in_group_by() {
        let info = parse("SELECT count(*) FROM public.events GROUP BY secret_col").expect("parses");
        assert!(info.columns.contains(&(None, "secret_col".to_string())));
    }
}
