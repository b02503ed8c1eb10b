//! Projection rewriting (§4.4): expands a bare `SELECT *` into an
//! explicit column list when `select_star_policy == expand`, and
//! replaces a denied column with `NULL AS column` when `on_denied ==
//! redact`.
//!
//! Builds on the same technique `pg-mcp-sql`'s canonicalization pass
//! uses: parse with `sqlparser`, mutate the AST in place, and let its
//! `Display` impl regenerate the SQL text. Only the single-table case is
//! expanded; a multi-table `SELECT *` is left as-is; it only ever gets
//! there because the policy check allowed it (no deny patterns matched
//! an unresolvable qualifier, §4.4).

use pg_mcp_core::{AccessPolicy, DatabaseSchema, OnDenied};
use pg_mcp_error::{PgMcpError, Result};
use pg_mcp_policy::column_matches_any;
use sqlparser::ast::{Expr, Ident, ObjectName, Select, SelectItem, SetExpr, Statement, TableFactor, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Rewrite `sql`'s projection per `policy`/`schema`. Returns the
/// (possibly unchanged) SQL text and the `(table, column)` pairs that
/// were redacted to `NULL`, for the audit record.
///
/// # Errors
///
/// Returns `PgMcpError::SyntaxError` if `sql` does not parse.
pub fn rewrite_projection(sql: &str, schema: &DatabaseSchema, policy: &AccessPolicy) -> Result<(String, Vec<(String, String)>)> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| PgMcpError::SyntaxError {
        message: e.to_string(),
        position: None,
    })?;

    let Some(Statement::Query(query)) = statements.first_mut() else {
        return Ok((sql.to_string(), Vec::new()));
    };

    let SetExpr::Select(select) = query.body.as_mut() else {
        return Ok((sql.to_string(), Vec::new()));
    };

    let mut redacted = Vec::new();
    let single_table = single_table_name(select);
    expand_wildcards(select, schema, policy, &single_table);
    redact_denied_columns(select, policy, &single_table, &mut redacted);

    Ok((statements[0].to_string(), redacted))
}

fn single_table_name(select: &Select) -> Option<String> {
    match select.from.as_slice() {
        [twj] if twj.joins.is_empty() => match &twj.relation {
            TableFactor::Table { name, .. } => Some(last_part(name)),
            _ => None,
        },
        _ => None,
    }
}

fn last_part(name: &ObjectName) -> String {
    name.0.last().map(|i| i.value.clone()).unwrap_or_default()
}

fn expand_wildcards(select: &mut Select, schema: &DatabaseSchema, policy: &AccessPolicy, single_table: &Option<String>) {
    if policy.select_star_policy != pg_mcp_core::SelectStarPolicy::Expand {
        return;
    }

    let Some(table_name) = single_table else { return };
    let Some(table) = schema.get_table(table_name, None) else { return };

    let mut expanded = Vec::new();
    let mut changed = false;
    for item in std::mem::take(&mut select.projection) {
        match &item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                changed = true;
                for column in &table.columns {
                    if column_matches_any(&policy.columns.denied_patterns, table_name, &column.name) {
                        continue;
                    }
                    expanded.push(SelectItem::UnnamedExpr(Expr::Identifier(Ident::new(column.name.clone()))));
                }
            }
            _ => expanded.push(item),
        }
    }
    select.projection = expanded;
    if changed {
        tracing::debug!(table = table_name, "expanded SELECT * into explicit column list");
    }
}

fn redact_denied_columns(select: &mut Select, policy: &AccessPolicy, single_table: &Option<String>, redacted: &mut Vec<(String, String)>) {
    if policy.on_denied != OnDenied::Redact {
        return;
    }

    for item in &mut select.projection {
        let resolved = match item {
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => single_table.clone().map(|table| (table, ident.value.clone())),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) if parts.len() == 2 => {
                Some((parts[0].value.clone(), parts[1].value.clone()))
            }
            _ => None,
        };
        let Some((table_name, column_name)) = resolved else { continue };

        if !column_matches_any(&policy.columns.denied_patterns, &table_name, &column_name) {
            continue;
        }

        redacted.push((table_name, column_name.clone()));
        *item = SelectItem::ExprWithAlias {
            expr: Expr::Value(Value::Null),
            alias: Ident::new(column_name),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_mcp_core::schema::{ColumnInfo, TableInfo};
    use std::collections::BTreeMap;

    fn schema_with_users() -> DatabaseSchema {
        let table = TableInfo {
            name: "users".to_string(),
            schema_name: "public".to_string(),
            columns: vec![
                ColumnInfo {
                    name: "id".to_string(),
                    data_type: "int4".to_string(),
                    is_nullable: false,
                    is_primary_key: true,
                    is_unique: true,
                    default_value: None,
                    comment: None,
                    foreign_key: None,
                    enum_values: None,
                },
                ColumnInfo {
                    name: "password".to_string(),
                    data_type: "text".to_string(),
                    is_nullable: false,
                    is_primary_key: false,
                    is_unique: false,
                    default_value: None,
                    comment: None,
                    foreign_key: None,
                    enum_values: None,
                },
            ],
            indexes: Vec::new(),
            comment: None,
            estimated_row_count: 10,
        };
        DatabaseSchema {
            name: "main".to_string(),
            tables: BTreeMap::from([(("public".to_string(), "users".to_string()), table)]),
            views: BTreeMap::new(),
            enum_types: BTreeMap::new(),
            cached_at: None,
        }
    }

    #[test]
    fn expands_wildcard_omitting_denied_column() {
        let schema = schema_with_users();
        let mut policy = AccessPolicy::default();
        policy.columns.denied_patterns.push("*.password".to_string());

        let (rewritten, redacted) = rewrite_projection("SELECT * FROM users", &schema, &policy).expect("rewrites");
        assert!(rewritten.to_lowercase().contains("id"));
        assert!(!rewritten.to_lowercase().contains("password"));
        assert!(redacted.is_empty());
    }

    #[test]
    fn redacts_denied_column_to_null_with_alias() {
        let schema = schema_with_users();
        let mut policy = AccessPolicy::default();
        policy.select_star_policy = pg_mcp_core::SelectStarPolicy::Allow;
        policy.on_denied = OnDenied::Redact;
        policy.columns.denied_patterns.push("*.password".to_string());

        let (rewritten, redacted) = rewrite_projection("SELECT id, password FROM users", &schema, &policy).expect("rewrites");
        assert!(rewritten.to_uppercase().contains("NULL AS password".to_uppercase().as_str()));
        assert_eq!(redacted, vec![("users".to_string(), "password".to_string())]);
    }
}
