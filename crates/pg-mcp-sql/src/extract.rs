//! Table/column reference extraction and alias resolution over a parsed
//! `sqlparser` AST (§4.3).

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Cte, Expr, GroupByExpr, Join, JoinConstraint, JoinOperator, ObjectName, Query, Select, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins, With,
};

/// The broad kind of statement a parse produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    /// A single `SELECT` (including `VALUES`).
    Select,
    /// `UNION`/`INTERSECT`/`EXCEPT` between two query bodies.
    Union,
    /// `INSERT`.
    Insert,
    /// `UPDATE`.
    Update,
    /// `DELETE`.
    Delete,
    /// Schema-modifying statement (`CREATE`/`ALTER`/`DROP`/…).
    Ddl,
    /// Anything not covered above.
    Other,
}

/// A reference to a table or view, as `(schema, name)`; `schema` is
/// `None` when the query did not qualify it.
pub type TableRef = (Option<String>, String);

/// A reference to a column, as `(table_or_alias, column)`; the first
/// element is `None` for unqualified column references. Where the
/// qualifier names a resolvable alias, it has already been rewritten to
/// the underlying table name.
pub type ColumnRef = (Option<String>, String);

/// Everything the access policy and canonicalization passes need from a
/// parsed statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSqlInfo {
    /// The statement's broad kind.
    pub kind: StatementKind,
    /// Every real (non-derived, non-CTE) table or view referenced,
    /// aliases resolved to their underlying name.
    pub tables: BTreeSet<TableRef>,
    /// Every column reference found in the projection, `WHERE`, join
    /// conditions, and `GROUP BY`/`HAVING`/`ORDER BY` clauses.
    pub columns: BTreeSet<ColumnRef>,
    /// Whether any `SELECT *` or `SELECT table.*` appears.
    pub has_select_star: bool,
}

struct Walker {
    tables: BTreeSet<TableRef>,
    columns: BTreeSet<ColumnRef>,
    has_select_star: bool,
    aliases: HashMap<String, TableRef>,
    cte_names: BTreeSet<String>,
}

/// Extract table/column references and statement kind from `statement`.
#[must_use]
pub fn extract(statement: &Statement) -> ParsedSqlInfo {
    let mut walker = Walker {
        tables: BTreeSet::new(),
        columns: BTreeSet::new(),
        has_select_star: false,
        aliases: HashMap::new(),
        cte_names: BTreeSet::new(),
    };

    let kind = match statement {
        Statement::Query(query) => {
            walker.visit_query(query);
            set_expr_kind(&query.body)
        }
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateSchema { .. }
        | Statement::AlterTable { .. }
        | Statement::Drop { .. }
        | Statement::Truncate { .. } => StatementKind::Ddl,
        _ => StatementKind::Other,
    };

    ParsedSqlInfo {
        kind,
        tables: walker.tables,
        columns: walker.columns,
        has_select_star: walker.has_select_star,
    }
}

fn set_expr_kind(set_expr: &SetExpr) -> StatementKind {
    match set_expr {
        SetExpr::Select(_) | SetExpr::Values(_) => StatementKind::Select,
        SetExpr::SetOperation { .. } => StatementKind::Union,
        SetExpr::Query(inner) => set_expr_kind(&inner.body),
        _ => StatementKind::Other,
    }
}

impl Walker {
    fn visit_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            self.visit_with(with);
        }
        self.visit_set_expr(&query.body);
        for order_expr in &query.order_by {
            self.visit_expr(&order_expr.expr);
        }
    }

    fn visit_with(&mut self, with: &With) {
        for cte in &with.cte_tables {
            let Cte { alias, query, .. } = cte;
            self.cte_names.insert(alias.name.value.clone());
            self.visit_query(query);
        }
    }

    fn visit_set_expr(&mut self, set_expr: &SetExpr) {
        match set_expr {
            SetExpr::Select(select) => self.visit_select(select),
            SetExpr::Query(inner) => self.visit_query(inner),
            SetExpr::SetOperation { left, right, .. } => {
                self.visit_set_expr(left);
                self.visit_set_expr(right);
            }
            _ => {}
        }
    }

    fn visit_select(&mut self, select: &Select) {
        for twj in &select.from {
            self.visit_table_with_joins(twj);
        }

        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => self.visit_expr(expr),
                SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(..) => self.has_select_star = true,
            }
        }

        if let Some(selection) = &select.selection {
            self.visit_expr(selection);
        }
        if let GroupByExpr::Expressions(exprs, ..) = &select.group_by {
            for expr in exprs {
                self.visit_expr(expr);
            }
        }
        if let Some(having) = &select.having {
            self.visit_expr(having);
        }
    }

    fn visit_table_with_joins(&mut self, twj: &TableWithJoins) {
        self.visit_table_factor(&twj.relation);
        for join in &twj.joins {
            self.visit_join(join);
        }
    }

    fn visit_join(&mut self, join: &Join) {
        self.visit_table_factor(&join.relation);
        match &join.join_operator {
            JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint) => self.visit_join_constraint(constraint),
            _ => {}
        }
    }

    fn visit_join_constraint(&mut self, constraint: &JoinConstraint) {
        if let JoinConstraint::On(expr) = constraint {
            self.visit_expr(expr);
        }
    }

    fn visit_table_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table_ref = object_name_to_ref(name);
                if !self.cte_names.contains(&table_ref.1) {
                    self.tables.insert(table_ref.clone());
                }
                if let Some(alias) = alias {
                    self.aliases.insert(alias.name.value.clone(), table_ref.clone());
                }
                self.aliases.insert(table_ref.1.clone(), table_ref);
            }
            TableFactor::Derived { subquery, alias, .. } => {
                self.visit_query(subquery);
                if let Some(alias) = alias {
                    // Derived tables have no catalog identity; leave the
                    // alias unresolved so column refs through it surface
                    // literally rather than as a fabricated table.
                    let _ = alias;
                }
            }
            TableFactor::NestedJoin { table_with_joins, .. } => self.visit_table_with_joins(table_with_joins),
            _ => {}
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Identifier(ident) => {
                self.columns.insert((None, ident.value.clone()));
            }
            Expr::CompoundIdentifier(idents) => {
                if let [qualifier, column] = idents.as_slice() {
                    let resolved = self
                        .aliases
                        .get(&qualifier.value)
                        .map(|(_, table)| table.clone())
                        .unwrap_or_else(|| qualifier.value.clone());
                    self.columns.insert((Some(resolved), column.value.clone()));
                } else if let Some(last) = idents.last() {
                    self.columns.insert((None, last.value.clone()));
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            Expr::UnaryOp { expr, .. } | Expr::IsNull(expr) | Expr::IsNotNull(expr) | Expr::Nested(expr) => {
                self.visit_expr(expr);
            }
            Expr::Between { expr, low, high, .. } => {
                self.visit_expr(expr);
                self.visit_expr(low);
                self.visit_expr(high);
            }
            Expr::InList { expr, list, .. } => {
                self.visit_expr(expr);
                for item in list {
                    self.visit_expr(item);
                }
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.visit_expr(expr);
                self.visit_query(subquery);
            }
            Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => self.visit_query(query),
            Expr::Cast { expr, .. } | Expr::TryCast { expr, .. } => self.visit_expr(expr),
            Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                if let Some(operand) = operand {
                    self.visit_expr(operand);
                }
                for cond in conditions {
                    self.visit_expr(cond);
                }
                for result in results {
                    self.visit_expr(result);
                }
                if let Some(else_result) = else_result {
                    self.visit_expr(else_result);
                }
            }
            Expr::Function(function) => {
                if let sqlparser::ast::FunctionArguments::List(list) = &function.args {
                    for arg in &list.args {
                        if let sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Expr(e))
                        | sqlparser::ast::FunctionArg::Named {
                            arg: sqlparser::ast::FunctionArgExpr::Expr(e),
                            ..
                        } = arg
                        {
                            self.visit_expr(e);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn object_name_to_ref(name: &ObjectName) -> TableRef {
    let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
    match parts.as_slice() {
        [schema, table] => (Some(schema.clone()), table.clone()),
        [table] => (None, table.clone()),
        _ => (parts.first().cloned(), parts.last().cloned().unwrap_or_default()),
    }
}
