//! Schema snapshot data model and deterministic prompt rendering (§3, §4.2).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Index access method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// B-tree index.
    Btree,
    /// Hash index.
    Hash,
    /// Generalized Inverted Index.
    Gin,
    /// Generalized Search Tree.
    Gist,
    /// Block Range Index.
    Brin,
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Btree => "btree",
            Self::Hash => "hash",
            Self::Gin => "gin",
            Self::Gist => "gist",
            Self::Brin => "brin",
        };
        f.write_str(s)
    }
}

/// A column within a table or view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared (catalog) type name.
    pub data_type: String,
    /// Whether the column accepts NULL.
    pub is_nullable: bool,
    /// Whether the column is (part of) the primary key.
    pub is_primary_key: bool,
    /// Whether the column has a unique constraint or index.
    pub is_unique: bool,
    /// Default expression, if any.
    pub default_value: Option<String>,
    /// Catalog comment, if any.
    pub comment: Option<String>,
    /// Foreign-key target, stored as `(table, column)` identifiers rather
    /// than an in-place reference, so cyclic FK graphs never form an
    /// owning cycle (§9).
    pub foreign_key: Option<(String, String)>,
    /// Enumerated values, if this column's type is an enum.
    pub enum_values: Option<Vec<String>>,
}

/// An index on a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Ordered list of indexed columns.
    pub columns: Vec<String>,
    /// Access method.
    pub index_type: IndexType,
    /// Whether the index enforces uniqueness.
    pub is_unique: bool,
    /// Whether this index backs the primary key.
    pub is_primary: bool,
}

/// A table's full schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Schema the table lives in.
    pub schema_name: String,
    /// Columns, in ordinal order.
    pub columns: Vec<ColumnInfo>,
    /// Indexes on the table.
    pub indexes: Vec<IndexInfo>,
    /// Catalog comment, if any.
    pub comment: Option<String>,
    /// Estimated row count from `pg_class.reltuples`.
    pub estimated_row_count: i64,
}

impl TableInfo {
    /// `schema_name.name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.name)
    }
}

/// A view's projected columns and defining query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewInfo {
    /// View name.
    pub name: String,
    /// Schema the view lives in.
    pub schema_name: String,
    /// Projected columns.
    pub columns: Vec<ColumnInfo>,
    /// The view's defining SQL text.
    pub definition: String,
}

impl ViewInfo {
    /// `schema_name.name`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.name)
    }
}

/// A catalog enum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumTypeInfo {
    /// Type name.
    pub name: String,
    /// Schema the type lives in.
    pub schema_name: String,
    /// Ordered enum labels.
    pub values: Vec<String>,
}

/// An immutable, point-in-time snapshot of a database's schema (§3).
///
/// Used both as the context given to the language model and as the
/// ground truth the access policy and canonicalization pass check
/// against. Keyed by `BTreeMap` so iteration order (and therefore the
/// rendered prompt text) is stable across processes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseSchema {
    /// The database this snapshot describes.
    pub name: String,
    /// Tables keyed by `(schema_name, table_name)`.
    pub tables: BTreeMap<(String, String), TableInfo>,
    /// Views keyed by `(schema_name, view_name)`.
    pub views: BTreeMap<(String, String), ViewInfo>,
    /// Enum types keyed by `(schema_name, type_name)`.
    pub enum_types: BTreeMap<(String, String), EnumTypeInfo>,
    /// Unix-seconds timestamp this snapshot was produced at.
    pub cached_at: Option<i64>,
}

impl DatabaseSchema {
    /// Number of tables in the snapshot.
    #[must_use]
    pub fn tables_count(&self) -> usize {
        self.tables.len()
    }

    /// Number of views in the snapshot.
    #[must_use]
    pub fn views_count(&self) -> usize {
        self.views.len()
    }

    /// Look up a table, defaulting to the `public` schema.
    #[must_use]
    pub fn get_table(&self, name: &str, schema: Option<&str>) -> Option<&TableInfo> {
        self.tables.get(&(schema.unwrap_or("public").to_string(), name.to_string()))
    }

    /// Look up a view, defaulting to the `public` schema.
    #[must_use]
    pub fn get_view(&self, name: &str, schema: Option<&str>) -> Option<&ViewInfo> {
        self.views.get(&(schema.unwrap_or("public").to_string(), name.to_string()))
    }

    /// Render the snapshot as deterministic text suitable for a
    /// language-model prompt (§4.2). The same snapshot always produces
    /// identical text, since iteration follows the `BTreeMap` key order.
    #[must_use]
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Database: {}", self.name);

        if !self.tables.is_empty() {
            let _ = writeln!(out, "\n## Tables");
            for table in self.tables.values() {
                let _ = writeln!(out, "\n### {}", table.full_name());
                if let Some(comment) = &table.comment {
                    let _ = writeln!(out, "Description: {comment}");
                }
                let _ = writeln!(out, "Columns:");
                for column in &table.columns {
                    let _ = writeln!(out, "  - {}: {}{}", column.name, column.data_type, column_attrs(column));
                }
                if !table.indexes.is_empty() {
                    let _ = writeln!(out, "Indexes:");
                    for index in &table.indexes {
                        let _ = writeln!(out, "  - {} ({}on {})", index.name, index_attrs(index), index.columns.join(", "));
                    }
                }
            }
        }

        if !self.views.is_empty() {
            let _ = writeln!(out, "\n## Views");
            for view in self.views.values() {
                let _ = writeln!(out, "\n### {}", view.full_name());
                let _ = writeln!(out, "Columns:");
                for column in &view.columns {
                    let _ = writeln!(out, "  - {}: {}", column.name, column.data_type);
                }
            }
        }

        if !self.enum_types.is_empty() {
            let _ = writeln!(out, "\n## Custom Types");
            for enum_type in self.enum_types.values() {
                let quoted: Vec<String> = enum_type.values.iter().map(|v| format!("'{v}'")).collect();
                let _ = writeln!(
                    out,
                    "- {}.{}: ENUM ({})",
                    enum_type.schema_name,
                    enum_type.name,
                    quoted.join(", ")
                );
            }
        }

        out
    }
}

fn column_attrs(column: &ColumnInfo) -> String {
    let mut attrs = Vec::new();
    if column.is_primary_key {
        attrs.push("PRIMARY KEY".to_string());
    }
    if !column.is_nullable {
        attrs.push("NOT NULL".to_string());
    }
    if column.is_unique {
        attrs.push("UNIQUE".to_string());
    }
    if let Some((table, col)) = &column.foreign_key {
        attrs.push(format!("FK -> {table}.{col}"));
    }
    if let Some(values) = &column.enum_values {
        attrs.push(format!("ENUM: [{}]", values.join(", ")));
    }
    if let Some(comment) = &column.comment {
        attrs.push(format!("\"{comment}\""));
    }
    if attrs.is_empty() {
        String::new()
    } else {
        format!(" ({})", attrs.join(", "))
    }
}

fn index_attrs(index: &IndexInfo) -> String {
    let mut attrs = Vec::new();
    if index.is_primary {
        attrs.push("PRIMARY".to_string());
    }
    if index.is_unique {
        attrs.push("UNIQUE".to_string());
    }
    attrs.push(index.index_type.to_string());
    format!("{} ", attrs.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> DatabaseSchema {
        let mut schema = DatabaseSchema {
            name: "main".to_string(),
            ..Default::default()
        };
        schema.tables.insert(
            ("public".to_string(), "users".to_string()),
            TableInfo {
                name: "users".to_string(),
                schema_name: "public".to_string(),
                columns: vec![
                    ColumnInfo {
                        name: "id".to_string(),
                        data_type: "integer".to_string(),
                        is_nullable: false,
                        is_primary_key: true,
                        is_unique: true,
                        default_value: None,
                        comment: None,
                        foreign_key: None,
                        enum_values: None,
                    },
                    ColumnInfo {
                        name: "email".to_string(),
                        data_type: "text".to_string(),
                        is_nullable: false,
                        is_primary_key: false,
                        is_unique: true,
                        default_value: None,
                        comment: None,
                        foreign_key: None,
                        enum_values: None,
                    },
                ],
                indexes: vec![IndexInfo {
                    name: "users_pkey".to_string(),
                    columns: vec!["id".to_string()],
                    index_type: IndexType::Btree,
                    is_unique: true,
                    is_primary: true,
                }],
                comment: None,
                estimated_row_count: 42,
            },
        );
        schema
    }

    #[test]
    fn renders_deterministic_prompt_text() {
        let schema = sample_schema();
        let rendered_a = schema.to_prompt_text();
        let rendered_b = schema.to_prompt_text();
        assert_eq!(rendered_a, rendered_b);
        assert!(rendered_a.contains("### public.users"));
        assert!(rendered_a.contains("id: integer (PRIMARY KEY, NOT NULL, UNIQUE)"));
    }

    #[test]
    fn get_table_defaults_to_public_schema() {
        let schema = sample_schema();
        assert!(schema.get_table("users", None).is_some());
        assert!(schema.get_table("users", Some("other")).is_none());
    }
}
