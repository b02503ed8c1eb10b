//! Catalog introspection queries (§4.2): four result sets folded into a
//! `DatabaseSchema` snapshot.
//!
//! Grounded on `db/postgres/introspector.rs`'s `information_schema`/
//! `pg_catalog` query shapes, extended to cover primary/foreign keys,
//! indexes, enum types, and row-count estimates as §4.2 requires.

use std::collections::BTreeMap;

use pg_mcp_core::{ColumnInfo, DatabaseSchema, EnumTypeInfo, IndexInfo, IndexType, TableInfo, ViewInfo};
use pg_mcp_error::{PgMcpError, Result};
use tokio_postgres::Client;

const TABLES_QUERY: &str = "
    SELECT table_schema, table_name, table_type
    FROM information_schema.tables
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
      AND table_schema NOT LIKE 'pg_toast%'
    ORDER BY table_schema, table_name";

const COLUMNS_QUERY: &str = "
    SELECT table_schema, table_name, column_name, data_type,
           (is_nullable = 'YES') AS is_nullable, column_default, ordinal_position
    FROM information_schema.columns
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
      AND table_schema NOT LIKE 'pg_toast%'
    ORDER BY table_schema, table_name, ordinal_position";

const PRIMARY_KEY_QUERY: &str = "
    SELECT tc.table_schema, tc.table_name, kcu.column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'";

const FOREIGN_KEY_QUERY: &str = "
    SELECT tc.table_schema, tc.table_name, kcu.column_name,
           ccu.table_name AS foreign_table_name, ccu.column_name AS foreign_column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON tc.constraint_name = ccu.constraint_name
    WHERE tc.constraint_type = 'FOREIGN KEY'";

const UNIQUE_COLUMN_QUERY: &str = "
    SELECT tc.table_schema, tc.table_name, kcu.column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'UNIQUE'";

const INDEXES_QUERY: &str = "
    SELECT n.nspname AS schema_name, t.relname AS table_name, ic.relname AS index_name,
           i.indisunique, i.indisprimary, am.amname AS index_type,
           array_agg(a.attname ORDER BY array_position(i.indkey, a.attnum)) AS columns
    FROM pg_index i
    JOIN pg_class ic ON ic.oid = i.indexrelid
    JOIN pg_class t ON t.oid = i.indrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_am am ON am.oid = ic.relam
    JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(i.indkey)
    WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
    GROUP BY n.nspname, t.relname, ic.relname, i.indisunique, i.indisprimary, am.amname";

const ENUM_QUERY: &str = "
    SELECT n.nspname AS schema_name, t.typname AS type_name, e.enumlabel
    FROM pg_type t
    JOIN pg_enum e ON e.enumtypid = t.oid
    JOIN pg_namespace n ON n.oid = t.typnamespace
    ORDER BY n.nspname, t.typname, e.enumsortorder";

const ROW_COUNT_QUERY: &str = "
    SELECT n.nspname AS schema_name, c.relname AS table_name, c.reltuples
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE c.relkind IN ('r', 'p')";

const VIEW_DEFINITION_QUERY: &str = "
    SELECT schemaname, viewname, definition
    FROM pg_views
    WHERE schemaname NOT IN ('pg_catalog', 'information_schema')";

/// Run the catalog introspection queries against `client` and fold the
/// four result sets into a `DatabaseSchema` (§4.2). `cached_at` is left
/// unset; the caller stamps it.
///
/// # Errors
///
/// Returns `ConnectionError` if any catalog query fails.
pub async fn introspect(client: &Client, database_name: &str) -> Result<DatabaseSchema> {
    let map_err = |step: &'static str| {
        move |e: tokio_postgres::Error| PgMcpError::ConnectionError {
            database: database_name.to_string(),
            message: format!("introspection step '{step}' failed: {e}"),
            retryable: true,
        }
    };

    let table_rows = client.query(TABLES_QUERY, &[]).await.map_err(map_err("tables"))?;
    let column_rows = client.query(COLUMNS_QUERY, &[]).await.map_err(map_err("columns"))?;
    let pk_rows = client.query(PRIMARY_KEY_QUERY, &[]).await.map_err(map_err("primary_keys"))?;
    let fk_rows = client.query(FOREIGN_KEY_QUERY, &[]).await.map_err(map_err("foreign_keys"))?;
    let unique_rows = client.query(UNIQUE_COLUMN_QUERY, &[]).await.map_err(map_err("unique_columns"))?;
    let index_rows = client.query(INDEXES_QUERY, &[]).await.map_err(map_err("indexes"))?;
    let enum_rows = client.query(ENUM_QUERY, &[]).await.map_err(map_err("enums"))?;
    let row_count_rows = client.query(ROW_COUNT_QUERY, &[]).await.map_err(map_err("row_counts"))?;
    let view_def_rows = client.query(VIEW_DEFINITION_QUERY, &[]).await.map_err(map_err("view_definitions"))?;

    let mut primary_keys: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for row in &pk_rows {
        let key = (row.get::<_, String>(0), row.get::<_, String>(1));
        primary_keys.entry(key).or_default().push(row.get(2));
    }

    let mut foreign_keys: BTreeMap<(String, String, String), (String, String)> = BTreeMap::new();
    for row in &fk_rows {
        let key = (row.get::<_, String>(0), row.get::<_, String>(1), row.get::<_, String>(2));
        foreign_keys.insert(key, (row.get(3), row.get(4)));
    }

    let mut unique_columns: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for row in &unique_rows {
        let key = (row.get::<_, String>(0), row.get::<_, String>(1));
        unique_columns.entry(key).or_default().push(row.get(2));
    }

    let mut row_counts: BTreeMap<(String, String), i64> = BTreeMap::new();
    for row in &row_count_rows {
        let reltuples: f32 = row.get(2);
        row_counts.insert((row.get(0), row.get(1)), reltuples.max(0.0) as i64);
    }

    let mut enum_types: BTreeMap<(String, String), EnumTypeInfo> = BTreeMap::new();
    for row in &enum_rows {
        let key: (String, String) = (row.get(0), row.get(1));
        let entry = enum_types.entry(key.clone()).or_insert_with(|| EnumTypeInfo {
            name: key.1.clone(),
            schema_name: key.0.clone(),
            values: Vec::new(),
        });
        entry.values.push(row.get(2));
    }

    let mut view_definitions: BTreeMap<(String, String), String> = BTreeMap::new();
    for row in &view_def_rows {
        view_definitions.insert((row.get(0), row.get(1)), row.get(2));
    }

    let mut columns_by_table: BTreeMap<(String, String), Vec<ColumnInfo>> = BTreeMap::new();
    for row in &column_rows {
        let schema: String = row.get(0);
        let table: String = row.get(1);
        let name: String = row.get(2);
        let data_type: String = row.get(3);
        let is_nullable: bool = row.get(4);
        let default_value: Option<String> = row.get(5);

        let key = (schema.clone(), table.clone());
        let is_primary_key = primary_keys
            .get(&key)
            .is_some_and(|cols| cols.contains(&name));
        let is_unique = unique_columns
            .get(&key)
            .is_some_and(|cols| cols.contains(&name));
        let foreign_key = foreign_keys
            .get(&(schema.clone(), table.clone(), name.clone()))
            .cloned();
        let enum_values = enum_types.values().find(|e| e.name == data_type).map(|e| e.values.clone());

        columns_by_table.entry(key).or_default().push(ColumnInfo {
            name,
            data_type,
            is_nullable,
            is_primary_key,
            is_unique,
            default_value,
            comment: None,
            foreign_key,
            enum_values,
        });
    }

    let mut indexes_by_table: BTreeMap<(String, String), Vec<IndexInfo>> = BTreeMap::new();
    for row in &index_rows {
        let schema: String = row.get(0);
        let table: String = row.get(1);
        let index_name: String = row.get(2);
        let is_unique: bool = row.get(3);
        let is_primary: bool = row.get(4);
        let amname: String = row.get(5);
        let columns: Vec<String> = row.get(6);

        let index_type = match amname.as_str() {
            "hash" => IndexType::Hash,
            "gin" => IndexType::Gin,
            "gist" => IndexType::Gist,
            "brin" => IndexType::Brin,
            _ => IndexType::Btree,
        };

        indexes_by_table.entry((schema, table)).or_default().push(IndexInfo {
            name: index_name,
            columns,
            index_type,
            is_unique,
            is_primary,
        });
    }

    let mut schema = DatabaseSchema {
        name: database_name.to_string(),
        ..Default::default()
    };

    for row in &table_rows {
        let schema_name: String = row.get(0);
        let table_name: String = row.get(1);
        let table_type: String = row.get(2);
        let key = (schema_name.clone(), table_name.clone());

        if table_type == "VIEW" {
            schema.views.insert(
                key.clone(),
                ViewInfo {
                    name: table_name,
                    schema_name,
                    columns: columns_by_table.get(&key).cloned().unwrap_or_default(),
                    definition: view_definitions.get(&key).cloned().unwrap_or_default(),
                },
            );
        } else {
            schema.tables.insert(
                key.clone(),
                TableInfo {
                    name: table_name,
                    schema_name,
                    columns: columns_by_table.get(&key).cloned().unwrap_or_default(),
                    indexes: indexes_by_table.get(&key).cloned().unwrap_or_default(),
                    comment: None,
                    estimated_row_count: row_counts.get(&key).copied().unwrap_or(0),
                },
            );
        }
    }

    schema.enum_types = enum_types;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    // Introspection requires a live Postgres connection to exercise the
    // catalog joins end-to-end; that coverage lives in
    // `pg-mcp-schema`'s `#[ignore]`d integration test, matching the
    // teacher's pattern for driver-backed tests.
}
