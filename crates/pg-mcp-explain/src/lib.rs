//! Explain Validator (C5, §4.5): runs `EXPLAIN (FORMAT JSON, COSTS TRUE, VERBOSE TRUE)`
//! against a validated statement and checks the plan against cost, row,
//! and sequential-scan budgets.
//!
//! EXPLAIN never denies on its own failure (timeout, unsupported
//! statement, database error) — it logs a warning and passes. The
//! orchestrator still enforces the statement timeout at execution
//! (§4.5's deliberate design).

use std::collections::BTreeMap;
use std::time::Duration;

use moka::future::Cache;
use pg_mcp_core::ExplainPolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_postgres::Transaction;
use tracing::warn;

/// One node of the parsed EXPLAIN plan tree that matters to validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    /// `Node Type`, e.g. `"Seq Scan"`, `"Index Scan"`.
    pub node_type: String,
    /// `Relation Name`, present on scan nodes.
    pub relation_name: Option<String>,
    /// `Plan Rows` for this node.
    pub plan_rows: i64,
}

/// The parsed shape of an `EXPLAIN (FORMAT JSON, COSTS TRUE, VERBOSE TRUE)` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainResult {
    /// Root node's `Total Cost`.
    pub total_cost: f64,
    /// Root node's `Plan Rows`.
    pub estimated_rows: i64,
    /// Every node in the plan tree, root first, depth-first.
    pub nodes: Vec<PlanNode>,
    /// `(relation_name, plan_rows)` for every `Seq Scan` node found.
    pub seq_scans: Vec<(String, i64)>,
}

/// Outcome of validating one EXPLAIN result against an [`ExplainPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainValidationResult {
    /// Whether the query may proceed.
    pub passed: bool,
    /// The parsed plan, if EXPLAIN ran successfully.
    pub result: Option<ExplainResult>,
    /// Human-readable reason the query was denied, set only when `!passed`.
    pub denial_reason: Option<String>,
    /// Non-fatal warnings (cost budget exceeded, EXPLAIN itself failed).
    pub warnings: Vec<String>,
}

impl ExplainValidationResult {
    fn pass_with(result: Option<ExplainResult>, warnings: Vec<String>) -> Self {
        Self {
            passed: true,
            result,
            denial_reason: None,
            warnings,
        }
    }

    fn deny(result: ExplainResult, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            result: Some(result),
            denial_reason: Some(reason.into()),
            warnings: Vec::new(),
        }
    }
}

/// A fixed-size TTL cache of EXPLAIN results, keyed by a short hash of
/// the canonical SQL (§4.5). Cheap to clone: the underlying `moka` cache
/// is itself a handle to shared storage.
#[derive(Clone)]
pub struct ExplainCache {
    cache: Cache<String, ExplainResult>,
}

impl ExplainCache {
    /// Build a cache from an [`ExplainPolicy`]'s `cache_max_size`/`cache_ttl_seconds`.
    #[must_use]
    pub fn new(policy: &ExplainPolicy) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(policy.cache_max_size)
                .time_to_live(Duration::from_secs(policy.cache_ttl_seconds))
                .build(),
        }
    }

    fn key_for(sql: &str) -> String {
        let digest = Sha256::digest(sql.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Run EXPLAIN on `sql` within `tx` and validate the plan against
/// `policy`, consulting/populating `cache` first. `table_row_counts`
/// supplies the cached catalog `reltuples` estimate per `schema.table`,
/// which is preferred over EXPLAIN's own row estimate for the
/// large-table sequential-scan check (§4.5).
///
/// This function never returns an error: any EXPLAIN failure is
/// recorded as a warning and the query is allowed to proceed, since the
/// orchestrator still bounds execution with a statement timeout.
pub async fn validate(
    tx: &Transaction<'_>,
    sql: &str,
    policy: &ExplainPolicy,
    table_row_counts: &BTreeMap<String, i64>,
    cache: &ExplainCache,
) -> ExplainValidationResult {
    if !policy.enabled {
        return ExplainValidationResult::pass_with(None, Vec::new());
    }

    let cache_key = ExplainCache::key_for(sql);
    if let Some(cached) = cache.cache.get(&cache_key).await {
        return apply_policy(cached, policy, table_row_counts);
    }

    let explain_sql = format!("EXPLAIN (FORMAT JSON, COSTS TRUE, VERBOSE TRUE) {sql}");
    let outcome = tokio::time::timeout(
        Duration::from_secs_f64(policy.timeout_seconds),
        tx.query_one(&explain_sql, &[]),
    )
    .await;

    let row = match outcome {
        Ok(Ok(row)) => row,
        Ok(Err(e)) => {
            warn!(error = %e, "EXPLAIN failed; passing without cost validation");
            return ExplainValidationResult::pass_with(None, vec![format!("EXPLAIN failed: {e}")]);
        }
        Err(_) => {
            warn!(timeout_secs = policy.timeout_seconds, "EXPLAIN timed out; passing without cost validation");
            return ExplainValidationResult::pass_with(None, vec!["EXPLAIN timed out".to_string()]);
        }
    };

    let raw: serde_json::Value = row.get(0);
    let parsed = match parse_explain_json(&raw) {
        Some(parsed) => parsed,
        None => {
            warn!("EXPLAIN returned an unexpected shape; passing without cost validation");
            return ExplainValidationResult::pass_with(None, vec!["EXPLAIN returned an unexpected shape".to_string()]);
        }
    };

    cache.cache.insert(cache_key, parsed.clone()).await;
    apply_policy(parsed, policy, table_row_counts)
}

fn apply_policy(result: ExplainResult, policy: &ExplainPolicy, table_row_counts: &BTreeMap<String, i64>) -> ExplainValidationResult {
    if result.estimated_rows > policy.max_estimated_rows {
        return ExplainValidationResult::deny(
            result.clone(),
            format!(
                "estimated rows ({}) exceeds limit ({})",
                result.estimated_rows, policy.max_estimated_rows
            ),
        );
    }

    let mut warnings = Vec::new();
    if result.total_cost > policy.max_estimated_cost {
        warnings.push(format!(
            "query cost ({:.2}) exceeds recommended limit ({:.2})",
            result.total_cost, policy.max_estimated_cost
        ));
    }

    if policy.deny_seq_scan_on_large_tables {
        for (table, plan_rows) in &result.seq_scans {
            let cached_rows = table_row_counts.get(table).copied().unwrap_or(0);
            let true_size = (*plan_rows).max(cached_rows);
            if true_size > policy.large_table_threshold {
                return ExplainValidationResult::deny(
                    result.clone(),
                    format!("sequential scan on large table '{table}' (~{true_size} rows) denied"),
                );
            }
        }
    }

    ExplainValidationResult::pass_with(Some(result), warnings)
}

/// Parse the `EXPLAIN (FORMAT JSON, ...)` array-of-one-object shape into
/// an [`ExplainResult`], collecting every node depth-first.
fn parse_explain_json(raw: &serde_json::Value) -> Option<ExplainResult> {
    let root_entry = raw.as_array()?.first()?;
    let plan = root_entry.get("Plan")?;

    let total_cost = plan.get("Total Cost").and_then(serde_json::Value::as_f64).unwrap_or(0.0);
    let estimated_rows = plan.get("Plan Rows").and_then(serde_json::Value::as_i64).unwrap_or(0);

    let mut nodes = Vec::new();
    let mut seq_scans = Vec::new();
    collect_nodes(plan, &mut nodes, &mut seq_scans);

    Some(ExplainResult {
        total_cost,
        estimated_rows,
        nodes,
        seq_scans,
    })
}

fn collect_nodes(node: &serde_json::Value, nodes: &mut Vec<PlanNode>, seq_scans: &mut Vec<(String, i64)>) {
    let node_type = node.get("Node Type").and_then(serde_json::Value::as_str).unwrap_or("").to_string();
    let relation_name = node.get("Relation Name").and_then(serde_json::Value::as_str).map(str::to_string);
    let plan_rows = node.get("Plan Rows").and_then(serde_json::Value::as_i64).unwrap_or(0);

    if node_type == "Seq Scan" {
        // `Schema` is only present with `VERBOSE TRUE`; qualify to match
        // `TableInfo::full_name()`'s `schema.table` keying in `table_row_counts`.
        let schema = node.get("Schema").and_then(serde_json::Value::as_str).unwrap_or("public");
        let table = relation_name.clone().map_or_else(|| "unknown".to_string(), |name| format!("{schema}.{name}"));
        seq_scans.push((table, plan_rows));
    }

    nodes.push(PlanNode {
        node_type,
        relation_name,
        plan_rows,
    });

    if let Some(children) = node.get("Plans").and_then(serde_json::Value::as_array) {
        for child in children {
            collect_nodes(child, nodes, seq_scans);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan(total_cost: f64, plan_rows: i64, seq_scan_table: Option<(&str, i64)>) -> serde_json::Value {
        let mut plan = json!({
            "Node Type": "Aggregate",
            "Total Cost": total_cost,
            "Plan Rows": plan_rows,
            "Plans": [],
        });
        if let Some((table, rows)) = seq_scan_table {
            plan["Plans"] = json!([{
                "Node Type": "Seq Scan",
                "Schema": "public",
                "Relation Name": table,
                "Plan Rows": rows,
            }]);
        }
        json!([{"Plan": plan}])
    }

    #[test]
    fn parses_total_cost_and_rows() {
        let raw = sample_plan(123.4, 50, None);
        let parsed = parse_explain_json(&raw).expect("parses");
        assert!((parsed.total_cost - 123.4).abs() < f64::EPSILON);
        assert_eq!(parsed.estimated_rows, 50);
        assert!(parsed.seq_scans.is_empty());
    }

    #[test]
    fn collects_seq_scan_nodes_recursively() {
        let raw = sample_plan(10.0, 5, Some(("events", 5_000_000)));
        let parsed = parse_explain_json(&raw).expect("parses");
        assert_eq!(parsed.seq_scans, vec![("public.events".to_string(), 5_000_000)]);
    }

    #[test]
    fn row_budget_denies_when_exceeded() {
        let parsed = ExplainResult {
            total_cost: 1.0,
            estimated_rows: 5_000_000,
            nodes: Vec::new(),
            seq_scans: Vec::new(),
        };
        let policy = ExplainPolicy {
            max_estimated_rows: 1_000,
            ..ExplainPolicy::default()
        };
        let result = apply_policy(parsed, &policy, &BTreeMap::new());
        assert!(!result.passed);
        assert!(result.denial_reason.unwrap().contains("estimated rows"));
    }

    #[test]
    fn cost_budget_only_warns() {
        let parsed = ExplainResult {
            total_cost: 999_999.0,
            estimated_rows: 1,
            nodes: Vec::new(),
            seq_scans: Vec::new(),
        };
        let policy = ExplainPolicy {
            max_estimated_cost: 100.0,
            ..ExplainPolicy::default()
        };
        let result = apply_policy(parsed, &policy, &BTreeMap::new());
        assert!(result.passed);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn seq_scan_on_large_table_denies_using_cached_row_count_over_plan_estimate() {
        let parsed = ExplainResult {
            total_cost: 1.0,
            estimated_rows: 1,
            nodes: Vec::new(),
            seq_scans: vec![("public.events".to_string(), 10)],
        };
        let policy = ExplainPolicy {
            large_table_threshold: 1_000,
            deny_seq_scan_on_large_tables: true,
            ..ExplainPolicy::default()
        };
        let mut row_counts = BTreeMap::new();
        row_counts.insert("public.events".to_string(), 2_000_000);
        let result = apply_policy(parsed, &policy, &row_counts);
        assert!(!result.passed);
        assert!(result.denial_reason.unwrap().contains("events"));
    }

    #[test]
    fn seq_scan_on_small_table_passes() {
        let parsed = ExplainResult {
            total_cost: 1.0,
            estimated_rows: 1,
            nodes: Vec::new(),
            seq_scans: vec![("public.small_table".to_string(), 10)],
        };
        let policy = ExplainPolicy {
            large_table_threshold: 1_000,
            deny_seq_scan_on_large_tables: true,
            ..ExplainPolicy::default()
        };
        let result = apply_policy(parsed, &policy, &BTreeMap::new());
        assert!(result.passed);
    }

    #[test]
    fn mismatched_schema_key_falls_back_to_plan_estimate() {
        let parsed = ExplainResult {
            total_cost: 1.0,
            estimated_rows: 1,
            nodes: Vec::new(),
            seq_scans: vec![("public.events".to_string(), 10)],
        };
        let policy = ExplainPolicy {
            large_table_threshold: 1_000,
            deny_seq_scan_on_large_tables: true,
            ..ExplainPolicy::default()
        };
        let mut row_counts = BTreeMap::new();
        row_counts.insert("events".to_string(), 2_000_000);
        let result = apply_policy(parsed, &policy, &row_counts);
        assert!(result.passed, "bare-name cache entries must not match the schema-qualified key");
    }

    #[test]
    fn cache_key_is_stable_for_identical_sql() {
        let a = ExplainCache::key_for("SELECT 1");
        let b = ExplainCache::key_for("SELECT 1");
        assert_eq!(a, b);
        let c = ExplainCache::key_for("SELECT 2");
        assert_ne!(a, c);
    }
}
