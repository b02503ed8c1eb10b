//! Configuration model and loader (§6: External Interfaces).
//!
//! Configuration is read from a YAML file (with `${VAR}` / `${VAR:-default}`
//! expansion) and then overlaid with environment variables prefixed
//! `PG_MCP_`, using `__` as the nesting delimiter. The loader itself is the
//! only place in the workspace that touches the filesystem or environment.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::LazyLock;

use pg_mcp_error::{PgMcpError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::policy::AccessPolicy;

/// PostgreSQL SSL negotiation mode for a configured database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Never negotiate TLS.
    Disable,
    /// Negotiate TLS if the server offers it, plaintext otherwise.
    Allow,
    /// Prefer TLS but skip certificate verification.
    #[default]
    Prefer,
    /// Require TLS with full certificate verification.
    Require,
}

/// A single configured database (Connection Descriptor, §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Short opaque identifier, `[a-z0-9_-]+`.
    pub name: String,
    /// Host to connect to. Ignored if `url` is set.
    #[serde(default)]
    pub host: Option<String>,
    /// Port to connect to. Ignored if `url` is set.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name. Ignored if `url` is set.
    #[serde(default)]
    pub dbname: Option<String>,
    /// Connecting user. Ignored if `url` is set.
    #[serde(default)]
    pub user: Option<String>,
    /// Connecting password. Held as a secret; never logged or echoed.
    #[serde(default)]
    pub password: Option<Secret>,
    /// Full connection string, used instead of the discrete fields above.
    #[serde(default)]
    pub url: Option<Secret>,
    /// TLS negotiation mode.
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Minimum pool size, `1..=20`.
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,
    /// Maximum pool size, `1..=100`.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    /// Access policy governing this database.
    #[serde(default)]
    pub access_policy: AccessPolicy,
}

impl DatabaseConfig {
    /// Build a `postgresql://` connection string from the descriptor's
    /// discrete fields, or return the explicit `url` if one was given.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if neither `url` nor the full set of
    /// `host`/`dbname`/`user` is present.
    pub fn dsn(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.expose().to_string());
        }
        let host = self
            .host
            .as_deref()
            .ok_or_else(|| PgMcpError::configuration(format!("database '{}': missing host", self.name)))?;
        let dbname = self
            .dbname
            .as_deref()
            .ok_or_else(|| PgMcpError::configuration(format!("database '{}': missing dbname", self.name)))?;
        let user = self
            .user
            .as_deref()
            .ok_or_else(|| PgMcpError::configuration(format!("database '{}': missing user", self.name)))?;
        let password = self.password.as_ref().map(Secret::expose).unwrap_or_default();
        Ok(format!(
            "postgresql://{user}:{password}@{host}:{}/{dbname}",
            self.port
        ))
    }

    /// Validate the static invariants of this descriptor.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` on an invalid name, out-of-range pool
    /// sizes, or a missing connection target.
    pub fn validate(&self) -> Result<()> {
        static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new("^[a-z0-9_-]+$").expect("valid regex"));
        if !NAME_RE.is_match(&self.name) {
            return Err(PgMcpError::configuration(format!(
                "database name '{}' must match [a-z0-9_-]+",
                self.name
            )));
        }
        if !(1..=20).contains(&self.min_pool_size) {
            return Err(PgMcpError::configuration(format!(
                "database '{}': min_pool_size must be 1..=20",
                self.name
            )));
        }
        if !(1..=100).contains(&self.max_pool_size) {
            return Err(PgMcpError::configuration(format!(
                "database '{}': max_pool_size must be 1..=100",
                self.name
            )));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(PgMcpError::configuration(format!(
                "database '{}': min_pool_size exceeds max_pool_size",
                self.name
            )));
        }
        if self.url.is_none() && (self.host.is_none() || self.dbname.is_none() || self.user.is_none()) {
            return Err(PgMcpError::configuration(format!(
                "database '{}': provide either url or host/dbname/user",
                self.name
            )));
        }
        self.access_policy.validate().map_err(|e| {
            PgMcpError::configuration(format!("database '{}': {e}", self.name))
        })?;
        Ok(())
    }
}

/// A value that masks itself in `Debug` output. Used for passwords,
/// connection strings, and API keys.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Access the underlying value. Callers must not log or echo it.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***")
    }
}

/// Language-model client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API key for the provider.
    pub api_key: Secret,
    /// Model name to request.
    #[serde(default = "default_model")]
    pub model: String,
    /// Override base URL (e.g. for an OpenAI-compatible proxy).
    #[serde(default)]
    pub base_url: Option<String>,
    /// Maximum retry attempts, `1..=10`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request timeout in seconds, `5.0..=120.0`.
    #[serde(default = "default_openai_timeout")]
    pub timeout: f64,
}

impl OpenAiConfig {
    /// Validate the configured ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `max_retries` or `timeout` are out
    /// of their allowed ranges.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.max_retries) {
            return Err(PgMcpError::configuration("openai.max_retries must be 1..=10"));
        }
        if !(5.0..=120.0).contains(&self.timeout) {
            return Err(PgMcpError::configuration("openai.timeout must be 5.0..=120.0"));
        }
        Ok(())
    }
}

/// Rate-limit admission configuration (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether admission control is enforced at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests permitted per 60-second sliding window, `1..=1000`.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Requests permitted per 3600-second sliding window, `1..=10000`.
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    /// Token-bucket capacity for language-model tokens, `>= 1000`.
    #[serde(default = "default_tokens_per_minute")]
    pub openai_tokens_per_minute: u32,
    /// Seconds of inactivity after which a client's bucket is evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl RateLimitConfig {
    /// Validate the configured ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if any bound is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=1000).contains(&self.requests_per_minute) {
            return Err(PgMcpError::configuration(
                "rate_limit.requests_per_minute must be 1..=1000",
            ));
        }
        if !(1..=10_000).contains(&self.requests_per_hour) {
            return Err(PgMcpError::configuration(
                "rate_limit.requests_per_hour must be 1..=10000",
            ));
        }
        if self.openai_tokens_per_minute < 1000 {
            return Err(PgMcpError::configuration(
                "rate_limit.openai_tokens_per_minute must be >= 1000",
            ));
        }
        Ok(())
    }
}

/// Global server behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Schema-cache staleness window, seconds, `>= 60`.
    #[serde(default = "default_cache_refresh_interval")]
    pub cache_refresh_interval: u64,
    /// Row cap for results and default LIMIT, `1..=10000`.
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
    /// Statement timeout, seconds, `1.0..=300.0`.
    #[serde(default = "default_query_timeout")]
    pub query_timeout: f64,
    /// Advisory LM-based result check (§9 Open Question b); never
    /// authoritative.
    #[serde(default)]
    pub enable_result_validation: bool,
    /// Bounded LM retries on SQL syntax error, `0..=5`.
    #[serde(default = "default_max_sql_retry")]
    pub max_sql_retry: u32,
    /// Whether executed transactions are opened `READ ONLY`.
    #[serde(default = "default_true")]
    pub use_readonly_transactions: bool,
    /// Rate-limit admission configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    /// Validate the configured ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if any bound is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.cache_refresh_interval < 60 {
            return Err(PgMcpError::configuration("server.cache_refresh_interval must be >= 60"));
        }
        if !(1..=10_000).contains(&self.max_result_rows) {
            return Err(PgMcpError::configuration("server.max_result_rows must be 1..=10000"));
        }
        if !(1.0..=300.0).contains(&self.query_timeout) {
            return Err(PgMcpError::configuration("server.query_timeout must be 1.0..=300.0"));
        }
        if self.max_sql_retry > 5 {
            return Err(PgMcpError::configuration("server.max_sql_retry must be 0..=5"));
        }
        self.rate_limit.validate()
    }
}

/// The top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configured databases. At least one is required.
    pub databases: Vec<DatabaseConfig>,
    /// Language-model client configuration.
    pub openai: OpenAiConfig,
    /// Server behavior configuration.
    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Look up a configured database by name.
    #[must_use]
    pub fn get_database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.name == name)
    }

    /// The sole configured database, if exactly one is configured.
    #[must_use]
    pub fn get_default_database(&self) -> Option<&DatabaseConfig> {
        match self.databases.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Names of every configured database.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        self.databases.iter().map(|d| d.name.clone()).collect()
    }

    /// Validate the whole configuration: per-database invariants, no
    /// duplicate names, and range checks on `openai`/`server`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(PgMcpError::configuration("at least one database must be configured"));
        }
        let mut seen = std::collections::HashSet::new();
        for db in &self.databases {
            db.validate()?;
            if !seen.insert(db.name.clone()) {
                return Err(PgMcpError::configuration(format!("duplicate database name '{}'", db.name)));
            }
        }
        self.openai.validate()?;
        self.server.validate()?;
        Ok(())
    }
}

fn default_port() -> u16 {
    5432
}
fn default_min_pool_size() -> u32 {
    2
}
fn default_max_pool_size() -> u32 {
    10
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_openai_timeout() -> f64 {
    30.0
}
fn default_true() -> bool {
    true
}
fn default_requests_per_minute() -> u32 {
    60
}
fn default_requests_per_hour() -> u32 {
    1000
}
fn default_tokens_per_minute() -> u32 {
    100_000
}
fn default_idle_timeout() -> u64 {
    900
}
fn default_cache_refresh_interval() -> u64 {
    3600
}
fn default_max_result_rows() -> usize {
    1000
}
fn default_query_timeout() -> f64 {
    30.0
}
fn default_max_sql_retry() -> u32 {
    2
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            openai_tokens_per_minute: default_tokens_per_minute(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_refresh_interval: default_cache_refresh_interval(),
            max_result_rows: default_max_result_rows(),
            query_timeout: default_query_timeout(),
            enable_result_validation: false,
            max_sql_retry: default_max_sql_retry(),
            use_readonly_transactions: true,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Environment-variable prefix recognized by the loader.
pub const ENV_PREFIX: &str = "PG_MCP_";
/// Nesting delimiter used when flattening configuration paths into
/// environment variable names.
pub const ENV_NESTING_DELIMITER: &str = "__";

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("valid regex"));

/// Expand `${VAR}` and `${VAR:-default}` references in `value` against the
/// process environment.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .into_owned()
}

fn process_value(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(expand_env_vars(&s)),
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(process_value).collect()),
        JsonValue::Object(map) => {
            JsonValue::Object(map.into_iter().map(|(k, v)| (k, process_value(v))).collect())
        }
        other => other,
    }
}

/// Recursively merge `overlay` on top of `base`, in place. Scalars and
/// arrays in `overlay` replace `base`; objects are merged key-wise.
fn merge_json(base: &mut JsonValue, overlay: JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

/// Build a nested JSON value from every `PG_MCP_`-prefixed environment
/// variable, splitting the remainder on `__`. Path segments consisting
/// entirely of ASCII digits are treated as array indices.
#[must_use]
pub fn env_overlay() -> JsonValue {
    build_env_overlay(env::vars())
}

fn build_env_overlay(vars: impl Iterator<Item = (String, String)>) -> JsonValue {
    let mut root = JsonValue::Object(serde_json::Map::new());
    for (key, value) in vars {
        let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<&str> = rest.split(ENV_NESTING_DELIMITER).filter(|s| !s.is_empty()).collect();
        if path.is_empty() {
            continue;
        }
        set_path(&mut root, &path, JsonValue::String(value));
    }
    root
}

fn set_path(node: &mut JsonValue, path: &[&str], value: JsonValue) {
    let segment = path[0].to_lowercase();
    let is_last = path.len() == 1;
    if let Ok(index) = segment.parse::<usize>() {
        if !node.is_array() {
            *node = JsonValue::Array(Vec::new());
        }
        let arr = node.as_array_mut().expect("just coerced to array");
        while arr.len() <= index {
            arr.push(JsonValue::Null);
        }
        if is_last {
            arr[index] = value;
        } else {
            if arr[index].is_null() {
                arr[index] = JsonValue::Object(serde_json::Map::new());
            }
            set_path(&mut arr[index], &path[1..], value);
        }
    } else {
        if !node.is_object() {
            *node = JsonValue::Object(serde_json::Map::new());
        }
        let map = node.as_object_mut().expect("just coerced to object");
        if is_last {
            map.insert(segment, value);
        } else {
            let entry = map.entry(segment).or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            set_path(entry, &path[1..], value);
        }
    }
}

/// Load configuration: from an explicit file path, or from `PG_MCP_CONFIG`,
/// or purely from `PG_MCP_*` environment variables if neither is set.
/// `PG_MCP_*` environment variables always overlay (and override) values
/// loaded from a file.
///
/// # Errors
///
/// Returns `ConfigurationError` if the file cannot be read/parsed, if the
/// merged document cannot be deserialized into [`AppConfig`], or if the
/// resulting configuration fails [`AppConfig::validate`].
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let explicit_path = path.map(std::path::PathBuf::from).or_else(|| env::var("PG_MCP_CONFIG").ok().map(std::path::PathBuf::from));

    let mut document = match explicit_path {
        Some(p) => {
            let content = std::fs::read_to_string(&p)
                .map_err(|e| PgMcpError::configuration(format!("failed to read {}: {e}", p.display())))?;
            let yaml_value: serde_yaml::Value = serde_yaml::from_str(&content)
                .map_err(|e| PgMcpError::configuration(format!("failed to parse {}: {e}", p.display())))?;
            let json_value: JsonValue = serde_json::to_value(yaml_value)
                .map_err(|e| PgMcpError::configuration(format!("failed to normalize {}: {e}", p.display())))?;
            process_value(json_value)
        }
        None => JsonValue::Object(serde_json::Map::new()),
    };

    merge_json(&mut document, env_overlay());

    let config: AppConfig = serde_json::from_value(document)
        .map_err(|e| PgMcpError::configuration(format!("invalid configuration: {e}")))?;
    config.validate()?;
    Ok(config)
}

/// Build configuration purely from an explicit map, bypassing the
/// filesystem and process environment entirely. Used by tests.
///
/// # Errors
///
/// Returns `ConfigurationError` on deserialization or validation failure.
pub fn config_from_map(map: HashMap<String, JsonValue>) -> Result<AppConfig> {
    let value = JsonValue::Object(map.into_iter().collect());
    let config: AppConfig =
        serde_json::from_value(value).map_err(|e| PgMcpError::configuration(format!("invalid configuration: {e}")))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_simple_var() {
        temp_env::with_var("PG_MCP_TEST_HOST", Some("db.internal"), || {
            assert_eq!(expand_env_vars("${PG_MCP_TEST_HOST}"), "db.internal");
        });
    }

    #[test]
    fn expands_default_when_missing() {
        temp_env::with_var_unset("PG_MCP_TEST_MISSING", || {
            assert_eq!(expand_env_vars("${PG_MCP_TEST_MISSING:-fallback}"), "fallback");
        });
    }

    #[test]
    fn builds_nested_overlay_with_array_index() {
        let vars = vec![
            ("PG_MCP_DATABASES__0__NAME".to_string(), "main".to_string()),
            ("PG_MCP_DATABASES__0__HOST".to_string(), "localhost".to_string()),
            ("PG_MCP_OPENAI__API_KEY".to_string(), "sk-test".to_string()),
        ];
        let overlay = build_env_overlay(vars.into_iter());
        assert_eq!(overlay["databases"][0]["name"], "main");
        assert_eq!(overlay["databases"][0]["host"], "localhost");
        assert_eq!(overlay["openai"]["api_key"], "sk-test");
    }

    #[test]
    fn merge_overrides_file_values_with_env() {
        let mut base = serde_json::json!({"server": {"max_result_rows": 1000}});
        let overlay = serde_json::json!({"server": {"max_result_rows": 500}});
        merge_json(&mut base, overlay);
        assert_eq!(base["server"]["max_result_rows"], 500);
    }

    #[test]
    fn database_name_must_be_lowercase_alnum() {
        let mut db = sample_database();
        db.name = "Not-Valid!".to_string();
        assert!(db.validate().is_err());
    }

    #[test]
    fn database_requires_url_or_discrete_fields() {
        let mut db = sample_database();
        db.host = None;
        db.url = None;
        assert!(db.validate().is_err());
    }

    fn sample_database() -> DatabaseConfig {
        DatabaseConfig {
            name: "main".to_string(),
            host: Some("localhost".to_string()),
            port: 5432,
            dbname: Some("app".to_string()),
            user: Some("app".to_string()),
            password: Some(Secret::from("pw".to_string())),
            url: None,
            ssl_mode: SslMode::Prefer,
            min_pool_size: 2,
            max_pool_size: 10,
            access_policy: AccessPolicy::default(),
        }
    }
}
