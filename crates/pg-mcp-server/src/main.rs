//! `pg-mcp-server` binary: loads configuration, wires every component,
//! and serves the HTTP transport stub (§6).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pg_mcp_core::config::load_config;
use pg_mcp_llm::OpenAiClient;
use pg_mcp_orchestrator::{AuditQueue, FileAuditBackend, Orchestrator};
use pg_mcp_pool::PoolManager;
use pg_mcp_ratelimit::RateLimiter;
use pg_mcp_schema::SchemaCache;
use pg_mcp_server::{AppState, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Natural-language SQL query gateway.
#[derive(Parser)]
#[command(name = "pg-mcp-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file. Falls back to `PG_MCP_CONFIG`
    /// or pure environment variables when omitted.
    #[arg(short, long, env = "PG_MCP_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP transport to.
    #[arg(long, env = "PG_MCP_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind_addr: SocketAddr,

    /// Path to the JSONL audit log file.
    #[arg(long, env = "PG_MCP_AUDIT_LOG_PATH", default_value = "pg-mcp-audit.jsonl")]
    audit_log_path: PathBuf,

    /// Bounded audit queue capacity.
    #[arg(long, env = "PG_MCP_AUDIT_QUEUE_CAPACITY", default_value_t = 1024)]
    audit_queue_capacity: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "pg_mcp_server=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting pg-mcp-server");

    let config = load_config(cli.config.as_deref())?;
    config.validate()?;
    let config = Arc::new(config);

    let pool = Arc::new(PoolManager::new());
    for db in &config.databases {
        pool.add(db).await?;
    }

    let schema_cache = Arc::new(SchemaCache::new(Duration::from_secs(config.server.cache_refresh_interval)));
    let rate_limiter = Arc::new(RateLimiter::new(config.server.rate_limit.clone()));
    rate_limiter.spawn_idle_eviction(Duration::from_secs(60));
    let sql_generator = Arc::new(OpenAiClient::new(config.openai.clone()));

    let audit_queue = Arc::new(AuditQueue::new(cli.audit_queue_capacity));
    let audit_backend = Arc::new(FileAuditBackend::new(cli.audit_log_path.to_string_lossy().to_string()).await?);
    audit_queue.spawn_consumer(audit_backend);

    let orchestrator = Arc::new(Orchestrator::new(
        (*config).clone(),
        Arc::clone(&pool),
        Arc::clone(&schema_cache),
        Arc::clone(&rate_limiter),
        sql_generator,
        Arc::clone(&audit_queue),
    ));

    let metrics_handle = pg_mcp_server::metrics::init_metrics()?;

    let state = AppState {
        orchestrator,
        schema_cache,
        pool,
        config,
        metrics_handle,
    };

    Server::new(cli.bind_addr, state).serve().await?;
    Ok(())
}
