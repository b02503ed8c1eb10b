//! Audit sink (§4.9, §5): single producer per request, single consumer
//! per sink. The queue is bounded; overflow drops the oldest record and
//! increments a counter rather than blocking the request path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pg_mcp_core::redact::{redact_json, DEFAULT_PATTERNS};
use pg_mcp_core::AuditEvent;
use pg_mcp_error::Result;
use tokio::sync::Notify;
use tracing::{error, warn};

/// A destination for finished audit events. Exactly one producer (the
/// orchestrator's bounded queue consumer) calls `log_event` per sink.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    /// Persist `event`.
    ///
    /// # Errors
    ///
    /// Returns whatever storage error the backend encountered; the
    /// queue consumer logs and continues rather than retrying.
    async fn log_event(&self, event: &AuditEvent) -> Result<()>;
}

struct QueueState {
    events: VecDeque<AuditEvent>,
}

/// Bounded in-memory audit queue with drop-oldest overflow (§5). A
/// background task drains it into one [`AuditBackend`].
pub struct AuditQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl AuditQueue {
    /// Construct an empty queue bounded to `capacity` pending events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState { events: VecDeque::with_capacity(capacity.min(64)) }),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `event`, dropping the oldest pending event if the queue
    /// is already at capacity. Never blocks the caller.
    pub fn push(&self, event: AuditEvent) {
        #[allow(clippy::unwrap_used)] // Reason: std Mutex only poisons on an earlier panic while held; nothing here can panic.
        let mut state = self.state.lock().unwrap();
        if state.events.len() >= self.capacity {
            state.events.pop_front();
            let total_dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(total_dropped, "audit queue at capacity; dropped oldest pending event");
        }
        state.events.push_back(event);
        drop(state);
        self.notify.notify_one();
    }

    /// Total events dropped for overflow since construction.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn pop(&self) -> AuditEvent {
        loop {
            {
                #[allow(clippy::unwrap_used)] // Reason: see `push`.
                let mut state = self.state.lock().unwrap();
                if let Some(event) = state.events.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Spawn the single consumer task that drains the queue into
    /// `backend` for as long as the returned handle is alive.
    pub fn spawn_consumer(self: &Arc<Self>, backend: Arc<dyn AuditBackend>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = queue.pop().await;
                if let Err(e) = backend.log_event(&event).await {
                    error!(error = %e, event_id = %event.event_id, "failed to persist audit event");
                }
            }
        })
    }
}

/// Append-only JSONL audit backend (§4.9 default).
pub struct FileAuditBackend {
    file_path: String,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileAuditBackend {
    /// Open (creating if absent) the audit log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `PgMcpError::Internal` if the file cannot be opened.
    pub async fn new(path: impl Into<String>) -> Result<Self> {
        let file_path = path.into();
        tokio::fs::OpenOptions::new().create(true).append(true).open(&file_path).await?;
        Ok(Self {
            file_path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait]
impl AuditBackend for FileAuditBackend {
    async fn log_event(&self, event: &AuditEvent) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let _guard = self.write_lock.lock().await;
        let redacted = redact_json(serde_json::to_value(event)?, DEFAULT_PATTERNS);
        let line = serde_json::to_string(&redacted)?;
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.file_path).await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// PostgreSQL-backed audit storage, for deployments that want queryable
/// audit history instead of (or in addition to) the JSONL file (§4.9).
#[cfg(feature = "postgres-audit")]
pub struct PostgresAuditBackend {
    pool: std::sync::Arc<pg_mcp_pool::PoolManager>,
    database: String,
}

#[cfg(feature = "postgres-audit")]
impl PostgresAuditBackend {
    /// Build a backend writing into `database`'s `pg_mcp_audit_log` table.
    ///
    /// # Errors
    ///
    /// Returns whatever error creating the table produced.
    pub async fn new(pool: std::sync::Arc<pg_mcp_pool::PoolManager>, database: impl Into<String>) -> Result<Self> {
        let database = database.into();
        pool.acquire(&database, |client| async move {
            client
                .execute(
                    "CREATE TABLE IF NOT EXISTS pg_mcp_audit_log (
                        event_id UUID PRIMARY KEY,
                        occurred_at TIMESTAMPTZ NOT NULL,
                        event_type TEXT NOT NULL,
                        client_id TEXT NOT NULL,
                        event JSONB NOT NULL
                    )",
                    &[],
                )
                .await
                .map_err(|e| pg_mcp_error::PgMcpError::internal(format!("failed to create audit table: {e}")))?;
            Ok(())
        })
        .await?;
        Ok(Self { pool, database })
    }
}

#[cfg(feature = "postgres-audit")]
#[async_trait]
impl AuditBackend for PostgresAuditBackend {
    async fn log_event(&self, event: &AuditEvent) -> Result<()> {
        let payload = redact_json(serde_json::to_value(event)?, DEFAULT_PATTERNS);
        let event_id = event.event_id;
        let timestamp = event.timestamp.clone();
        let event_type = format!("{:?}", event.event_type);
        let client_id = event.client_info.client_id.clone();
        self.pool
            .acquire(&self.database, move |client| async move {
                client
                    .execute(
                        "INSERT INTO pg_mcp_audit_log (event_id, occurred_at, event_type, client_id, event)
                         VALUES ($1, $2::timestamptz, $3, $4, $5)",
                        &[&event_id, &timestamp, &event_type, &client_id, &payload],
                    )
                    .await
                    .map_err(|e| pg_mcp_error::PgMcpError::internal(format!("failed to insert audit event: {e}")))?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pg_mcp_core::audit::{AuditEventType, ClientInfo};
    use std::sync::atomic::AtomicUsize;

    struct CountingBackend {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AuditBackend for CountingBackend {
        async fn log_event(&self, _event: &AuditEvent) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_event() -> AuditEvent {
        AuditEvent::new(
            AuditEventType::QueryExecuted,
            ClientInfo {
                client_id: "anonymous".to_string(),
                ip_address: None,
            },
            "how many users",
            Some("SELECT count(*) FROM users".to_string()),
            "main",
        )
    }

    #[test]
    fn push_beyond_capacity_drops_oldest_and_counts() {
        let queue = AuditQueue::new(2);
        queue.push(sample_event());
        queue.push(sample_event());
        queue.push(sample_event());
        assert_eq!(queue.dropped_count(), 1);
    }

    #[tokio::test]
    async fn consumer_drains_every_pushed_event() {
        let queue = Arc::new(AuditQueue::new(16));
        let count = Arc::new(AtomicUsize::new(0));
        let backend: Arc<dyn AuditBackend> = Arc::new(CountingBackend { count: count.clone() });
        let handle = queue.spawn_consumer(backend);

        for _ in 0..5 {
            queue.push(sample_event());
        }

        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn file_backend_appends_jsonl() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pg-mcp-audit-test-{}.jsonl", uuid::Uuid::new_v4()));
        let backend = FileAuditBackend::new(path.to_string_lossy().to_string()).await.expect("opens");
        backend.log_event(&sample_event()).await.expect("logs");
        let contents = tokio::fs::read_to_string(&path).await.expect("reads");
        assert_eq!(contents.lines().count(), 1);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
