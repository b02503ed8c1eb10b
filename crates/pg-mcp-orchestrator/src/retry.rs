//! Fixed-delay retry for connection-lost failures (§7). The
//! language-model client's own exponential backoff lives in
//! `pg-mcp-llm`; this executor only covers `ConnectionError{retryable:
//! true}` from the pool, which the spec calls out with a flat 0.5s delay
//! rather than a growing one, since a dropped connection either comes
//! back immediately or the pool itself is unhealthy.

use std::time::Duration;

use pg_mcp_error::{PgMcpError, Result};
use tracing::warn;

/// Delay between connection-lost retries (§7).
pub const CONNECTION_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Maximum connection-lost retries before giving up.
pub const MAX_CONNECTION_RETRIES: u32 = 2;

/// Run `f`, retrying up to [`MAX_CONNECTION_RETRIES`] times with a fixed
/// delay when it fails with a retryable `ConnectionError`. Any other
/// error, or exhausting the retry budget, is returned immediately.
pub async fn with_connection_retry<F, Fut, T>(database: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(PgMcpError::ConnectionError { message, retryable: true, .. }) if attempt < MAX_CONNECTION_RETRIES => {
                attempt += 1;
                warn!(database, attempt, %message, "connection lost, retrying after fixed delay");
                tokio::time::sleep(CONNECTION_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_connection_errors_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = with_connection_retry("main", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 1 {
                Err(PgMcpError::ConnectionError {
                    database: "main".to_string(),
                    message: "reset".to_string(),
                    retryable: true,
                })
            } else {
                Ok(42)
            }
        })
        .await
        .expect("eventually succeeds");
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn never_retries_a_non_retryable_connection_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_connection_retry("main", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(PgMcpError::ConnectionError {
                database: "main".to_string(),
                message: "pool closed".to_string(),
                retryable: false,
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
