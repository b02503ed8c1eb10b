//! Rate Limiter (C7, §4.7): per-client sliding-window admission control
//! plus a token bucket for language-model tokens.
//!
//! Per §5's shared-resource policy, one coordinator lock protects every
//! client's state; contention is expected to stay low because the
//! critical section is O(1) plus a bounded trim. This is the one
//! process-wide component besides the audit/metrics sinks (§9): it takes
//! its configuration as constructor input and is never read lazily.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pg_mcp_core::RateLimitConfig;
use pg_mcp_error::{PgMcpError, Result};
use tracing::{info, warn};

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

struct SlidingWindow {
    window_secs: f64,
    max_count: u32,
    timestamps: VecDeque<f64>,
}

impl SlidingWindow {
    fn new(window_secs: f64, max_count: u32) -> Self {
        Self {
            window_secs,
            max_count,
            timestamps: VecDeque::new(),
        }
    }

    fn trim(&mut self, now: f64) {
        let cutoff = now - self.window_secs;
        while matches!(self.timestamps.front(), Some(&t) if t < cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Attempt to record one event. Returns `false` (and records
    /// nothing) if the window is already at capacity.
    fn try_increment(&mut self, now: f64) -> bool {
        self.trim(now);
        if self.timestamps.len() as u32 >= self.max_count {
            return false;
        }
        self.timestamps.push_back(now);
        true
    }

    fn undo_last(&mut self) {
        self.timestamps.pop_back();
    }

    fn remaining(&self, now: f64) -> u32 {
        let cutoff = now - self.window_secs;
        let count = self.timestamps.iter().filter(|&&t| t >= cutoff).count() as u32;
        self.max_count.saturating_sub(count)
    }

    fn reset_at(&self, now: f64) -> i64 {
        self.timestamps.front().map_or(now as i64, |&oldest| (oldest + self.window_secs) as i64)
    }
}

struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: f64,
}

impl TokenBucket {
    fn new(capacity: f64, now: f64) -> Self {
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, now: f64, requested: f64) -> bool {
        self.refill(now);
        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }

    fn available(&self) -> f64 {
        self.tokens
    }
}

struct ClientBucket {
    minute: SlidingWindow,
    hour: SlidingWindow,
    tokens: TokenBucket,
    last_activity: f64,
}

impl ClientBucket {
    fn new(config: &RateLimitConfig, now: f64) -> Self {
        Self {
            minute: SlidingWindow::new(60.0, config.requests_per_minute),
            hour: SlidingWindow::new(3600.0, config.requests_per_hour),
            tokens: TokenBucket::new(f64::from(config.openai_tokens_per_minute), now),
            last_activity: now,
        }
    }
}

/// Current admission status for one client, for diagnostics/metrics.
#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    /// Whether admission control is enforced at all.
    pub enabled: bool,
    /// Requests remaining in the current minute window.
    pub requests_per_minute_remaining: u32,
    /// Requests remaining in the current hour window.
    pub requests_per_hour_remaining: u32,
    /// Tokens currently available in the bucket.
    pub tokens_available: u32,
}

/// The module-global rate-limit coordinator (C7). Per-client state is
/// keyed by an opaque client identifier (IP, API-key hash, or
/// `"anonymous"`, §3).
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<HashMap<String, ClientBucket>>,
}

impl RateLimiter {
    /// Construct a coordinator from `config`. A disabled limiter still
    /// tracks no state; every check short-circuits immediately (§4.7).
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically increment the per-minute and per-hour sliding windows
    /// for `client`. If either is exceeded, the other is decremented
    /// back so counts stay consistent, and a `RateLimitExceeded` error
    /// is raised (§4.7).
    ///
    /// # Errors
    ///
    /// Returns `PgMcpError::RateLimitExceeded` if either window is full.
    pub fn check_request(&self, client: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = now_secs();
        let mut state = self.state.lock();
        let bucket = state.entry(client.to_string()).or_insert_with(|| ClientBucket::new(&self.config, now));
        bucket.last_activity = now;

        if !bucket.minute.try_increment(now) {
            let remaining = bucket.minute.remaining(now);
            let reset_at = bucket.minute.reset_at(now);
            warn!(client, limit = self.config.requests_per_minute, "rate limit exceeded (minute window)");
            return Err(PgMcpError::RateLimitExceeded {
                window: "minute".to_string(),
                limit: u64::from(self.config.requests_per_minute),
                remaining: u64::from(remaining),
                reset_at,
            });
        }

        if !bucket.hour.try_increment(now) {
            bucket.minute.undo_last();
            let remaining = bucket.hour.remaining(now);
            let reset_at = bucket.hour.reset_at(now);
            warn!(client, limit = self.config.requests_per_hour, "rate limit exceeded (hour window)");
            return Err(PgMcpError::RateLimitExceeded {
                window: "hour".to_string(),
                limit: u64::from(self.config.requests_per_hour),
                remaining: u64::from(remaining),
                reset_at,
            });
        }

        Ok(())
    }

    /// Attempt to consume `estimated_tokens` from `client`'s token
    /// bucket (§4.7).
    ///
    /// # Errors
    ///
    /// Returns `PgMcpError::RateLimitExceeded` with `window: "minute"`
    /// if insufficient tokens are available.
    pub fn check_tokens(&self, client: &str, estimated_tokens: u32) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = now_secs();
        let mut state = self.state.lock();
        let bucket = state.entry(client.to_string()).or_insert_with(|| ClientBucket::new(&self.config, now));
        bucket.last_activity = now;

        if !bucket.tokens.try_consume(now, f64::from(estimated_tokens)) {
            let available = bucket.tokens.available() as u64;
            warn!(client, requested = estimated_tokens, available, "token rate limit exceeded");
            return Err(PgMcpError::RateLimitExceeded {
                window: "minute".to_string(),
                limit: u64::from(self.config.openai_tokens_per_minute),
                remaining: available,
                reset_at: now as i64 + 60,
            });
        }

        Ok(())
    }

    /// Record the actual tokens a completed call used, for monitoring
    /// only; the estimate was already consumed by `check_tokens` (§4.7).
    pub fn record_tokens(&self, client: &str, actual_tokens: u32) {
        if !self.config.enabled {
            return;
        }
        tracing::debug!(client, actual_tokens, "tokens used");
    }

    /// Current status snapshot for `client`, for diagnostics.
    #[must_use]
    pub fn status(&self, client: &str) -> RateLimitStatus {
        let now = now_secs();
        let mut state = self.state.lock();
        let bucket = state.entry(client.to_string()).or_insert_with(|| ClientBucket::new(&self.config, now));
        RateLimitStatus {
            enabled: self.config.enabled,
            requests_per_minute_remaining: bucket.minute.remaining(now),
            requests_per_hour_remaining: bucket.hour.remaining(now),
            tokens_available: bucket.tokens.available() as u32,
        }
    }

    /// Remove any client bucket idle for longer than
    /// `rate_limit.idle_timeout_secs` (§4.7 client-identity isolation).
    pub fn evict_idle(&self) {
        let now = now_secs();
        let idle_timeout = self.config.idle_timeout_secs as f64;
        let mut state = self.state.lock();
        let before = state.len();
        state.retain(|_, bucket| now - bucket.last_activity < idle_timeout);
        let evicted = before - state.len();
        if evicted > 0 {
            info!(evicted, "evicted idle rate-limit buckets");
        }
    }

    /// Spawn a background task that periodically evicts idle buckets.
    /// Returns a handle the caller can abort on shutdown.
    pub fn spawn_idle_eviction(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                limiter.evict_idle();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(requests_per_minute: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            requests_per_minute,
            requests_per_hour: 10_000,
            openai_tokens_per_minute: 10_000,
            idle_timeout_secs: 3600,
        }
    }

    #[test]
    fn admits_requests_up_to_the_minute_limit_then_denies() {
        let limiter = RateLimiter::new(config(3));
        for _ in 0..3 {
            limiter.check_request("client-a").expect("admitted");
        }
        let err = limiter.check_request("client-a").unwrap_err();
        assert!(matches!(err, PgMcpError::RateLimitExceeded { ref window, limit: 3, .. } if window == "minute"));
    }

    #[test]
    fn distinct_clients_never_share_state() {
        let limiter = RateLimiter::new(config(1));
        limiter.check_request("client-a").expect("admitted");
        limiter.check_request("client-b").expect("a different client is unaffected");
        assert!(limiter.check_request("client-a").is_err());
    }

    #[test]
    fn hour_denial_rolls_back_the_minute_counter() {
        let mut cfg = config(100);
        cfg.requests_per_hour = 1;
        let limiter = RateLimiter::new(cfg);
        limiter.check_request("client-a").expect("first request admitted");
        let err = limiter.check_request("client-a").unwrap_err();
        assert!(matches!(err, PgMcpError::RateLimitExceeded { ref window, .. } if window == "hour"));

        let status = limiter.status("client-a");
        // The rolled-back minute counter should show the single successful
        // request, not a phantom second increment from the denied attempt.
        assert_eq!(status.requests_per_minute_remaining, 99);
    }

    #[test]
    fn disabled_limiter_never_denies() {
        let mut cfg = config(1);
        cfg.enabled = false;
        let limiter = RateLimiter::new(cfg);
        for _ in 0..10 {
            limiter.check_request("client-a").expect("disabled limiter always admits");
        }
    }

    #[test]
    fn token_bucket_denies_when_insufficient() {
        let mut cfg = config(1000);
        cfg.openai_tokens_per_minute = 1000;
        let limiter = RateLimiter::new(cfg);
        limiter.check_tokens("client-a", 900).expect("fits in bucket");
        let err = limiter.check_tokens("client-a", 200).unwrap_err();
        assert!(matches!(err, PgMcpError::RateLimitExceeded { ref window, .. } if window == "minute"));
    }

    #[test]
    fn evict_idle_removes_stale_clients_only() {
        let mut cfg = config(10);
        cfg.idle_timeout_secs = 0;
        let limiter = RateLimiter::new(cfg);
        limiter.check_request("client-a").expect("admitted");
        limiter.evict_idle();
        // With a zero idle timeout every bucket is immediately stale;
        // the next check simply starts a fresh one.
        limiter.check_request("client-a").expect("fresh bucket after eviction");
    }
}
