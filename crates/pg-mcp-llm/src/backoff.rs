//! Exponential backoff with jitter for the language-model retry loop (§7).
//!
//! `delay = min(initial * multiplier^attempt, max) ± 25% jitter`, attempt
//! starting at 1. Database-connection-lost retries use a fixed 0.5s
//! delay instead; that executor lives in `pg-mcp-orchestrator` since it
//! has nothing to do with the LM.

use std::time::Duration;

use rand::Rng;

/// `initial=1s, multiplier=2, max=30s, jitter=±25%` (§7).
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Ceiling on the computed delay, before jitter.
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl ExponentialBackoff {
    /// Delay before retry attempt `attempt` (1-indexed), with ±25% jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32 - 1);
        let capped = base.min(self.max.as_secs_f64());
        let jitter_range = capped * 0.25;
        let jittered = capped + rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_near_initial_delay() {
        let backoff = ExponentialBackoff::default();
        let delay = backoff.delay_for(1);
        assert!(delay.as_secs_f64() >= 0.75 && delay.as_secs_f64() <= 1.25);
    }

    #[test]
    fn delay_is_capped_at_max() {
        let backoff = ExponentialBackoff::default();
        let delay = backoff.delay_for(20);
        assert!(delay.as_secs_f64() <= backoff.max.as_secs_f64() * 1.25);
    }

    #[test]
    fn delay_grows_between_early_attempts() {
        let backoff = ExponentialBackoff {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        };
        // Jitter makes single-sample comparison flaky; compare averages.
        let avg = |attempt: u32| -> f64 {
            (0..20).map(|_| backoff.delay_for(attempt).as_secs_f64()).sum::<f64>() / 20.0
        };
        assert!(avg(3) > avg(1));
    }
}
