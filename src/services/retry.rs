//! Bounded exponential backoff.
//!
//! The caller decides which errors are worth another attempt; everything
//! else is returned on first sight.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Add up to 10% random spread to each delay
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            jitter: true,
        }
    }

    /// Broker submission retries for connection-class failures
    pub fn submission(config: &SchedulerConfig) -> Self {
        Self::new(
            config.max_submit_attempts,
            Duration::from_millis(config.submit_initial_backoff_ms),
            Duration::from_millis(config.submit_max_backoff_ms),
        )
    }

    /// Ledger write retries after the broker accepted an order
    pub fn ledger_write(config: &SchedulerConfig) -> Self {
        let initial = Duration::from_millis(config.ledger_initial_backoff_ms);
        Self::new(config.ledger_write_attempts, initial, initial * 8)
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry_count` (0-based)
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(retry_count));
        let capped = base.min(self.max_backoff);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let spread = capped.as_millis() as u64 / 10;
        let extra = rand::thread_rng().gen_range(0..=spread);
        (capped + Duration::from_millis(extra)).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` declines,
/// or the attempt budget is spent. `op` receives the 0-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    label: &str,
    mut should_retry: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                let delay = policy.backoff_duration(attempt - 1);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(10))
            .without_jitter();

        assert_eq!(policy.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_duration(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_duration(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_duration(4), Duration::from_secs(10)); // capped
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(150));
        for n in 0..5 {
            assert!(policy.backoff_duration(n) <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10));
        let result: Result<(), String> = retry_with_backoff(
            &policy,
            "test",
            |e: &String| e == "transient",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempt_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));
        let result: Result<(), String> = retry_with_backoff(
            &policy,
            "test",
            |_| true,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("transient".to_string()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failure() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40));
        let result: Result<u32, String> = retry_with_backoff(
            &policy,
            "test",
            |_| true,
            |attempt| async move {
                if attempt == 0 {
                    Err("transient".to_string())
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
