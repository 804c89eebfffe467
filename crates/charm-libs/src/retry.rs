//! Bounded retry with exponential backoff
//!
//! Retries stop once the elapsed time since the first attempt reaches
//! `stop_after`, so a hook never stalls indefinitely on a flaky API server.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

/// Retry policy for calls against the cluster API
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_backoff: Duration,
    /// Upper bound on a single delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// No new attempt starts after this much time has elapsed
    pub stop_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(20),
            multiplier: 2.0,
            stop_after: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            stop_after: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Delay to wait after `current`, capped at `max_backoff`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = Duration::from_secs_f64(current.as_secs_f64() * self.multiplier);
        std::cmp::min(next, self.max_backoff)
    }
}

/// Run `operation` until it succeeds, fails permanently or the policy gives up
///
/// `is_retryable` decides which errors are worth another attempt; any other
/// error is returned immediately. The last error is returned when the time
/// budget runs out.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = policy.initial_backoff;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !is_retryable(&err) {
            return Err(err);
        }

        let elapsed = started.elapsed();
        if elapsed + delay > policy.stop_after {
            error!(
                operation = %operation_name,
                attempt = attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %err,
                "Operation failed, retry budget exhausted"
            );
            return Err(err);
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
        delay = policy.next_backoff(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
            stop_after: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(policy.next_backoff(Duration::from_secs(16)), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_with_backoff(
            &fast_policy(),
            "flaky",
            |_| true,
            || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_with_backoff(
            &fast_policy(),
            "permanent",
            |e: &String| e != "forbidden",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("forbidden".to_string())
            },
        )
        .await;

        assert_eq!(result, Err("forbidden".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_makes_one_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_with_backoff(
            &RetryPolicy::no_retry(),
            "once",
            |_| true,
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_stop_delay() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            multiplier: 2.0,
            stop_after: Duration::from_millis(100),
        };
        let result: Result<(), String> = retry_with_backoff(&policy, "down", |_| true, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("unavailable".to_string())
        })
        .await;

        assert!(result.is_err());
        // 10 + 20 + 40ms of delays leaves no room for a fifth attempt
        let calls = counter.load(Ordering::SeqCst);
        assert!((2..=4).contains(&calls), "unexpected attempt count {calls}");
    }
}
