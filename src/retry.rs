use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff policy for idempotent reads. Code exchange and refresh are never
/// routed through here.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Per-attempt ceiling.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted. Returns the last error.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;
    let attempts = config.max_attempts.max(1);

    for attempt in 1..=attempts {
        let error = match timeout(config.timeout, operation()).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) if !e.is_retryable() => {
                debug!("error is not retryable: {e}");
                return Err(e);
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout(config.timeout),
        };

        if attempt == attempts {
            return Err(error);
        }
        warn!(attempt, ?delay, "attempt failed, retrying: {error}");
        sleep(delay).await;
        delay = config.next_delay(delay);
    }

    Err(Error::InternalError("retry loop exited without a result".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_success_on_second_attempt() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let config = RetryConfig {
            initial_delay: Duration::from_millis(10),
            ..Default::default()
        };

        let result = with_retry(&config, || {
            let count = attempt_count_clone.clone();
            async move {
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::UpstreamUnavailable("connection refused".into()))
                } else {
                    Ok("matches")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "matches");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_security_failures_never_retried() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<()> = with_retry(&RetryConfig::default(), || {
            let count = attempt_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(Error::IdentityMismatch)
            }
        })
        .await;

        assert!(matches!(result, Err(Error::IdentityMismatch)));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_timeout() {
        let config = RetryConfig {
            max_attempts: 2,
            timeout: Duration::from_millis(50),
            initial_delay: Duration::from_millis(10),
            ..Default::default()
        };

        let result: Result<&str> = with_retry(&config, || async {
            sleep(Duration::from_millis(200)).await;
            Ok("too late")
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = with_retry(&config, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::UpstreamUnavailable(format!("attempt {n}")))
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::UpstreamUnavailable(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_delay: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(
            config.next_delay(Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(
            config.next_delay(Duration::from_millis(200)),
            Duration::from_millis(300)
        );
    }
}
