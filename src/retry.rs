use std::future::Future;
use std::time::Duration;

use log::{info, warn};

use crate::error::PlaygroundError;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `step * attempt`, capped at `max`
    Linear { step: Duration, max: Duration },
}

/// Bounded retry policy shared by the migration runner and the SQL gateway.
///
/// Only errors the classifier accepts are retried; anything else is returned
/// on first sight. When attempts run out the last error is wrapped in a
/// `ConnectionError` naming the attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    label: String,
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(label: &str, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            label: label.to_string(),
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// The migration runner waits for the database container to come up:
    /// `step * n` between attempts, never more than `max`.
    pub fn migrations(max_attempts: u32, step_ms: u64, max_ms: u64) -> Self {
        Self::new(
            "database connection",
            max_attempts,
            Backoff::Linear {
                step: Duration::from_millis(step_ms),
                max: Duration::from_millis(max_ms),
            },
        )
    }

    /// Request-path connections retry a few times at a fixed interval.
    pub fn gateway(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(
            "SQL connection",
            max_attempts,
            Backoff::Fixed(Duration::from_millis(delay_ms)),
        )
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { step, max } => step.saturating_mul(attempt).min(max),
        }
    }

    pub async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, PlaygroundError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlaygroundError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                "Attempting {} ({}/{})",
                self.label, attempt, self.max_attempts
            );
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.after_failure(attempt, err)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn retry_blocking<T, F>(&self, mut op: F) -> Result<T, PlaygroundError>
    where
        F: FnMut() -> Result<T, PlaygroundError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(
                "Attempting {} ({}/{})",
                self.label, attempt, self.max_attempts
            );
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let delay = self.after_failure(attempt, err)?;
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Decides what happens after a failed attempt: `Ok(delay)` to try
    /// again, `Err` to give up.
    fn after_failure(&self, attempt: u32, err: PlaygroundError) -> Result<Duration, PlaygroundError> {
        if !err.is_connectivity() {
            return Err(err);
        }

        warn!("{} attempt {} failed: {}", self.label, attempt, err);

        if attempt >= self.max_attempts {
            return Err(PlaygroundError::ConnectionError(format!(
                "{} failed after {} attempts: {}",
                self.label, self.max_attempts, err
            )));
        }

        let delay = self.delay_for(attempt);
        info!("Waiting {}ms before retry...", delay.as_millis());
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_linear_backoff_is_capped() {
        let policy = RetryPolicy::migrations(15, 2_000, 15_000);
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(6_000));
        assert_eq!(policy.delay_for(7), Duration::from_millis(14_000));
        assert_eq!(policy.delay_for(8), Duration::from_millis(15_000));
        assert_eq!(policy.delay_for(14), Duration::from_millis(15_000));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::gateway(5, 2_000);
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(2_000));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::gateway(0, 0);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy.retry_blocking(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PlaygroundError::ConnectionError("down".into()))
        });

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::gateway(5, 0);
        let calls = AtomicU32::new(0);

        let result = policy.retry_blocking(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(PlaygroundError::ConnectionError("not ready".into()))
            } else {
                Ok(n)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocking_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::gateway(4, 0);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy.retry_blocking(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PlaygroundError::ConnectionError("refused".into()))
        });

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(PlaygroundError::ConnectionError(msg)) => {
                assert!(msg.contains("after 4 attempts"), "{}", msg);
                assert!(msg.contains("refused"), "{}", msg);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_non_retryable_errors_return_immediately() {
        let policy = RetryPolicy::gateway(5, 0);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy.retry_blocking(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PlaygroundError::ValidationError("bad input".into()))
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(PlaygroundError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_async_retry() {
        let policy = RetryPolicy::gateway(3, 1);
        let calls = AtomicU32::new(0);

        let result = policy
            .retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        Err(PlaygroundError::ConnectionError("warming up".into()))
                    } else {
                        Ok("connected")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
