//! Cancellation-aware retry with configurable backoff.

use std::fmt::Display;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (`u32::MAX` for effectively unbounded)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub multiplier: f64,
    /// Add jitter to retry delays to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fixed spacing between attempts, no backoff growth.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Why a retried operation did not produce a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The cancellation scope was closed while waiting between attempts.
    Cancelled,
    /// Every attempt failed; carries the last error.
    Exhausted(E),
}

/// Execute an async operation with retry, aborting promptly when the
/// cancellation scope closes.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    token: &CancellationToken,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if attempt >= config.max_attempts {
                    return Err(RetryError::Exhausted(err));
                }

                warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %err,
                    "attempt failed, retrying in {delay:?}"
                );

                let actual_delay = if config.jitter {
                    let jitter = Duration::from_millis(
                        (delay.as_millis() as f64 * rand::random::<f64>() * 0.3) as u64,
                    );
                    delay + jitter
                } else {
                    delay
                };

                tokio::select! {
                    _ = sleep(actual_delay) => {}
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                }

                delay = Duration::from_millis(
                    (delay.as_millis() as f64 * config.multiplier) as u64,
                )
                .min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let token = CancellationToken::new();
        let config = RetryConfig::fixed(3, Duration::from_millis(10));
        let result: std::result::Result<i32, RetryError<std::io::Error>> =
            retry_async(&config, &token, |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let token = CancellationToken::new();
        let config = RetryConfig::fixed(5, Duration::from_millis(5));

        let result = retry_async(&config, &token, |_| {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "transient"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_carries_last_error() {
        let token = CancellationToken::new();
        let config = RetryConfig::fixed(2, Duration::from_millis(5));

        let result: std::result::Result<i32, _> = retry_async(&config, &token, |_| async {
            Err::<i32, _>(std::io::Error::new(std::io::ErrorKind::Other, "nope"))
        })
        .await;

        match result {
            Err(RetryError::Exhausted(err)) => assert_eq!(err.to_string(), "nope"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let config = RetryConfig::fixed(u32::MAX, Duration::from_secs(3600));

        let result: std::result::Result<i32, _> = retry_async(&config, &token, |_| async {
            Err::<i32, _>(std::io::Error::new(std::io::ErrorKind::Other, "down"))
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn attempt_number_is_passed_through() {
        let token = CancellationToken::new();
        let config = RetryConfig::fixed(3, Duration::from_millis(1));
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();

        let _ = retry_async(&config, &token, |attempt| {
            seen_clone.store(attempt, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::Other, "again"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
