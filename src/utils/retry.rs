//! Retry with exponential backoff for idempotent start-up calls.
//!
//! The one legitimate consumer is broker bootstrap (consumer-group creation
//! while the service is still warming). Worker loops do NOT retry through
//! this module; their redelivery semantics come from the consumer group.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Ceiling applied after multiplication.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `n + 1`, given the delay used before attempt `n`.
    fn next_delay(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.multiplier);
        grown.min(self.max_delay)
    }
}

/// Errors from [`with_exponential_backoff`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        source: E,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },
}

/// Execute `f` up to `cfg.max_attempts` times with exponential backoff.
///
/// Cancellation is honoured between attempts; the in-flight attempt itself
/// is not interrupted. On exhaustion the last error is returned wrapped with
/// the operation name.
pub async fn with_exponential_backoff<F, Fut, T, E>(
    token: &CancellationToken,
    cfg: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = cfg.initial_delay;
    let mut last_err = None;

    for attempt in 1..=cfg.max_attempts {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled {
                operation: operation.to_string(),
            });
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = cfg.max_attempts,
                    error = %err,
                    "attempt failed"
                );
                last_err = Some(err);
            }
        }

        if attempt >= cfg.max_attempts {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
        delay = cfg.next_delay(delay);
    }

    Err(RetryError::Exhausted {
        operation: operation.to_string(),
        attempts: cfg.max_attempts,
        source: last_err.expect("at least one attempt ran"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_exponential_backoff(&token, &fast_config(), "noop", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_failures() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_exponential_backoff(&token, &fast_config(), "flaky", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_wraps_operation_name() {
        let token = CancellationToken::new();

        let result: Result<(), _> =
            with_exponential_backoff(&token, &fast_config(), "broker setup", || async {
                Err("connection refused".to_string())
            })
            .await;

        match result {
            Err(RetryError::Exhausted {
                operation,
                attempts,
                source,
            }) => {
                assert_eq!(operation, "broker setup");
                assert_eq!(attempts, 4);
                assert_eq!(source, "connection refused");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), _> =
            with_exponential_backoff(&token, &fast_config(), "cancelled op", || async {
                Err("never".to_string())
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
    }

    #[test]
    fn delay_clamps_at_max() {
        let cfg = RetryConfig::default();
        let mut delay = cfg.initial_delay;
        for _ in 0..10 {
            delay = cfg.next_delay(delay);
        }
        assert_eq!(delay, cfg.max_delay);
    }
}
