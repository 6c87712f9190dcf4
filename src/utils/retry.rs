//! Bounded retry with exponential backoff for transient external errors.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Backoff multiplier applied after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

/// Classifies whether an error is worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Run `operation` until it succeeds, the error is non-retryable, or
/// attempts are exhausted. Returns the last error on failure.
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = config.initial_delay;

    for attempt in 1..=config.max_attempts.max(1) {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= config.max_attempts || !error.is_retryable() {
                    return Err(error);
                }
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, config.max_attempts, delay, error
                );
                sleep(delay + jitter(delay)).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.multiplier)
                    .min(config.max_delay);
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}

// Up to 25% of the base delay, seeded from the clock. Not cryptographic,
// just enough to decorrelate concurrent readers.
fn jitter(base: Duration) -> Duration {
    let quarter = (base.as_millis() as u64) / 4;
    if quarter == 0 {
        return Duration::ZERO;
    }
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(seed % quarter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(bool);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable={})", self.0)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryConfig::new(3), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TestError>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(5));
        let result = with_retry(&config, "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TestError(true))
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryConfig::new(3), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError(false))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(5));
        let result = with_retry(&config, "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError(true))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
