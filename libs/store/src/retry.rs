//! Connection retry policy.
//!
//! Only connection-class failures are retried: a store that is still
//! booting, a dropped socket, a refused connect. Logical replies
//! (health-check mismatches, script verdicts) fail immediately, matching
//! the adapter contract that the retry layer never masks server-returned
//! errors.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Backoff policy for reconnect attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry `attempt` (1-indexed): exponential doubling from
    /// the base, capped, then jittered down to 50-100% of the computed
    /// value so a restarting fleet does not reconnect in lockstep.
    fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = doubled.min(self.max_delay);
        let jitter_factor = 0.5 + rand::random::<f64>() * 0.5;
        capped.mul_f64(jitter_factor)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run a store operation, retrying on connection-class errors only.
///
/// Used at startup around [`crate::connect`] so workers survive racing the
/// store itself coming up.
///
/// # Example
/// ```ignore
/// use store::{RetryConfig, StoreConfig, retry_on_connection};
///
/// let config = StoreConfig::from_env()?;
/// let client = retry_on_connection(
///     || store::connect(config.clone()),
///     RetryConfig::new().with_max_retries(5),
/// )
/// .await?;
/// ```
pub async fn retry_on_connection<F, Fut, T>(
    mut operation: F,
    config: RetryConfig,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(retries = attempt, "Store operation succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if !e.is_connection_error() => {
                // Logical failure: the store answered, retrying cannot help
                return Err(e);
            }
            Err(e) => {
                attempt += 1;
                if attempt > config.max_retries {
                    warn!(
                        attempts = attempt,
                        error = %e,
                        "Giving up on store connection"
                    );
                    return Err(e);
                }

                let delay = config.delay_for(attempt);
                debug!(
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connection_error() -> StoreError {
        StoreError::ConnectionFailed("connection refused".to_string())
    }

    fn logical_error() -> StoreError {
        StoreError::HealthCheckFailed("unexpected reply".to_string())
    }

    fn fast_config() -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(3)
            .with_base_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_first_attempt_success_does_not_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_on_connection(
            || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(42)
                }
            },
            fast_config(),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = retry_on_connection(
            || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(connection_error())
                    } else {
                        Ok("connected")
                    }
                }
            },
            fast_config(),
        )
        .await;

        assert_eq!(result.unwrap(), "connected");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_logical_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: StoreResult<()> = retry_on_connection(
            || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(logical_error())
                }
            },
            fast_config(),
        )
        .await;

        assert!(matches!(
            result.unwrap_err(),
            StoreError::HealthCheckFailed(_)
        ));
        // No second attempt for a server-returned error
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: StoreResult<()> = retry_on_connection(
            || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(connection_error())
                }
            },
            fast_config(),
        )
        .await;

        assert!(result.is_err());
        // Initial attempt plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_doubles_caps_and_jitters() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300));

        for _ in 0..20 {
            // Attempt 1: 50-100% of 100ms
            let first = config.delay_for(1);
            assert!(first >= Duration::from_millis(50));
            assert!(first <= Duration::from_millis(100));

            // Attempt 3 would be 400ms uncapped; the cap applies before
            // jitter, so 150-300ms
            let third = config.delay_for(3);
            assert!(third >= Duration::from_millis(150));
            assert!(third <= Duration::from_millis(300));
        }
    }
}
