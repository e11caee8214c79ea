//! Distributed token-bucket rate limiter.
//!
//! One bucket shared by every worker, stored in the coordination store and
//! mutated only by the atomic acquire script: refill from elapsed wall
//! time, then grant or report the wait until enough tokens accrue.
//! Configuration lives beside the bucket and can be refreshed out-of-band
//! when the provider advertises new limits; lowering capacity clips the
//! current token balance.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use store::StoreClient;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::keys;
use crate::scripts;

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acquire {
    /// Whether the requested tokens were granted.
    pub granted: bool,
    /// Suggested wait before retrying, when denied.
    pub wait: Duration,
    /// Token balance after the attempt.
    pub tokens: f64,
}

/// Bucket contents, for status surfaces and tests.
#[derive(Debug, Clone, Copy)]
pub struct BucketView {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
}

/// Shared token bucket over the coordination store.
#[derive(Clone)]
pub struct RateLimiter {
    store: StoreClient,
    default_capacity: f64,
    default_refill_rate: f64,
}

impl RateLimiter {
    /// Create a limiter with defaults used until a configuration record
    /// exists in the store.
    pub fn new(store: StoreClient, default_capacity: f64, default_refill_rate: f64) -> Self {
        Self {
            store,
            default_capacity,
            default_refill_rate,
        }
    }

    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// One atomic acquire attempt.
    pub async fn try_acquire(&self, requested: u32) -> BrokerResult<Acquire> {
        let now = Self::now_epoch().to_string();
        let requested_arg = requested.to_string();
        let capacity = self.default_capacity.to_string();
        let refill = self.default_refill_rate.to_string();

        let (granted, wait, tokens): (i64, String, String) = self
            .store
            .run_script(
                &scripts::ACQUIRE_TOKENS,
                &[keys::RATE_LIMIT_BUCKET, keys::RATE_LIMIT_CONFIG],
                &[&now, &requested_arg, &capacity, &refill],
            )
            .await?;

        let wait_secs: f64 = wait.parse().map_err(|_| {
            BrokerError::Internal(format!("acquire script returned wait '{}'", wait))
        })?;
        let tokens: f64 = tokens.parse().map_err(|_| {
            BrokerError::Internal(format!("acquire script returned tokens '{}'", tokens))
        })?;

        Ok(Acquire {
            granted: granted == 1,
            wait: Duration::from_secs_f64(wait_secs.max(0.0)),
            tokens,
        })
    }

    /// Acquire `requested` tokens, waiting up to `timeout`.
    ///
    /// Loops on the atomic attempt, sleeping `min(wait, remaining)` between
    /// tries. Fails with `RateLimitTimeout` when the deadline passes; with
    /// a zero timeout and an empty bucket that is the immediate outcome.
    pub async fn acquire(&self, requested: u32, timeout: Duration) -> BrokerResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let attempt = self.try_acquire(requested).await?;
            if attempt.granted {
                debug!(requested, tokens_left = attempt.tokens, "Tokens granted");
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BrokerError::RateLimitTimeout(timeout));
            }

            let sleep_for = attempt.wait.min(remaining).max(Duration::from_millis(10));
            debug!(
                requested,
                wait_ms = sleep_for.as_millis() as u64,
                "Rate limited, waiting for refill"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Apply a provider-advertised limit of `requests` per `interval_secs`.
    ///
    /// Tokens above the new capacity are clipped inside the script.
    pub async fn update_config(&self, requests: u32, interval_secs: u32) -> BrokerResult<()> {
        if requests == 0 || interval_secs == 0 {
            return Err(BrokerError::Validation(
                "rate limit config requires requests > 0 and interval > 0".to_string(),
            ));
        }

        let requests_arg = requests.to_string();
        let interval_arg = interval_secs.to_string();
        let now_iso = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let now_epoch = Self::now_epoch().to_string();

        let _: String = self
            .store
            .run_script(
                &scripts::UPDATE_RATE_CONFIG,
                &[keys::RATE_LIMIT_BUCKET, keys::RATE_LIMIT_CONFIG],
                &[&requests_arg, &interval_arg, &now_iso, &now_epoch],
            )
            .await?;

        debug!(requests, interval_secs, "Rate limit config updated");
        Ok(())
    }

    /// Read the current bucket contents.
    pub async fn bucket(&self) -> BrokerResult<Option<BucketView>> {
        let fields = self.store.hash_get_all(keys::RATE_LIMIT_BUCKET).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let read = |name: &str| -> BrokerResult<f64> {
            fields
                .get(name)
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| {
                    BrokerError::Internal(format!("bucket field '{}' missing or invalid", name))
                })
        };

        Ok(Some(BucketView {
            tokens: read("tokens")?,
            capacity: read("capacity")?,
            refill_rate: read("refill_rate")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    // The bucket lives server-side; its arithmetic (refill monotonicity,
    // clipping, denial waits, B4 zero-timeout) is exercised in
    // tests/ratelimit_test.rs against a real store.
}
