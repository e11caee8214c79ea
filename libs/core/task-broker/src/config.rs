//! Broker configuration.
//!
//! One config struct per concern area, builder methods for the knobs that
//! tests and deployments actually turn, and env loading for the worker
//! binary.

use core_config::{ConfigError, FromEnv, env_parsed};
use std::time::Duration;
use uuid::Uuid;

use crate::breaker::BreakerConfig;

/// Configuration for a worker's broker components.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Unique worker identity (auto-generated if not provided).
    pub worker_id: String,

    /// Number of concurrent dispatch loops (`W`).
    pub concurrency: usize,

    /// Default retry cap for tasks submitted without one.
    pub max_retries: u32,

    /// Absolute task age after which retries stop, in seconds.
    pub max_task_age_secs: u64,

    /// Retry-queue depth at which the adaptive retry ratio steps down.
    pub retry_warn_depth: usize,

    /// Retry-queue depth at which the adaptive retry ratio bottoms out.
    pub retry_crit_depth: usize,

    /// Per-task soft deadline, in seconds; triggers cooperative cancel.
    pub soft_limit_secs: u64,

    /// Per-task hard deadline, in seconds; abandons the attempt.
    pub hard_limit_secs: u64,

    /// Ceiling on waiting for a rate-limit token, in seconds.
    pub token_wait_secs: u64,

    /// Bounded blocking-pop timeout, in seconds.
    pub pop_timeout_secs: u64,

    /// Scheduler promotion tick, in milliseconds.
    pub scheduler_tick_ms: u64,

    /// Max scheduled items promoted per tick.
    pub scheduler_batch: usize,

    /// Heartbeat period, in seconds.
    pub heartbeat_period_secs: u64,

    /// Heartbeat TTL as a multiple of the period.
    pub heartbeat_ttl_factor: u32,

    /// Period of full queue-snapshot events, in seconds.
    pub snapshot_period_secs: u64,

    /// Grace period for draining in-flight tasks at shutdown, in seconds.
    pub shutdown_grace_secs: u64,

    /// Provider cache freshness window, in seconds.
    pub provider_fresh_secs: u64,

    /// Consecutive provider failures before its circuit flag opens.
    pub provider_circuit_threshold: u32,

    /// Per-worker circuit breaker parameters.
    pub breaker: BreakerConfig,
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_task_age_secs(mut self, secs: u64) -> Self {
        self.max_task_age_secs = secs;
        self
    }

    pub fn with_retry_ratio_thresholds(mut self, warn: usize, crit: usize) -> Self {
        self.retry_warn_depth = warn;
        self.retry_crit_depth = crit;
        self
    }

    pub fn with_deadlines(mut self, soft_secs: u64, hard_secs: u64) -> Self {
        self.soft_limit_secs = soft_secs;
        self.hard_limit_secs = hard_secs.max(soft_secs);
        self
    }

    pub fn with_token_wait_secs(mut self, secs: u64) -> Self {
        self.token_wait_secs = secs;
        self
    }

    pub fn with_pop_timeout_secs(mut self, secs: u64) -> Self {
        self.pop_timeout_secs = secs;
        self
    }

    pub fn with_scheduler_tick_ms(mut self, ms: u64) -> Self {
        self.scheduler_tick_ms = ms;
        self
    }

    pub fn with_heartbeat(mut self, period_secs: u64, ttl_factor: u32) -> Self {
        self.heartbeat_period_secs = period_secs;
        self.heartbeat_ttl_factor = ttl_factor.max(1);
        self
    }

    pub fn with_shutdown_grace_secs(mut self, secs: u64) -> Self {
        self.shutdown_grace_secs = secs;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn soft_limit(&self) -> Duration {
        Duration::from_secs(self.soft_limit_secs)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_secs(self.hard_limit_secs)
    }

    pub fn token_wait(&self) -> Duration {
        Duration::from_secs(self.token_wait_secs)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 4,
            max_retries: 3,
            max_task_age_secs: 7_200,
            retry_warn_depth: 1_000,
            retry_crit_depth: 5_000,
            soft_limit_secs: 600,
            hard_limit_secs: 900,
            token_wait_secs: 30,
            pop_timeout_secs: 5,
            scheduler_tick_ms: 1_000,
            scheduler_batch: 100,
            heartbeat_period_secs: 10,
            heartbeat_ttl_factor: 3,
            snapshot_period_secs: 5,
            shutdown_grace_secs: 30,
            provider_fresh_secs: 60,
            provider_circuit_threshold: 5,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Load BrokerConfig from environment variables
///
/// Environment variables (all optional, defaults above):
/// - `WORKER_ID`, `DISPATCHER_CONCURRENCY`, `MAX_RETRIES`, `MAX_TASK_AGE_SECS`
/// - `RETRY_WARN_DEPTH`, `RETRY_CRIT_DEPTH`
/// - `SOFT_LIMIT_SECS`, `HARD_LIMIT_SECS`, `TOKEN_WAIT_SECS`
/// - `SCHEDULER_TICK_MS`, `HEARTBEAT_PERIOD_SECS`, `SHUTDOWN_GRACE_SECS`
///
/// Cross-field constraints are validated after parsing: the hard deadline
/// must not undercut the soft one, and the retry-depth thresholds must be
/// ordered.
impl FromEnv for BrokerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = BrokerConfig::default();

        let worker_id = match std::env::var("WORKER_ID") {
            Ok(id) if !id.is_empty() => id,
            _ => defaults.worker_id.clone(),
        };

        let config = Self {
            worker_id,
            concurrency: env_parsed("DISPATCHER_CONCURRENCY", defaults.concurrency)?,
            max_retries: env_parsed("MAX_RETRIES", defaults.max_retries)?,
            max_task_age_secs: env_parsed("MAX_TASK_AGE_SECS", defaults.max_task_age_secs)?,
            retry_warn_depth: env_parsed("RETRY_WARN_DEPTH", defaults.retry_warn_depth)?,
            retry_crit_depth: env_parsed("RETRY_CRIT_DEPTH", defaults.retry_crit_depth)?,
            soft_limit_secs: env_parsed("SOFT_LIMIT_SECS", defaults.soft_limit_secs)?,
            hard_limit_secs: env_parsed("HARD_LIMIT_SECS", defaults.hard_limit_secs)?,
            token_wait_secs: env_parsed("TOKEN_WAIT_SECS", defaults.token_wait_secs)?,
            pop_timeout_secs: env_parsed("POP_TIMEOUT_SECS", defaults.pop_timeout_secs)?,
            scheduler_tick_ms: env_parsed("SCHEDULER_TICK_MS", defaults.scheduler_tick_ms)?,
            scheduler_batch: env_parsed("SCHEDULER_BATCH", defaults.scheduler_batch)?,
            heartbeat_period_secs: env_parsed(
                "HEARTBEAT_PERIOD_SECS",
                defaults.heartbeat_period_secs,
            )?,
            heartbeat_ttl_factor: env_parsed(
                "HEARTBEAT_TTL_FACTOR",
                defaults.heartbeat_ttl_factor,
            )?,
            snapshot_period_secs: env_parsed(
                "SNAPSHOT_PERIOD_SECS",
                defaults.snapshot_period_secs,
            )?,
            shutdown_grace_secs: env_parsed("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs)?,
            provider_fresh_secs: env_parsed("PROVIDER_FRESH_SECS", defaults.provider_fresh_secs)?,
            provider_circuit_threshold: env_parsed(
                "PROVIDER_CIRCUIT_THRESHOLD",
                defaults.provider_circuit_threshold,
            )?,
            breaker: defaults.breaker,
        };

        if config.hard_limit_secs < config.soft_limit_secs {
            return Err(ConfigError::Invalid {
                key: "HARD_LIMIT_SECS".to_string(),
                reason: format!(
                    "must be >= SOFT_LIMIT_SECS ({} < {})",
                    config.hard_limit_secs, config.soft_limit_secs
                ),
            });
        }
        if config.retry_crit_depth < config.retry_warn_depth {
            return Err(ConfigError::Invalid {
                key: "RETRY_CRIT_DEPTH".to_string(),
                reason: format!(
                    "must be >= RETRY_WARN_DEPTH ({} < {})",
                    config.retry_crit_depth, config.retry_warn_depth
                ),
            });
        }

        Ok(config)
    }
}
