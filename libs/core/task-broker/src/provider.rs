//! Centralized provider state cache.
//!
//! One store record characterizes the external provider's current
//! condition, updated by any worker after each upstream call and by a
//! periodic refresher. Reads are served from cache inside a freshness
//! window; refreshes collapse behind a short-lived lock so a fleet never
//! stampedes the provider's status endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use store::StoreClient;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::keys;

/// Provider condition, as persisted in the `state` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCondition {
    Active,
    RateLimited,
    CreditsExhausted,
    AuthInvalid,
    Error,
    Unknown,
}

impl ProviderCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::RateLimited => "rate_limited",
            Self::CreditsExhausted => "credits_exhausted",
            Self::AuthInvalid => "auth_invalid",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "active" => Self::Active,
            "rate_limited" => Self::RateLimited,
            "credits_exhausted" => Self::CreditsExhausted,
            "auth_invalid" => Self::AuthInvalid,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// Classification of a failed upstream call, reported by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ApiKeyInvalid,
    CreditsExhausted,
    RateLimited,
    ServiceUnavailable,
    Timeout,
    NetworkError,
    Unknown,
}

impl FailureKind {
    /// Metric label and daily counter field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKeyInvalid => "api_key_invalid",
            Self::CreditsExhausted => "credits_exhausted",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::Unknown => "unknown",
        }
    }

    /// The provider condition this failure kind implies.
    pub fn condition(&self) -> ProviderCondition {
        match self {
            Self::ApiKeyInvalid => ProviderCondition::AuthInvalid,
            Self::CreditsExhausted => ProviderCondition::CreditsExhausted,
            Self::RateLimited => ProviderCondition::RateLimited,
            Self::ServiceUnavailable | Self::Timeout | Self::NetworkError | Self::Unknown => {
                ProviderCondition::Error
            }
        }
    }
}

/// Cached provider state.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub state: ProviderCondition,
    pub message: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub balance_hint: Option<String>,
    pub usage_hint: Option<String>,
    /// True when the cached value was served because the provider circuit
    /// flag is open and no refresh was attempted.
    pub served_stale: bool,
}

impl ProviderState {
    fn unknown() -> Self {
        Self {
            state: ProviderCondition::Unknown,
            message: None,
            last_check: None,
            consecutive_failures: 0,
            circuit_open: false,
            balance_hint: None,
            usage_hint: None,
            served_stale: false,
        }
    }

    fn from_hash(fields: &HashMap<String, String>, now: DateTime<Utc>) -> Self {
        let optional = |name: &str| {
            fields
                .get(name)
                .filter(|value| !value.is_empty())
                .cloned()
        };

        let circuit_until = fields
            .get("circuit_open_until")
            .and_then(|raw| raw.parse::<i64>().ok());
        // The circuit flag self-clears after its unlock timeout
        let circuit_open = fields.get("circuit_open").map(String::as_str) == Some("true")
            && circuit_until.is_some_and(|until| now.timestamp() < until);

        Self {
            state: fields
                .get("state")
                .map(|raw| ProviderCondition::parse(raw))
                .unwrap_or(ProviderCondition::Unknown),
            message: optional("message"),
            last_check: fields
                .get("last_check")
                .and_then(|raw| raw.parse().ok()),
            consecutive_failures: fields
                .get("consecutive_failures")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            circuit_open,
            balance_hint: optional("balance_hint"),
            usage_hint: optional("usage_hint"),
            served_stale: false,
        }
    }
}

/// Outcome of a successful provider probe.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub balance_hint: Option<String>,
    pub usage_hint: Option<String>,
}

/// Outcome of a failed provider probe.
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Pluggable probe the refresher calls against the real provider.
#[async_trait]
pub trait ProviderProbe: Send + Sync {
    async fn check(&self) -> Result<ProbeReport, ProbeFailure>;
}

/// Cache over the shared provider state record.
#[derive(Clone)]
pub struct ProviderStateCache {
    store: StoreClient,
    fresh: Duration,
    circuit_threshold: u32,
    circuit_open_duration: Duration,
    lock_ttl_ms: u64,
}

impl ProviderStateCache {
    pub fn new(store: StoreClient, fresh: Duration, circuit_threshold: u32) -> Self {
        Self {
            store,
            fresh,
            circuit_threshold,
            circuit_open_duration: Duration::from_secs(300),
            lock_ttl_ms: 10_000,
        }
    }

    /// Override the circuit unlock-after timeout.
    pub fn with_circuit_open_duration(mut self, duration: Duration) -> Self {
        self.circuit_open_duration = duration;
        self
    }

    fn now_iso() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Read the cached record without refreshing.
    pub async fn read(&self) -> BrokerResult<ProviderState> {
        let fields = self.store.hash_get_all(keys::PROVIDER_STATE).await?;
        if fields.is_empty() {
            return Ok(ProviderState::unknown());
        }
        Ok(ProviderState::from_hash(&fields, Utc::now()))
    }

    /// Get the provider state, refreshing through `probe` when the cache is
    /// stale.
    ///
    /// - Fresh cache (within the freshness window) is returned as-is.
    /// - With the provider circuit flag open, the cached value is returned
    ///   flagged `served_stale` and no refresh happens.
    /// - Otherwise one worker wins the refresh lock and probes; losers get
    ///   the cached value.
    pub async fn get_state(
        &self,
        force_refresh: bool,
        probe: &dyn ProviderProbe,
    ) -> BrokerResult<ProviderState> {
        let now = Utc::now();
        let cached = self.read().await?;

        if cached.circuit_open {
            let mut state = cached;
            state.served_stale = true;
            return Ok(state);
        }

        let fresh = cached
            .last_check
            .is_some_and(|at| now - at < chrono::Duration::from_std(self.fresh).unwrap_or_default());
        if fresh && !force_refresh {
            return Ok(cached);
        }

        // Collapse concurrent refreshes behind a short lock
        let acquired = self
            .store
            .set_nx_px(keys::PROVIDER_STATE_LOCK, "refreshing", self.lock_ttl_ms)
            .await?;
        if !acquired {
            return Ok(cached);
        }

        let result = self.refresh(probe).await;
        let _ = self.store.delete_key(keys::PROVIDER_STATE_LOCK).await;
        result
    }

    async fn refresh(&self, probe: &dyn ProviderProbe) -> BrokerResult<ProviderState> {
        match probe.check().await {
            Ok(report) => {
                debug!("Provider probe succeeded");
                self.apply_success(report.balance_hint, report.usage_hint)
                    .await?;
            }
            Err(failure) => {
                warn!(kind = failure.kind.as_str(), error = %failure.message, "Provider probe failed");
                self.apply_failure(failure.kind, &failure.message).await?;
            }
        }
        self.read().await
    }

    /// Record a successful upstream call.
    pub async fn report_success(&self) -> BrokerResult<()> {
        self.apply_success(None, None).await
    }

    /// Record a failed upstream call with its classification.
    pub async fn report_failure(
        &self,
        kind: FailureKind,
        message: &str,
        status: Option<u16>,
    ) -> BrokerResult<()> {
        let message = match status {
            Some(code) => format!("{} (status {})", message, code),
            None => message.to_string(),
        };
        self.apply_failure(kind, &message).await
    }

    async fn apply_success(
        &self,
        balance_hint: Option<String>,
        usage_hint: Option<String>,
    ) -> BrokerResult<()> {
        let now = Self::now_iso();
        let mut fields: Vec<(&str, &str)> = vec![
            ("state", ProviderCondition::Active.as_str()),
            ("message", ""),
            ("last_check", now.as_str()),
            ("consecutive_failures", "0"),
            ("circuit_open", "false"),
            ("circuit_open_until", "0"),
        ];
        if let Some(balance) = balance_hint.as_deref() {
            fields.push(("balance_hint", balance));
        }
        if let Some(usage) = usage_hint.as_deref() {
            fields.push(("usage_hint", usage));
        }
        self.store.hash_set(keys::PROVIDER_STATE, &fields).await?;
        self.bump_daily("success").await;
        Ok(())
    }

    async fn apply_failure(&self, kind: FailureKind, message: &str) -> BrokerResult<()> {
        let failures = self
            .store
            .hash_incr(keys::PROVIDER_STATE, "consecutive_failures", 1)
            .await?;

        let now = Self::now_iso();
        let mut fields: Vec<(&str, String)> = vec![
            ("state", kind.condition().as_str().to_string()),
            ("message", message.to_string()),
            ("last_check", now),
        ];
        if failures >= self.circuit_threshold as i64 {
            let until = (Utc::now()
                + chrono::Duration::from_std(self.circuit_open_duration).unwrap_or_default())
            .timestamp();
            fields.push(("circuit_open", "true".to_string()));
            fields.push(("circuit_open_until", until.to_string()));
            warn!(
                consecutive_failures = failures,
                "Provider circuit flag opened"
            );
        }

        let borrowed: Vec<(&str, &str)> = fields
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        self.store
            .hash_set(keys::PROVIDER_STATE, &borrowed)
            .await?;
        self.bump_daily(kind.as_str()).await;
        Ok(())
    }

    /// Best-effort daily per-kind counter for metrics.
    async fn bump_daily(&self, field: &str) {
        let key = keys::provider_metrics(Utc::now().date_naive());
        if let Err(e) = self.store.hash_incr(&key, field, 1).await {
            debug!(error = %e, "Failed to bump daily provider counter");
        }
    }
}
