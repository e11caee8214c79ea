//! Worker liveness.
//!
//! Each worker writes a TTL'd heartbeat record on a fixed period, carrying
//! its pid, in-flight count, and breaker state; the TTL (3x the period by
//! default) makes crashed workers disappear on their own. The aggregation
//! side scans heartbeats and classifies each worker by the age of its last
//! write.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use store::StoreClient;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::error::BrokerResult;
use crate::keys;

/// Liveness classification by heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    /// Age within one period.
    Healthy,
    /// Age within the TTL window but past one period.
    Stale,
    /// No heartbeat inside the TTL window.
    NoHeartbeat,
}

impl LivenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Stale => "stale",
            Self::NoHeartbeat => "no_heartbeat",
        }
    }
}

/// Classify a heartbeat age against the configured period.
pub fn classify_age(age_secs: i64, period_secs: u64, ttl_factor: u32) -> LivenessStatus {
    if age_secs < 0 {
        // Clock skew between writer and reader; treat as fresh
        return LivenessStatus::Healthy;
    }
    let age = age_secs as u64;
    if age <= period_secs {
        LivenessStatus::Healthy
    } else if age <= period_secs * ttl_factor as u64 {
        LivenessStatus::Stale
    } else {
        LivenessStatus::NoHeartbeat
    }
}

/// One worker's view in the liveness summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub worker_id: String,
    pub pid: u32,
    pub in_flight: usize,
    pub breaker_state: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub age_secs: i64,
    pub status: LivenessStatus,
}

/// Aggregate liveness over all workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessSummary {
    pub workers: Vec<WorkerHealth>,
    pub overall_status: String,
}

/// Periodic heartbeat writer for one worker process.
#[derive(Clone)]
pub struct HeartbeatWriter {
    store: StoreClient,
    worker_id: String,
    period_secs: u64,
    ttl_factor: u32,
    breaker: Arc<CircuitBreaker>,
    in_flight: Arc<AtomicUsize>,
}

impl HeartbeatWriter {
    pub fn new(
        store: StoreClient,
        worker_id: impl Into<String>,
        period_secs: u64,
        ttl_factor: u32,
        breaker: Arc<CircuitBreaker>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            period_secs,
            ttl_factor: ttl_factor.max(1),
            breaker,
            in_flight,
        }
    }

    /// Emit heartbeats until shutdown, then remove the record.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            period_secs = self.period_secs,
            "Heartbeat writer started"
        );

        let period = std::time::Duration::from_secs(self.period_secs);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.beat().await {
                warn!(error = %e, "Heartbeat write failed");
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(period) => {}
            }
        }

        // Graceful exit: drop the record instead of waiting out the TTL
        let _ = self
            .store
            .delete_key(&keys::worker_heartbeat(&self.worker_id))
            .await;
        info!("Heartbeat writer stopped");
    }

    /// Write one heartbeat and mirror the breaker state.
    pub async fn beat(&self) -> BrokerResult<()> {
        let snapshot = self.breaker.snapshot();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let pid = std::process::id().to_string();
        let in_flight = self.in_flight.load(Ordering::SeqCst).to_string();

        let heartbeat_key = keys::worker_heartbeat(&self.worker_id);
        self.store
            .hash_set(
                &heartbeat_key,
                &[
                    ("worker_id", self.worker_id.as_str()),
                    ("pid", pid.as_str()),
                    ("in_flight", in_flight.as_str()),
                    ("breaker_state", snapshot.state.as_str()),
                    ("last_seen", now.as_str()),
                ],
            )
            .await?;
        self.store
            .expire(&heartbeat_key, self.period_secs * self.ttl_factor as u64)
            .await?;

        // Observers read the breaker mirror without talking to the worker
        let opened_at = snapshot
            .opened_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true))
            .unwrap_or_default();
        let failure_count = snapshot.failure_count.to_string();
        let success_count = snapshot.success_count.to_string();
        self.store
            .hash_set(
                &keys::circuit_breaker(&self.worker_id),
                &[
                    ("state", snapshot.state.as_str()),
                    ("failure_count", failure_count.as_str()),
                    ("success_count", success_count.as_str()),
                    ("opened_at", opened_at.as_str()),
                ],
            )
            .await?;

        debug!(worker_id = %self.worker_id, "Heartbeat written");
        Ok(())
    }
}

/// Aggregate all worker heartbeats into a liveness summary.
pub async fn liveness_summary(
    store: &StoreClient,
    period_secs: u64,
    ttl_factor: u32,
) -> BrokerResult<LivenessSummary> {
    let heartbeat_keys = store.scan_keys("worker:heartbeat:*").await?;
    let now = Utc::now();
    let mut workers = Vec::with_capacity(heartbeat_keys.len());

    for key in heartbeat_keys {
        let fields = store.hash_get_all(&key).await?;
        if fields.is_empty() {
            continue; // expired between scan and read
        }
        workers.push(worker_health(&key, &fields, now, period_secs, ttl_factor));
    }

    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    let overall_status = if workers.is_empty() {
        "no_workers".to_string()
    } else if workers
        .iter()
        .all(|worker| worker.status == LivenessStatus::Healthy)
    {
        "healthy".to_string()
    } else if workers
        .iter()
        .any(|worker| worker.status != LivenessStatus::NoHeartbeat)
    {
        "degraded".to_string()
    } else {
        "unhealthy".to_string()
    };

    Ok(LivenessSummary {
        workers,
        overall_status,
    })
}

fn worker_health(
    key: &str,
    fields: &HashMap<String, String>,
    now: DateTime<Utc>,
    period_secs: u64,
    ttl_factor: u32,
) -> WorkerHealth {
    let worker_id = fields
        .get("worker_id")
        .cloned()
        .unwrap_or_else(|| key.trim_start_matches("worker:heartbeat:").to_string());
    let last_seen: Option<DateTime<Utc>> =
        fields.get("last_seen").and_then(|raw| raw.parse().ok());
    let age_secs = last_seen
        .map(|at| (now - at).num_seconds())
        .unwrap_or(i64::MAX);

    WorkerHealth {
        worker_id,
        pid: fields
            .get("pid")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        in_flight: fields
            .get("in_flight")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        breaker_state: fields
            .get("breaker_state")
            .cloned()
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        last_seen,
        age_secs: if age_secs == i64::MAX { -1 } else { age_secs },
        status: if last_seen.is_none() {
            LivenessStatus::NoHeartbeat
        } else {
            classify_age(age_secs, period_secs, ttl_factor)
        },
    }
}
