//! Integration tests for heartbeats, the breaker mirror, and the provider
//! state cache.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;
use common::TestBroker;
use task_broker::{
    BreakerConfig, CircuitBreaker, FailureKind, HeartbeatWriter, ProbeFailure, ProbeReport,
    ProviderCondition, ProviderProbe, ProviderStateCache, keys, liveness_summary,
};

#[tokio::test]
async fn test_heartbeat_round_trip_and_summary() {
    let broker = TestBroker::new().await;
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let in_flight = Arc::new(AtomicUsize::new(3));

    let writer = HeartbeatWriter::new(
        broker.store.clone(),
        "worker-a",
        10,
        3,
        Arc::clone(&breaker),
        Arc::clone(&in_flight),
    );
    writer.beat().await.unwrap();

    let summary = liveness_summary(&broker.store, 10, 3).await.unwrap();
    assert_eq!(summary.overall_status, "healthy");
    assert_eq!(summary.workers.len(), 1);

    let worker = &summary.workers[0];
    assert_eq!(worker.worker_id, "worker-a");
    assert_eq!(worker.in_flight, 3);
    assert_eq!(worker.breaker_state, "CLOSED");
    assert!(worker.age_secs <= 1);
}

#[tokio::test]
async fn test_heartbeat_mirrors_breaker_state() {
    let broker = TestBroker::new().await;
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    breaker.force_open();

    let writer = HeartbeatWriter::new(
        broker.store.clone(),
        "worker-b",
        10,
        3,
        Arc::clone(&breaker),
        Arc::new(AtomicUsize::new(0)),
    );
    writer.beat().await.unwrap();

    let mirror = broker
        .store
        .hash_get_all(&keys::circuit_breaker("worker-b"))
        .await
        .unwrap();
    assert_eq!(mirror.get("state").map(String::as_str), Some("OPEN"));
    assert!(!mirror.get("opened_at").unwrap().is_empty());

    let heartbeat = broker
        .store
        .hash_get_all(&keys::worker_heartbeat("worker-b"))
        .await
        .unwrap();
    assert_eq!(heartbeat.get("breaker_state").map(String::as_str), Some("OPEN"));
}

#[tokio::test]
async fn test_summary_without_workers() {
    let broker = TestBroker::new().await;
    let summary = liveness_summary(&broker.store, 10, 3).await.unwrap();
    assert!(summary.workers.is_empty());
    assert_eq!(summary.overall_status, "no_workers");
}

#[tokio::test]
async fn test_provider_failure_reports_open_circuit_flag() {
    let broker = TestBroker::new().await;
    let cache = ProviderStateCache::new(broker.store.clone(), Duration::from_secs(60), 3)
        .with_circuit_open_duration(Duration::from_secs(60));

    cache
        .report_failure(FailureKind::ServiceUnavailable, "502 from provider", Some(502))
        .await
        .unwrap();
    cache
        .report_failure(FailureKind::Timeout, "deadline exceeded", None)
        .await
        .unwrap();

    let state = cache.read().await.unwrap();
    assert_eq!(state.state, ProviderCondition::Error);
    assert_eq!(state.consecutive_failures, 2);
    assert!(!state.circuit_open);

    // Third consecutive failure reaches the threshold
    cache
        .report_failure(FailureKind::NetworkError, "connection refused", None)
        .await
        .unwrap();
    let state = cache.read().await.unwrap();
    assert!(state.circuit_open);

    // Success resets the streak and clears the flag
    cache.report_success().await.unwrap();
    let state = cache.read().await.unwrap();
    assert_eq!(state.state, ProviderCondition::Active);
    assert_eq!(state.consecutive_failures, 0);
    assert!(!state.circuit_open);
}

#[tokio::test]
async fn test_provider_failure_kinds_map_to_conditions() {
    let broker = TestBroker::new().await;
    let cache = ProviderStateCache::new(broker.store.clone(), Duration::from_secs(60), 10);

    cache
        .report_failure(FailureKind::ApiKeyInvalid, "key rejected", Some(401))
        .await
        .unwrap();
    assert_eq!(
        cache.read().await.unwrap().state,
        ProviderCondition::AuthInvalid
    );

    cache
        .report_failure(FailureKind::CreditsExhausted, "payment required", Some(402))
        .await
        .unwrap();
    assert_eq!(
        cache.read().await.unwrap().state,
        ProviderCondition::CreditsExhausted
    );

    // Daily per-kind counters accumulate
    let metrics_key = keys::provider_metrics(chrono::Utc::now().date_naive());
    let daily = broker.store.hash_get_all(&metrics_key).await.unwrap();
    assert_eq!(daily.get("api_key_invalid").map(String::as_str), Some("1"));
    assert_eq!(
        daily.get("credits_exhausted").map(String::as_str),
        Some("1")
    );
}

struct HealthyProbe;

#[async_trait]
impl ProviderProbe for HealthyProbe {
    async fn check(&self) -> Result<ProbeReport, ProbeFailure> {
        Ok(ProbeReport {
            balance_hint: Some("42.00".to_string()),
            usage_hint: None,
        })
    }
}

struct FailingProbe;

#[async_trait]
impl ProviderProbe for FailingProbe {
    async fn check(&self) -> Result<ProbeReport, ProbeFailure> {
        Err(ProbeFailure {
            kind: FailureKind::ServiceUnavailable,
            message: "503 from provider".to_string(),
        })
    }
}

#[tokio::test]
async fn test_get_state_refreshes_through_probe() {
    let broker = TestBroker::new().await;
    let cache = ProviderStateCache::new(broker.store.clone(), Duration::from_secs(60), 5);

    // Empty cache is stale, so the probe runs
    let state = cache.get_state(false, &HealthyProbe).await.unwrap();
    assert_eq!(state.state, ProviderCondition::Active);
    assert_eq!(state.balance_hint.as_deref(), Some("42.00"));
    assert!(!state.served_stale);

    // Within the freshness window the cached value is served; a failing
    // probe must not run
    let state = cache.get_state(false, &FailingProbe).await.unwrap();
    assert_eq!(state.state, ProviderCondition::Active);

    // Forcing the refresh runs the failing probe
    let state = cache.get_state(true, &FailingProbe).await.unwrap();
    assert_eq!(state.state, ProviderCondition::Error);
    assert_eq!(state.consecutive_failures, 1);
}

#[tokio::test]
async fn test_get_state_serves_stale_while_circuit_open() {
    let broker = TestBroker::new().await;
    let cache = ProviderStateCache::new(broker.store.clone(), Duration::from_secs(60), 1)
        .with_circuit_open_duration(Duration::from_secs(60));

    // One failure trips the threshold-1 circuit flag
    cache
        .report_failure(FailureKind::ServiceUnavailable, "503", None)
        .await
        .unwrap();

    let state = cache.get_state(true, &HealthyProbe).await.unwrap();
    assert!(state.circuit_open);
    assert!(state.served_stale);
    // The healthy probe did not run while the flag was open
    assert_eq!(state.state, ProviderCondition::Error);
}
