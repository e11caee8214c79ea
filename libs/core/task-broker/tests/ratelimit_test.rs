//! Integration tests for the distributed token bucket.

mod common;

use std::time::Duration;

use common::TestBroker;
use task_broker::{BrokerError, RateLimiter};

#[tokio::test]
async fn test_grants_up_to_capacity() {
    let broker = TestBroker::new().await;
    // Capacity 5, negligible refill within the test window
    let limiter = RateLimiter::new(broker.store.clone(), 5.0, 0.001);

    for _ in 0..5 {
        let attempt = limiter.try_acquire(1).await.unwrap();
        assert!(attempt.granted);
    }

    let denied = limiter.try_acquire(1).await.unwrap();
    assert!(!denied.granted);
    assert!(denied.wait > Duration::ZERO);
    assert!(denied.tokens < 1.0);
}

#[tokio::test]
async fn test_tokens_never_exceed_capacity() {
    let broker = TestBroker::new().await;
    let limiter = RateLimiter::new(broker.store.clone(), 3.0, 100.0);

    // Drain, then wait long enough that naive refill would overshoot
    for _ in 0..3 {
        assert!(limiter.try_acquire(1).await.unwrap().granted);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let attempt = limiter.try_acquire(1).await.unwrap();
    assert!(attempt.granted);
    // Balance after the grant stays within [0, capacity - requested]
    assert!(attempt.tokens <= 2.0 + f64::EPSILON);

    let bucket = limiter.bucket().await.unwrap().unwrap();
    assert!(bucket.tokens <= bucket.capacity);
    assert!(bucket.tokens >= 0.0);
}

#[tokio::test]
async fn test_zero_timeout_empty_bucket_fails_immediately() {
    let broker = TestBroker::new().await;
    let limiter = RateLimiter::new(broker.store.clone(), 1.0, 0.001);

    assert!(limiter.try_acquire(1).await.unwrap().granted);

    let started = std::time::Instant::now();
    let err = limiter.acquire(1, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, BrokerError::RateLimitTimeout(_)));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_acquire_waits_for_refill() {
    let broker = TestBroker::new().await;
    // 2 tokens, 10/sec refill: a third acquire succeeds after ~100ms
    let limiter = RateLimiter::new(broker.store.clone(), 2.0, 10.0);

    assert!(limiter.try_acquire(1).await.unwrap().granted);
    assert!(limiter.try_acquire(1).await.unwrap().granted);

    let started = std::time::Instant::now();
    limiter.acquire(1, Duration::from_secs(5)).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "got {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "got {:?}", elapsed);
}

#[tokio::test]
async fn test_update_config_clips_tokens() {
    let broker = TestBroker::new().await;
    let limiter = RateLimiter::new(broker.store.clone(), 100.0, 0.001);

    // Materialize the bucket at capacity 100
    assert!(limiter.try_acquire(1).await.unwrap().granted);

    // Provider advertises a tighter limit: 5 requests / 10 seconds
    limiter.update_config(5, 10).await.unwrap();

    let bucket = limiter.bucket().await.unwrap().unwrap();
    assert_eq!(bucket.capacity, 5.0);
    assert!(bucket.tokens <= 5.0);
    assert!((bucket.refill_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_config_survives_for_fresh_buckets() {
    let broker = TestBroker::new().await;
    let limiter = RateLimiter::new(broker.store.clone(), 100.0, 100.0);

    limiter.update_config(2, 1).await.unwrap();

    // Drop the bucket; the next acquire must rebuild it from the config,
    // not from the compiled-in defaults
    broker
        .store
        .delete_key(task_broker::keys::RATE_LIMIT_BUCKET)
        .await
        .unwrap();

    assert!(limiter.try_acquire(1).await.unwrap().granted);
    let bucket = limiter.bucket().await.unwrap().unwrap();
    assert_eq!(bucket.capacity, 2.0);
}

#[tokio::test]
async fn test_update_config_rejects_zero() {
    let broker = TestBroker::new().await;
    let limiter = broker.open_limiter();

    assert!(matches!(
        limiter.update_config(0, 10).await.unwrap_err(),
        BrokerError::Validation(_)
    ));
    assert!(matches!(
        limiter.update_config(10, 0).await.unwrap_err(),
        BrokerError::Validation(_)
    ));
}

#[tokio::test]
async fn test_shared_bucket_across_clients() {
    let broker = TestBroker::new().await;
    // Two limiter instances over the same store share one bucket
    let limiter_a = RateLimiter::new(broker.store.clone(), 2.0, 0.001);
    let limiter_b = RateLimiter::new(broker.store.clone(), 2.0, 0.001);

    assert!(limiter_a.try_acquire(1).await.unwrap().granted);
    assert!(limiter_b.try_acquire(1).await.unwrap().granted);
    assert!(!limiter_a.try_acquire(1).await.unwrap().granted);
    assert!(!limiter_b.try_acquire(1).await.unwrap().granted);
}
