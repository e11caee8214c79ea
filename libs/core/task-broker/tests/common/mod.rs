//! Shared fixture for broker integration tests.
//!
//! Spins up a throwaway store container and wires the broker components
//! against it with test-friendly timings.

use std::sync::Arc;
use std::time::Duration;

use store::StoreClient;
use task_broker::{
    BrokerConfig, DlqManager, EventPublisher, HandlerRegistry, Ingress, NewTask, RateLimiter,
    RetryRouter, TaskRepository, TaskState,
};
use test_utils::TestRedis;

pub struct TestBroker {
    // Held so the container outlives the test
    pub redis: TestRedis,
    pub store: StoreClient,
    pub repo: TaskRepository,
    pub events: EventPublisher,
    pub config: Arc<BrokerConfig>,
}

impl TestBroker {
    pub async fn new() -> Self {
        let redis = TestRedis::new().await;
        let store = redis.store();

        let config = Arc::new(
            BrokerConfig::new()
                .with_worker_id("worker-test")
                .with_concurrency(2)
                .with_pop_timeout_secs(1)
                .with_scheduler_tick_ms(100)
                .with_token_wait_secs(5)
                .with_heartbeat(1, 3),
        );

        let repo = TaskRepository::new(store.clone());
        let events = EventPublisher::new(store.clone());

        Self {
            redis,
            store,
            repo,
            events,
            config,
        }
    }

    /// A generously sized limiter so rate limiting never interferes with
    /// unrelated tests.
    pub fn open_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.store.clone(), 1_000.0, 1_000.0)
    }

    pub fn router(&self) -> RetryRouter {
        RetryRouter::new(
            self.repo.clone(),
            self.events.clone(),
            Duration::from_secs(self.config.max_task_age_secs),
            self.config.retry_warn_depth,
            self.config.retry_crit_depth,
        )
    }

    pub fn ingress(&self, registry: Arc<HandlerRegistry>) -> Ingress {
        Ingress::new(
            self.repo.clone(),
            DlqManager::new(self.store.clone(), self.repo.clone()),
            self.events.clone(),
            registry,
            Arc::clone(&self.config),
        )
    }

    pub fn new_task(&self, task_id: &str, task_type: &str, max_retries: u32) -> NewTask {
        NewTask {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            payload: format!("payload-{}", task_id),
            max_retries,
        }
    }

    /// Poll until the task reaches the expected state or the deadline hits.
    pub async fn wait_for_state(
        &self,
        task_id: &str,
        expected: TaskState,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(record)) = self.repo.try_fetch(task_id).await {
                if record.state == expected {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
