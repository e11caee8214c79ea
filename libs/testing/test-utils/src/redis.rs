//! Throwaway coordination store for broker tests.
//!
//! Boots a Redis container and hands out a connected [`StoreClient`], so
//! integration tests exercise the same adapter surface the workers use
//! instead of a raw driver connection.

use store::{StoreClient, StoreConfig};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// One isolated store per test.
///
/// The container stops and is removed when this struct drops, so every
/// test starts from empty queues and zeroed counters.
///
/// # Example
///
/// ```rust,ignore
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let store = redis.store();
///
/// store.list_push_left("tasks:pending:primary", "t1").await.unwrap();
/// assert_eq!(store.list_len("tasks:pending:primary").await.unwrap(), 1);
/// # }
/// ```
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    store: StoreClient,
    url: String,
}

impl TestRedis {
    /// Start a Redis 8 Alpine container and connect the store adapter.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");
        let url = format!("redis://127.0.0.1:{}", port);

        let store = store::connect(StoreConfig::new(url.clone()))
            .await
            .expect("Failed to connect store adapter to test Redis");

        tracing::info!(port, "Test store ready (Redis 8-alpine)");

        Self {
            container,
            store,
            url,
        }
    }

    /// Store client bound to this container (cheap to clone).
    pub fn store(&self) -> StoreClient {
        self.store.clone()
    }

    /// Raw connection string, for code paths that build their own client.
    pub fn connection_string(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_fifo_semantics() {
        let redis = TestRedis::new().await;
        let store = redis.store();

        // Left-push, right-pop: submission order is dispatch order
        store.list_push_left("queue", "t1").await.unwrap();
        store.list_push_left("queue", "t2").await.unwrap();
        store.list_push_left("queue", "t3").await.unwrap();

        assert_eq!(store.list_len("queue").await.unwrap(), 3);
        assert_eq!(store.list_pop_right("queue").await.unwrap().as_deref(), Some("t1"));
        assert_eq!(store.list_pop_right("queue").await.unwrap().as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_task_record_hash_round_trip() {
        let redis = TestRedis::new().await;
        let store = redis.store();

        store
            .hash_set(
                "task:abc",
                &[("task_id", "abc"), ("state", "PENDING"), ("retry_count", "0")],
            )
            .await
            .unwrap();

        let fields = store.hash_get_all("task:abc").await.unwrap();
        assert_eq!(fields.get("state").map(String::as_str), Some("PENDING"));
        assert_eq!(
            store.hash_get("task:abc", "retry_count").await.unwrap().as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn test_due_time_ordering_with_lexicographic_ties() {
        let redis = TestRedis::new().await;
        let store = redis.store();

        store.zset_add("scheduled", 200.0, "b-later").await.unwrap();
        store.zset_add("scheduled", 100.0, "z-tie").await.unwrap();
        store.zset_add("scheduled", 100.0, "a-tie").await.unwrap();

        // Earliest due first; equal scores come back in member order
        let due = store.zset_range_by_score("scheduled", 300.0, 10).await.unwrap();
        assert_eq!(due, vec!["a-tie", "z-tie", "b-later"]);
    }

    #[tokio::test]
    async fn test_state_counters_move() {
        let redis = TestRedis::new().await;
        let store = redis.store();

        let key = "metrics:tasks:state:pending";
        assert_eq!(store.counter_incr(key, 1).await.unwrap(), 1);
        assert_eq!(store.counter_incr(key, -1).await.unwrap(), 0);
        assert_eq!(store.counter_get(key).await.unwrap(), 0);
    }
}
