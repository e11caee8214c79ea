//! Typed store operations.
//!
//! `StoreClient` wraps the raw driver in the operation vocabulary the broker
//! uses: hash records, FIFO list queues, the time-indexed sorted set, state
//! counters, pub/sub, scripts, and pipelines.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
use redis::{Client, Script};
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// Client over the shared key-value store.
///
/// Cloning is cheap: the multiplexed `ConnectionManager` is shared, and the
/// inner `Client` is used to mint dedicated connections for operations that
/// block server-side (`BRPOP`, `SUBSCRIBE`).
#[derive(Clone)]
pub struct StoreClient {
    client: Client,
    manager: ConnectionManager,
    config: StoreConfig,
}

impl StoreClient {
    pub(crate) fn new(client: Client, manager: ConnectionManager, config: StoreConfig) -> Self {
        Self {
            client,
            manager,
            config,
        }
    }

    /// Get a cloned multiplexed connection manager for short operations.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Ping the store; returns the round-trip time.
    ///
    /// Backs the readiness probe and the periodic pool health check. A
    /// reply other than PONG is a logical failure, not a connection error,
    /// and is never retried.
    pub async fn ping(&self) -> StoreResult<Duration> {
        let started = std::time::Instant::now();
        let mut conn = self.manager();

        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(StoreError::Redis)?;

        if reply != "PONG" {
            return Err(StoreError::HealthCheckFailed(format!(
                "store PING returned unexpected response: {}",
                reply
            )));
        }

        Ok(started.elapsed())
    }

    /// Open a dedicated connection for long-blocking pops.
    ///
    /// Each consumer loop holds its own; a `BRPOP` blocks the connection
    /// server-side, so these must never share the multiplexed manager.
    pub async fn dedicated_connection(&self) -> StoreResult<MultiplexedConnection> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::Redis)?;
        Ok(conn)
    }

    // --- hashes ---

    /// Set multiple fields on a hash.
    pub async fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> StoreResult<()> {
        let mut conn = self.manager();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Get a single hash field.
    pub async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    /// Get all fields of a hash. Empty map if the key is absent.
    pub async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.manager();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    /// Increment an integer hash field.
    pub async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.manager();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    // --- lists (FIFO queues: left-push, right-pop) ---

    /// Push a value onto the head of a list.
    pub async fn list_push_left(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.manager();
        let len: usize = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Push a value onto the tail of a list (jumps the FIFO order).
    pub async fn list_push_right(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.manager();
        let len: usize = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Blocking right-pop across several lists, earlier keys preferred.
    ///
    /// Returns `None` when the bounded timeout elapses without a value.
    /// Must be called on a dedicated connection from
    /// [`StoreClient::dedicated_connection`].
    pub async fn list_pop_blocking_right(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &[&str],
        timeout: Duration,
    ) -> StoreResult<Option<(String, String)>> {
        let mut cmd = redis::cmd("BRPOP");
        for key in keys {
            cmd.arg(*key);
        }
        cmd.arg(timeout.as_secs_f64());

        let reply: Option<(String, String)> = cmd.query_async(conn).await?;
        Ok(reply)
    }

    /// Non-blocking right-pop.
    pub async fn list_pop_right(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager();
        let value: Option<String> = redis::cmd("RPOP").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    /// List length (0 for a missing key).
    pub async fn list_len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.manager();
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    /// Remove all occurrences of a value from a list; returns removed count.
    pub async fn list_remove(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut conn = self.manager();
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    /// Position of a value in a list, if present.
    pub async fn list_position(&self, key: &str, value: &str) -> StoreResult<Option<usize>> {
        let mut conn = self.manager();
        let pos: Option<usize> = redis::cmd("LPOS")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(pos)
    }

    /// Range of list entries (inclusive indices, redis semantics).
    pub async fn list_range(&self, key: &str, start: isize, stop: isize) -> StoreResult<Vec<String>> {
        let mut conn = self.manager();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    // --- sorted sets (time-indexed scheduling) ---

    /// Add a member with a score.
    pub async fn zset_add(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let mut conn = self.manager();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Members with score <= max, earliest first; equal scores come back in
    /// lexicographic member order.
    pub async fn zset_range_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.manager();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    /// Remove a member; returns whether it was present.
    pub async fn zset_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.manager();
        let removed: usize = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    /// Cardinality of a sorted set.
    pub async fn zset_len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.manager();
        let len: usize = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    // --- sets (per-worker in-flight tracking) ---

    /// Add a member to a set.
    pub async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.manager();
        let added: usize = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    /// Remove a member from a set.
    pub async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.manager();
        let removed: usize = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    /// Cardinality of a set.
    pub async fn set_len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.manager();
        let len: usize = redis::cmd("SCARD").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    // --- counters / plain keys ---

    /// Increment an integer counter by delta (may be negative).
    pub async fn counter_incr(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.manager();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    /// Read an integer counter (0 for a missing key).
    pub async fn counter_get(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.manager();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    /// `SET key value NX PX ttl_ms` - short-lived mutual-exclusion lock.
    ///
    /// Returns true if the lock was acquired.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut conn = self.manager();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Delete a key; returns whether it existed.
    pub async fn delete_key(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager();
        let deleted: usize = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    /// Set a key's TTL in seconds.
    pub async fn expire(&self, key: &str, secs: u64) -> StoreResult<bool> {
        let mut conn = self.manager();
        let set: usize = redis::cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(set > 0)
    }

    /// Collect all keys matching a pattern via cursor scan.
    ///
    /// Admin-scale only; never on a hot path.
    pub async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.manager();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    // --- pub/sub ---

    /// Publish a payload on a channel. Returns the receiver count.
    pub async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut conn = self.manager();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    /// Subscribe on a dedicated pub/sub connection.
    pub async fn subscribe(&self, channel: &str) -> StoreResult<PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(StoreError::Redis)?;
        pubsub.subscribe(channel).await.map_err(StoreError::Redis)?;
        debug!(channel = %channel, "Subscribed to channel");
        Ok(pubsub)
    }

    // --- scripts ---

    /// Run a server-side script with the given keys and args.
    ///
    /// The whole script evaluates atomically on the store; this is the only
    /// mechanism allowed to mutate multiple keys that share an invariant.
    pub async fn run_script<T: redis::FromRedisValue>(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[&str],
    ) -> StoreResult<T> {
        let mut conn = self.manager();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        let value: T = invocation.invoke_async(&mut conn).await?;
        Ok(value)
    }
}
