//! Store adapter for the shared coordination state.
//!
//! Every piece of shared broker state (task records, queues, counters,
//! rate-limit bucket, provider cache, heartbeats, the event channel) lives
//! in one Redis-compatible key-value store. This crate wraps the raw client
//! in typed operations:
//!
//! - Hashes for records, lists for FIFO queues, sorted sets for
//!   time-indexed scheduling, plain integer counters
//! - Server-side Lua scripts for atomic multi-key mutations
//! - Pipelines for batched snapshot reads
//! - Pub/sub for the event channel
//! - Dedicated connections for long-blocking pops and subscriptions, so a
//!   server-side `BRPOP` can never stall multiplexed traffic
//!
//! Connection recovery is delegated to `ConnectionManager` (automatic
//! reconnect); startup uses [`connect_with_retry`] with exponential backoff
//! and jitter. Only connection-class failures are retried; logical replies
//! (missing keys, script verdicts) propagate unmodified.

mod client;
mod config;
mod connector;
mod error;
mod retry;

pub use client::StoreClient;
pub use config::StoreConfig;
pub use connector::{connect, connect_from_config, connect_with_retry};
pub use error::{StoreError, StoreResult};
pub use retry::{RetryConfig, retry_on_connection};

// Re-export driver types the broker layer needs for scripts and pub/sub
pub use redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
pub use redis::{AsyncCommands, Script};
