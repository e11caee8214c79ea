//! Task Broker - coordination plane for asynchronous task processing
//!
//! A broker between request-originating clients and rate-limited external
//! providers. Clients submit opaque tasks; workers dispatch them through a
//! lifecycle state machine with coordinated failure handling:
//!
//! - Dual-queue admission (primary for new work, retry for requeued work)
//!   with adaptive back-pressure between the two
//! - Atomic multi-key state transitions via server-side scripts, so queue
//!   membership and per-state counters never drift from the records
//! - Class-aware retry scheduling with a time-indexed set and a promotion
//!   loop, plus a dead letter queue for terminal failures
//! - A per-worker circuit breaker and a store-wide token-bucket rate
//!   limiter gating provider calls
//! - A centralized provider state cache shared by the whole fleet
//! - Real-time lifecycle events on a pub/sub channel with in-process
//!   fan-out
//! - TTL'd worker heartbeats for liveness monitoring
//!
//! # Architecture
//!
//! ```text
//! Ingress (submit/query/retry/delete)
//!   ↓ task record + primary queue
//! Dispatcher xW per worker (adaptive pop, CAS PENDING→ACTIVE)
//!   ↓ breaker gate → token gate → handler (soft/hard deadlines)
//! Router (classify → COMPLETED | SCHEDULED | DLQ)
//!   ↑ Scheduler promotes due retries back to the retry queue
//! Event bus publishes every transition; heartbeats track liveness
//! ```
//!
//! Delivery is at-least-once; handlers are required to be idempotent per
//! task id. There is no global execution order across tasks.

pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod events;
pub mod handler;
pub mod health;
pub mod heartbeat;
pub mod ingress;
pub mod keys;
pub mod metrics;
pub mod provider;
pub mod ratelimit;
pub mod repository;
pub mod router;
pub mod scheduler;
pub mod scripts;
pub mod task;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::BrokerConfig;
pub use dispatcher::{Dispatcher, adaptive_retry_ratio};
pub use dlq::{DlqManager, DlqStats};
pub use error::{
    BrokerError, BrokerResult, ErrorClass, HandlerError, PermanentKind, TransientKind,
};
pub use events::{ControlCommand, EventFanout, EventKind, EventPublisher, QueueEvent};
pub use handler::{HandlerContext, HandlerRegistry, ProviderGateway, TaskHandler};
pub use health::{HealthState, full_admin_router, health_router};
pub use heartbeat::{HeartbeatWriter, LivenessStatus, LivenessSummary, liveness_summary};
pub use ingress::{Ingress, ListFilter, Page, QueueStatus, SortOrder};
pub use provider::{
    FailureKind, ProbeFailure, ProbeReport, ProviderCondition, ProviderProbe, ProviderState,
    ProviderStateCache,
};
pub use ratelimit::{Acquire, RateLimiter};
pub use repository::{
    OrphanOutcome, QueueDepths, QueueOp, QueueSnapshot, RetryOutcome, StateCounts, TaskRepository,
};
pub use router::{RetryRouter, RouteOutcome, classify};
pub use scheduler::Scheduler;
pub use task::{NewTask, TaskRecord, TaskState};
