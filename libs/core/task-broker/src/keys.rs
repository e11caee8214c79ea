//! Persisted key layout.
//!
//! Key names are normative for compatibility with peer workers and the API
//! collaborator; nothing outside this module formats a store key.

use crate::task::TaskState;

/// FIFO list of new submissions (left-push, right-pop).
pub const PRIMARY_QUEUE: &str = "tasks:pending:primary";

/// FIFO list of tasks due for immediate retry.
pub const RETRY_QUEUE: &str = "tasks:pending:retry";

/// Sorted set of delayed retries, scored by due epoch seconds.
pub const SCHEDULED_SET: &str = "tasks:scheduled";

/// Terminal list of tasks that will not be retried.
pub const DLQ_LIST: &str = "dlq:tasks";

/// Rate limiter configuration hash {requests, interval, updated_at}.
pub const RATE_LIMIT_CONFIG: &str = "rate_limit:config";

/// Rate limiter bucket hash {tokens, capacity, refill_rate, last_refill}.
pub const RATE_LIMIT_BUCKET: &str = "rate_limit:bucket";

/// Provider state hash.
pub const PROVIDER_STATE: &str = "provider:state";

/// Short-lived lock collapsing concurrent provider refreshes.
pub const PROVIDER_STATE_LOCK: &str = "provider:state:lock";

/// Pub/sub channel for lifecycle events.
pub const EVENT_CHANNEL: &str = "queue-updates";

/// Pub/sub channel for worker control broadcasts (circuit reset/open).
pub const CONTROL_CHANNEL: &str = "queue-control";

/// Task record hash.
pub fn task(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// DLQ copy of a dead-lettered task record.
pub fn dlq_task(task_id: &str) -> String {
    format!("dlq:task:{}", task_id)
}

/// Per-state task counter.
pub fn state_counter(state: TaskState) -> String {
    format!("metrics:tasks:state:{}", state.as_str().to_lowercase())
}

/// Worker heartbeat hash (TTL'd).
pub fn worker_heartbeat(worker_id: &str) -> String {
    format!("worker:heartbeat:{}", worker_id)
}

/// Per-worker set of in-flight task ids.
pub fn worker_active_tasks(worker_id: &str) -> String {
    format!("worker:active_tasks:{}", worker_id)
}

/// Mirrored per-worker circuit breaker state.
pub fn circuit_breaker(worker_id: &str) -> String {
    format!("circuit_breaker:{}", worker_id)
}

/// Daily provider outcome counters.
pub fn provider_metrics(date: chrono::NaiveDate) -> String {
    format!("provider:metrics:{}", date.format("%Y-%m-%d"))
}
