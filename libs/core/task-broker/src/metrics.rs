//! Metrics for broker observability.
//!
//! Prometheus-compatible metrics over the `metrics` facade:
//!
//! - `broker_tasks_processed_total` - counter of tasks by outcome
//! - `broker_handler_duration_seconds` - histogram of handler run time
//! - `broker_queue_depth` - gauge per queue
//! - `broker_errors_total` - counter of failures by class
//! - `broker_retries_total` - counter of scheduled retries by attempt
//! - `broker_in_flight_tasks` - gauge of concurrent executions

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::ErrorClass;
use crate::repository::QueueDepths;

/// Global Prometheus handle for metrics export
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency
pub mod names {
    pub const TASKS_PROCESSED: &str = "broker_tasks_processed_total";
    pub const HANDLER_DURATION: &str = "broker_handler_duration_seconds";
    pub const QUEUE_DEPTH: &str = "broker_queue_depth";
    pub const ERRORS: &str = "broker_errors_total";
    pub const RETRIES: &str = "broker_retries_total";
    pub const IN_FLIGHT: &str = "broker_in_flight_tasks";
}

/// Task outcome for metrics labeling
#[derive(Debug, Clone, Copy)]
pub enum TaskOutcome {
    Completed,
    Failed,
    DeadLettered,
    Requeued,
    Skipped,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Requeued => "requeued",
            Self::Skipped => "skipped",
        }
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// Call once at worker startup; returns the handle the `/metrics`
/// endpoint renders from.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle, if initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Record a processed task by outcome.
pub fn record_task_processed(outcome: TaskOutcome) {
    counter!(
        names::TASKS_PROCESSED,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record handler execution time.
pub fn record_handler_duration(task_type: &str, duration: Duration) {
    histogram!(
        names::HANDLER_DURATION,
        "task_type" => task_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the queue depth gauges from a snapshot.
pub fn set_queue_depths(depths: &QueueDepths) {
    gauge!(names::QUEUE_DEPTH, "queue" => "primary").set(depths.primary as f64);
    gauge!(names::QUEUE_DEPTH, "queue" => "retry").set(depths.retry as f64);
    gauge!(names::QUEUE_DEPTH, "queue" => "scheduled").set(depths.scheduled as f64);
    gauge!(names::QUEUE_DEPTH, "queue" => "dlq").set(depths.dlq as f64);
}

/// Record a task failure by class.
pub fn record_error(class: ErrorClass) {
    counter!(
        names::ERRORS,
        "class" => class.as_str()
    )
    .increment(1);
}

/// Record a scheduled retry attempt.
pub fn record_retry(attempt: u32) {
    counter!(
        names::RETRIES,
        "attempt" => attempt.to_string()
    )
    .increment(1);
}

/// Update the in-flight gauge.
pub fn set_in_flight_tasks(count: f64) {
    gauge!(names::IN_FLIGHT).set(count);
}

/// Helper struct for timing operations and recording metrics.
pub struct MetricsTimer {
    task_type: String,
    start: std::time::Instant,
}

impl MetricsTimer {
    /// Start a new timer for the given task type.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Stop the timer and record the duration.
    pub fn stop(self) {
        record_handler_duration(&self.task_type, self.start.elapsed());
    }

    /// Get elapsed time without stopping.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
