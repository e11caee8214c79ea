//! Failure classification and retry/DLQ routing.
//!
//! Classification applies the signal table first-match: explicit status
//! codes beat message heuristics, and the handler's own tag is the signal
//! for classes a status cannot express. The routing decision then either
//! requeues (circuit-open), schedules a delayed retry through FAILED, or
//! dead-letters the task.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use std::time::Duration;
use tracing::{info, warn};

use crate::dispatcher::adaptive_retry_ratio;
use crate::error::{BrokerResult, ErrorClass, HandlerError, PermanentKind, TransientKind};
use crate::events::EventPublisher;
use crate::repository::{QueueOp, TaskRepository};
use crate::task::{TaskRecord, TaskState};

/// Classify a handler failure. First matching signal wins.
pub fn classify(error: &HandlerError) -> ErrorClass {
    use ErrorClass::{Internal, Permanent, Transient};

    let message = error.message.to_lowercase();
    let tagged = |class: ErrorClass| error.class == class;

    // Permanent signals
    if tagged(Permanent(PermanentKind::Validation))
        || message.contains("schema")
        || message.contains("invalid payload")
        || message.contains("malformed")
    {
        return Permanent(PermanentKind::Validation);
    }
    if error.status == Some(401) || tagged(Permanent(PermanentKind::Auth)) {
        return Permanent(PermanentKind::Auth);
    }
    if matches!(error.status, Some(403) | Some(404)) || tagged(Permanent(PermanentKind::Forbidden))
    {
        return Permanent(PermanentKind::Forbidden);
    }
    if tagged(Permanent(PermanentKind::ContentPolicy))
        || message.contains("content policy")
        || message.contains("policy violation")
    {
        return Permanent(PermanentKind::ContentPolicy);
    }
    if tagged(Permanent(PermanentKind::Dependency))
        || message.contains("not installed")
        || message.contains("no such tool")
    {
        return Permanent(PermanentKind::Dependency);
    }

    // Transient signals
    if error.status == Some(429)
        || tagged(Transient(TransientKind::RateLimit))
        || message.contains("rate limit")
        || message.contains("too many requests")
    {
        return Transient(TransientKind::RateLimit);
    }
    if matches!(error.status, Some(code) if code >= 500)
        || tagged(Transient(TransientKind::ServiceUnavailable))
    {
        return Transient(TransientKind::ServiceUnavailable);
    }
    if error.status == Some(402)
        || tagged(Transient(TransientKind::Credits))
        || message.contains("credits")
        || message.contains("insufficient balance")
    {
        return Transient(TransientKind::Credits);
    }
    if tagged(Transient(TransientKind::CircuitOpen)) {
        return Transient(TransientKind::CircuitOpen);
    }
    if tagged(Transient(TransientKind::Timeout)) {
        return Transient(TransientKind::Timeout);
    }
    if tagged(Transient(TransientKind::Network))
        || message.contains("connection reset")
        || message.contains("connection refused")
        || message.contains("timed out")
        || message.contains("network")
    {
        return Transient(TransientKind::Network);
    }

    if tagged(Internal) {
        return Internal;
    }

    Transient(TransientKind::Default)
}

/// Where a failed task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Circuit-open: back onto the retry queue tail, budget untouched.
    Requeued,
    /// Delayed retry scheduled.
    Scheduled { delay: Duration, retry_count: u32 },
    /// Terminal: dead-lettered.
    DeadLettered,
}

/// Routes handler failures to retry or the DLQ.
#[derive(Clone)]
pub struct RetryRouter {
    repo: TaskRepository,
    events: EventPublisher,
    max_task_age: ChronoDuration,
    retry_warn_depth: usize,
    retry_crit_depth: usize,
}

impl RetryRouter {
    pub fn new(
        repo: TaskRepository,
        events: EventPublisher,
        max_task_age: Duration,
        retry_warn_depth: usize,
        retry_crit_depth: usize,
    ) -> Self {
        Self {
            repo,
            events,
            max_task_age: ChronoDuration::from_std(max_task_age)
                .unwrap_or_else(|_| ChronoDuration::hours(2)),
            retry_warn_depth,
            retry_crit_depth,
        }
    }

    /// Route an ACTIVE task's failure.
    ///
    /// Records the error, then applies the decision procedure:
    /// circuit-open requeues; permanent classes, an exhausted retry budget,
    /// or an over-age task dead-letter; everything else schedules a delayed
    /// retry on the class-specific backoff.
    pub async fn route_failure(
        &self,
        record: &TaskRecord,
        class: ErrorClass,
        message: &str,
    ) -> BrokerResult<RouteOutcome> {
        let task_id = record.task_id.as_str();
        self.repo
            .record_error(task_id, class.as_str(), message)
            .await?;

        // Retryable without consuming the budget (circuit-open): straight
        // back onto the retry queue tail.
        if class.should_retry() && !class.increments_retry_count() {
            self.repo
                .transition(
                    task_id,
                    TaskState::Active,
                    TaskState::Pending,
                    &[],
                    &[QueueOp::PushRetryTail],
                    None,
                )
                .await?;
            self.emit(task_id, TaskState::Active, TaskState::Pending).await;
            info!(task_id = %task_id, "Requeued after circuit-open rejection");
            return Ok(RouteOutcome::Requeued);
        }

        let age = record.age(Utc::now());
        let exhausted = record.retry_count >= record.max_retries;
        let over_age = age >= self.max_task_age;

        if !class.should_retry() || exhausted || over_age {
            warn!(
                task_id = %task_id,
                class = class.as_str(),
                retry_count = record.retry_count,
                max_retries = record.max_retries,
                age_secs = age.num_seconds(),
                exhausted,
                over_age,
                "Dead-lettering task"
            );
            self.repo
                .transition(
                    task_id,
                    TaskState::Active,
                    TaskState::Dlq,
                    &[],
                    &[QueueOp::PushDlq],
                    None,
                )
                .await?;
            self.emit(task_id, TaskState::Active, TaskState::Dlq).await;
            return Ok(RouteOutcome::DeadLettered);
        }

        // Delayed retry: FAILED is recorded on the way to SCHEDULED
        let delay = class.delay_for_attempt(record.retry_count);
        let retry_count = record.retry_count + 1;
        let retry_after = Utc::now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(5));
        let retry_after_iso = retry_after.to_rfc3339_opts(SecondsFormat::Micros, true);

        self.repo
            .transition(task_id, TaskState::Active, TaskState::Failed, &[], &[], None)
            .await?;
        self.emit(task_id, TaskState::Active, TaskState::Failed).await;

        self.repo
            .transition(
                task_id,
                TaskState::Failed,
                TaskState::Scheduled,
                &TaskRepository::scheduled_patch(retry_count, &retry_after_iso),
                &[QueueOp::AddScheduled],
                Some(retry_after.timestamp() as f64),
            )
            .await?;
        self.emit(task_id, TaskState::Failed, TaskState::Scheduled).await;

        info!(
            task_id = %task_id,
            class = class.as_str(),
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry with backoff"
        );

        Ok(RouteOutcome::Scheduled { delay, retry_count })
    }

    async fn emit(&self, task_id: &str, old_state: TaskState, new_state: TaskState) {
        if let Ok(snapshot) = self.repo.queue_snapshot().await {
            let ratio = adaptive_retry_ratio(
                snapshot.depths.retry,
                self.retry_warn_depth,
                self.retry_crit_depth,
            );
            self.events
                .task_state_changed(task_id, old_state, new_state, snapshot, ratio)
                .await;
        }
    }
}
