//! Task dispatcher.
//!
//! Each worker runs `W` dispatch loops. A loop selects between the primary
//! and retry queues with an adaptive preference, claims the task with a
//! compare-and-swap to ACTIVE, gates on the circuit breaker and the
//! distributed rate limiter, invokes the handler under soft/hard deadlines,
//! and routes the outcome.
//!
//! Back-pressure: when the retry queue deepens, the share of pops that
//! prefer it shrinks, so a retry storm cannot starve new work.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use store::{MultiplexedConnection, StoreClient};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::BrokerConfig;
use crate::error::{
    BrokerError, BrokerResult, ErrorClass, HandlerError, PermanentKind, TransientKind,
};
use crate::events::EventPublisher;
use crate::handler::{HandlerContext, HandlerRegistry, ProviderGateway};
use crate::keys;
use crate::metrics::{self, TaskOutcome};
use crate::provider::{FailureKind, ProviderStateCache};
use crate::ratelimit::RateLimiter;
use crate::repository::{QueueOp, TaskRepository};
use crate::router::{RetryRouter, classify};
use crate::task::{TaskRecord, TaskState};

/// Retry-queue preference for the next pop, by current retry depth.
///
/// Below the warn threshold ~30% of pops prefer retries; past it 20%;
/// past the crit threshold 10%.
pub fn adaptive_retry_ratio(retry_depth: usize, warn: usize, crit: usize) -> f64 {
    if retry_depth >= crit {
        0.10
    } else if retry_depth >= warn {
        0.20
    } else {
        0.30
    }
}

/// One dispatch loop. The worker spawns `config.concurrency` of these.
#[derive(Clone)]
pub struct Dispatcher {
    store: StoreClient,
    repo: TaskRepository,
    registry: Arc<HandlerRegistry>,
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    provider: ProviderStateCache,
    router: RetryRouter,
    events: EventPublisher,
    config: Arc<BrokerConfig>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StoreClient,
        repo: TaskRepository,
        registry: Arc<HandlerRegistry>,
        breaker: Arc<CircuitBreaker>,
        limiter: RateLimiter,
        provider: ProviderStateCache,
        router: RetryRouter,
        events: EventPublisher,
        config: Arc<BrokerConfig>,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            store,
            repo,
            registry,
            breaker,
            limiter,
            provider,
            router,
            events,
            config,
            in_flight,
        }
    }

    /// Number of tasks currently being executed by this worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.config.worker_id,
            pop_timeout_secs = self.config.pop_timeout_secs,
            "Dispatcher started"
        );

        let mut consecutive_errors: u32 = 0;
        const MAX_BACKOFF_SECS: u64 = 30;
        let mut conn: Option<MultiplexedConnection> = None;

        loop {
            if *shutdown.borrow() {
                info!("Dispatcher received shutdown signal");
                break;
            }

            // Blocking pops need their own connection
            if conn.is_none() {
                match self.store.dedicated_connection().await {
                    Ok(fresh) => conn = Some(fresh),
                    Err(e) => {
                        warn!(error = %e, "Failed to open pop connection, backing off");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        continue;
                    }
                }
            }
            let Some(pop_conn) = conn.as_mut() else {
                continue;
            };

            match self.iteration(pop_conn).await {
                Ok(_) => {
                    if consecutive_errors > 0 {
                        info!("Recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                }
                Err(e) => {
                    let connection_class = matches!(
                        &e,
                        BrokerError::Store(store_err) if store_err.is_connection_error()
                    );
                    if connection_class {
                        consecutive_errors += 1;
                        conn = None; // retire the pop connection
                        let backoff_secs =
                            std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                        warn!(
                            error = %e,
                            consecutive_errors,
                            backoff_secs,
                            "Store connection error, backing off"
                        );
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        }
                    } else {
                        error!(error = %e, "Dispatch iteration failed");
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }

        info!("Dispatcher stopped");
    }

    /// One selection + execution round. Returns without work on pop timeout.
    async fn iteration(&self, conn: &mut MultiplexedConnection) -> BrokerResult<()> {
        let Some(task_id) = self.select_task(conn).await? else {
            return Ok(());
        };
        self.execute(&task_id).await
    }

    /// Pop the next task id, preferring primary or retry per the adaptive
    /// draw. The combined blocking pop covers both queues; preference is
    /// the key order.
    async fn select_task(&self, conn: &mut MultiplexedConnection) -> BrokerResult<Option<String>> {
        let retry_depth = self.store.list_len(keys::RETRY_QUEUE).await?;
        let ratio = adaptive_retry_ratio(
            retry_depth,
            self.config.retry_warn_depth,
            self.config.retry_crit_depth,
        );

        let draw: f64 = rand::random();
        let order: [&str; 2] = if draw > ratio {
            [keys::PRIMARY_QUEUE, keys::RETRY_QUEUE]
        } else {
            [keys::RETRY_QUEUE, keys::PRIMARY_QUEUE]
        };

        let popped = self
            .store
            .list_pop_blocking_right(conn, &order, self.config.pop_timeout())
            .await?;

        Ok(popped.map(|(queue, task_id)| {
            debug!(task_id = %task_id, queue = %queue, "Popped task");
            task_id
        }))
    }

    /// Execute one claimed task id through the full pipeline.
    async fn execute(&self, task_id: &str) -> BrokerResult<()> {
        // Claim: PENDING -> ACTIVE. A concurrent claimer wins the CAS and
        // we simply move on.
        match self
            .repo
            .transition(task_id, TaskState::Pending, TaskState::Active, &[], &[], None)
            .await
        {
            Ok(()) => {}
            Err(BrokerError::Conflict { found, .. }) => {
                debug!(task_id = %task_id, found = %found, "Lost claim race, skipping");
                metrics::record_task_processed(TaskOutcome::Skipped);
                return Ok(());
            }
            Err(BrokerError::NotFound(_)) => {
                warn!(task_id = %task_id, "Popped id without a record, skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.emit_transition(task_id, TaskState::Pending, TaskState::Active)
            .await;

        let active_key = keys::worker_active_tasks(&self.config.worker_id);
        let _ = self.store.set_add(&active_key, task_id).await;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        metrics::set_in_flight_tasks(self.in_flight.load(Ordering::SeqCst) as f64);

        let outcome = self.execute_claimed(task_id).await;

        let _ = self.store.set_remove(&active_key, task_id).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        metrics::set_in_flight_tasks(self.in_flight.load(Ordering::SeqCst) as f64);

        outcome
    }

    async fn execute_claimed(&self, task_id: &str) -> BrokerResult<()> {
        // Breaker gate: requeue to the retry tail without consuming the
        // retry budget.
        if !self.breaker.can_execute() {
            warn!(task_id = %task_id, "Circuit open, requeueing task");
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
            self.emit_transition(task_id, TaskState::Active, TaskState::Pending)
                .await;
            metrics::record_task_processed(TaskOutcome::Requeued);
            return Ok(());
        }

        let record = match self.repo.try_fetch(task_id).await? {
            Some(record) => record,
            None => {
                warn!(task_id = %task_id, "Record vanished after claim");
                return Ok(());
            }
        };

        // Token gate: a timeout here is an ordinary transient failure
        match self.limiter.acquire(1, self.config.token_wait()).await {
            Ok(()) => {}
            Err(BrokerError::RateLimitTimeout(waited)) => {
                let message = format!("rate limit token not granted within {:?}", waited);
                return self
                    .fail(
                        &record,
                        ErrorClass::Transient(TransientKind::RateLimit),
                        &message,
                    )
                    .await;
            }
            Err(e) => return Err(e),
        }

        let Some(handler) = self.registry.get(&record.task_type) else {
            let message = format!("no handler registered for task type '{}'", record.task_type);
            return self
                .fail(
                    &record,
                    ErrorClass::Permanent(PermanentKind::Dependency),
                    &message,
                )
                .await;
        };

        let started = std::time::Instant::now();
        let result = self.invoke_with_deadlines(handler.as_ref(), &record).await;
        metrics::record_handler_duration(&record.task_type, started.elapsed());

        match result {
            Ok(result_payload) => {
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
                self.repo
                    .transition(
                        task_id,
                        TaskState::Active,
                        TaskState::Completed,
                        &[("result", result_payload), ("completed_at", now)],
                        &[],
                        None,
                    )
                    .await?;
                self.emit_transition(task_id, TaskState::Active, TaskState::Completed)
                    .await;

                self.breaker.record_success();
                if let Err(e) = self.provider.report_success().await {
                    debug!(error = %e, "Failed to report provider success");
                }
                metrics::record_task_processed(TaskOutcome::Completed);
                info!(task_id = %task_id, task_type = %record.task_type, "Task completed");
                Ok(())
            }
            Err(handler_err) => {
                let class = classify(&handler_err);
                self.fail(&record, class, &handler_err.message).await
            }
        }
    }

    /// Invoke the handler with the soft/hard deadline envelope.
    ///
    /// The soft deadline sends a cooperative cancel signal; the hard
    /// deadline abandons the attempt and classifies it `timeout`.
    async fn invoke_with_deadlines(
        &self,
        handler: &dyn crate::handler::TaskHandler,
        record: &TaskRecord,
    ) -> Result<String, HandlerError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let gateway = ProviderGateway::new(
            Arc::clone(&self.breaker),
            self.limiter.clone(),
            self.config.token_wait(),
        );
        let ctx = HandlerContext::new(
            record.task_id.clone(),
            self.config.worker_id.clone(),
            cancel_rx,
            gateway,
        );

        let soft = self.config.soft_limit();
        let hard = self.config.hard_limit();

        let fut = handler.handle(&record.task_id, &record.payload, &ctx);
        tokio::pin!(fut);

        tokio::select! {
            result = &mut fut => result,
            _ = tokio::time::sleep(soft) => {
                warn!(
                    task_id = %record.task_id,
                    soft_secs = soft.as_secs(),
                    "Soft deadline reached, requesting cancellation"
                );
                let _ = cancel_tx.send(true);
                match tokio::time::timeout(hard.saturating_sub(soft), &mut fut).await {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::timeout(format!(
                        "hard deadline of {}s exceeded",
                        hard.as_secs()
                    ))),
                }
            }
        }
    }

    /// Record breaker/provider outcome and route the failure.
    async fn fail(
        &self,
        record: &TaskRecord,
        class: ErrorClass,
        message: &str,
    ) -> BrokerResult<()> {
        warn!(
            task_id = %record.task_id,
            class = class.as_str(),
            error = %message,
            "Task failed"
        );

        // A circuit-open rejection never reached the provider; everything
        // else counts against the breaker.
        if class != ErrorClass::Transient(TransientKind::CircuitOpen) {
            self.breaker.record_failure();
        }
        if let Some(kind) = provider_failure_kind(class) {
            if let Err(e) = self.provider.report_failure(kind, message, None).await {
                debug!(error = %e, "Failed to report provider failure");
            }
        }

        metrics::record_error(class);
        let outcome = self.router.route_failure(record, class, message).await?;
        metrics::record_task_processed(match outcome {
            crate::router::RouteOutcome::Requeued => TaskOutcome::Requeued,
            crate::router::RouteOutcome::Scheduled { retry_count, .. } => {
                metrics::record_retry(retry_count);
                TaskOutcome::Failed
            }
            crate::router::RouteOutcome::DeadLettered => TaskOutcome::DeadLettered,
        });
        Ok(())
    }

    async fn emit_transition(&self, task_id: &str, old_state: TaskState, new_state: TaskState) {
        if let Ok(snapshot) = self.repo.queue_snapshot().await {
            let ratio = adaptive_retry_ratio(
                snapshot.depths.retry,
                self.config.retry_warn_depth,
                self.config.retry_crit_depth,
            );
            self.events
                .task_state_changed(task_id, old_state, new_state, snapshot, ratio)
                .await;
        }
    }
}

/// Map a failure class to the provider-facing kind it implies, if any.
fn provider_failure_kind(class: ErrorClass) -> Option<FailureKind> {
    match class {
        ErrorClass::Permanent(PermanentKind::Auth) => Some(FailureKind::ApiKeyInvalid),
        ErrorClass::Transient(TransientKind::RateLimit) => Some(FailureKind::RateLimited),
        ErrorClass::Transient(TransientKind::Credits) => Some(FailureKind::CreditsExhausted),
        ErrorClass::Transient(TransientKind::ServiceUnavailable) => {
            Some(FailureKind::ServiceUnavailable)
        }
        ErrorClass::Transient(TransientKind::Network) => Some(FailureKind::NetworkError),
        ErrorClass::Transient(TransientKind::Timeout) => Some(FailureKind::Timeout),
        ErrorClass::Transient(TransientKind::Default) => Some(FailureKind::Unknown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_retry_ratio_bands() {
        assert_eq!(adaptive_retry_ratio(0, 1000, 5000), 0.30);
        assert_eq!(adaptive_retry_ratio(999, 1000, 5000), 0.30);
        assert_eq!(adaptive_retry_ratio(1000, 1000, 5000), 0.20);
        assert_eq!(adaptive_retry_ratio(4999, 1000, 5000), 0.20);
        assert_eq!(adaptive_retry_ratio(5000, 1000, 5000), 0.10);
        assert_eq!(adaptive_retry_ratio(50_000, 1000, 5000), 0.10);
    }

    #[test]
    fn test_provider_failure_kind_mapping() {
        assert_eq!(
            provider_failure_kind(ErrorClass::Permanent(PermanentKind::Auth)),
            Some(FailureKind::ApiKeyInvalid)
        );
        assert_eq!(
            provider_failure_kind(ErrorClass::Transient(TransientKind::Credits)),
            Some(FailureKind::CreditsExhausted)
        );
        // Local conditions never reach the provider cache
        assert_eq!(
            provider_failure_kind(ErrorClass::Transient(TransientKind::CircuitOpen)),
            None
        );
        assert_eq!(
            provider_failure_kind(ErrorClass::Permanent(PermanentKind::Validation)),
            None
        );
        assert_eq!(provider_failure_kind(ErrorClass::Internal), None);
    }

    // Full dispatch rounds (claim race, breaker requeue, deadline
    // classification) are exercised end-to-end in tests/lifecycle_test.rs.
}
