//! Scheduled-retry promoter.
//!
//! Every tick, tasks whose due time has passed move from the scheduled set
//! to the retry queue via the CAS transition script. The loop runs on
//! every worker: a task promoted by one peer shows up as a conflict to the
//! others, which then just drop their stale set entry. Promotion order is
//! nondecreasing due-time with ties broken lexicographically by task id
//! (the range read already yields that order).

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::dispatcher::adaptive_retry_ratio;
use crate::error::{BrokerError, BrokerResult};
use crate::events::EventPublisher;
use crate::keys;
use crate::repository::{QueueOp, TaskRepository};
use crate::task::TaskState;

/// Periodic mover of due scheduled tasks onto the retry queue.
#[derive(Clone)]
pub struct Scheduler {
    repo: TaskRepository,
    events: EventPublisher,
    config: std::sync::Arc<BrokerConfig>,
}

impl Scheduler {
    pub fn new(
        repo: TaskRepository,
        events: EventPublisher,
        config: std::sync::Arc<BrokerConfig>,
    ) -> Self {
        Self {
            repo,
            events,
            config,
        }
    }

    /// Run the promotion loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_ms = self.config.scheduler_tick_ms,
            batch = self.config.scheduler_batch,
            "Scheduler started"
        );

        let tick = self.config.scheduler_tick();

        loop {
            if *shutdown.borrow() {
                info!("Scheduler received shutdown signal");
                break;
            }

            match self.promote_due().await {
                Ok(0) => {}
                Ok(promoted) => debug!(promoted, "Promoted due tasks"),
                Err(e) => error!(error = %e, "Promotion tick failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }

        info!("Scheduler stopped");
    }

    /// Promote every due task in the next batch. Returns the count moved.
    pub async fn promote_due(&self) -> BrokerResult<usize> {
        let now = Utc::now().timestamp() as f64;
        let due = self
            .repo
            .store()
            .zset_range_by_score(keys::SCHEDULED_SET, now, self.config.scheduler_batch)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        let mut promoted = 0;
        for task_id in due {
            match self
                .repo
                .transition(
                    &task_id,
                    TaskState::Scheduled,
                    TaskState::Pending,
                    &[("retry_after", String::new())],
                    &[QueueOp::RemoveScheduled, QueueOp::PushRetry],
                    None,
                )
                .await
            {
                Ok(()) => {
                    promoted += 1;
                    self.emit(&task_id).await;
                }
                Err(BrokerError::Conflict { found, .. }) => {
                    // A peer promoted it first, or the task moved on; the
                    // set entry is stale either way.
                    debug!(task_id = %task_id, found = %found, "Dropping stale scheduled entry");
                    self.repo
                        .store()
                        .zset_remove(keys::SCHEDULED_SET, &task_id)
                        .await?;
                }
                Err(BrokerError::NotFound(_)) => {
                    warn!(task_id = %task_id, "Scheduled entry without a record, dropping");
                    self.repo
                        .store()
                        .zset_remove(keys::SCHEDULED_SET, &task_id)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(promoted)
    }

    async fn emit(&self, task_id: &str) {
        if let Ok(snapshot) = self.repo.queue_snapshot().await {
            let ratio = adaptive_retry_ratio(
                snapshot.depths.retry,
                self.config.retry_warn_depth,
                self.config.retry_crit_depth,
            );
            self.events
                .task_state_changed(task_id, TaskState::Scheduled, TaskState::Pending, snapshot, ratio)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    // Promotion ordering (nondecreasing due-time, lexicographic ties) and
    // stale-entry cleanup run against a real store in
    // tests/scheduler_test.rs.
}
