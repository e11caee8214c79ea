//! Ingress contract.
//!
//! The operations the API collaborator calls to submit, query, retry, and
//! delete tasks. This is a library surface: transport (HTTP, gRPC) is the
//! collaborator's concern, and every operation returns a structured result
//! or a `BrokerError` with a stable code.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::dispatcher::adaptive_retry_ratio;
use crate::dlq::DlqManager;
use crate::error::{BrokerError, BrokerResult};
use crate::events::{ControlCommand, EventPublisher};
use crate::handler::HandlerRegistry;
use crate::repository::{OrphanOutcome, QueueSnapshot, RetryOutcome, TaskRepository};
use crate::task::{NewTask, TaskRecord, TaskState};

/// Sort order for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    CreatedDesc,
    CreatedAsc,
}

/// Filter and paging for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<TaskState>,
    pub task_type: Option<String>,
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
    pub sort: SortOrder,
}

impl ListFilter {
    pub fn new() -> Self {
        Self {
            page: 1,
            page_size: 20,
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page.max(1);
        self.page_size = page_size.max(1);
        self
    }
}

/// One page of task records.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

/// Combined queue status for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    #[serde(flatten)]
    pub snapshot: QueueSnapshot,
    pub retry_ratio: f64,
}

/// Entry points exposed to the API collaborator.
#[derive(Clone)]
pub struct Ingress {
    repo: TaskRepository,
    dlq: DlqManager,
    events: EventPublisher,
    registry: Arc<HandlerRegistry>,
    config: Arc<BrokerConfig>,
}

impl Ingress {
    pub fn new(
        repo: TaskRepository,
        dlq: DlqManager,
        events: EventPublisher,
        registry: Arc<HandlerRegistry>,
        config: Arc<BrokerConfig>,
    ) -> Self {
        Self {
            repo,
            dlq,
            events,
            registry,
            config,
        }
    }

    /// Submit a new task. Returns the task id.
    ///
    /// A client-supplied `task_id` makes the call idempotent: a duplicate
    /// submission fails with `AlreadyExists` instead of double-enqueueing.
    pub async fn submit(
        &self,
        task_type: &str,
        payload: impl Into<String>,
        max_retries: Option<u32>,
        task_id: Option<String>,
    ) -> BrokerResult<String> {
        if task_type.is_empty() {
            return Err(BrokerError::Validation("task_type must not be empty".into()));
        }
        if !self.registry.contains(task_type) {
            return Err(BrokerError::Validation(format!(
                "unknown task type '{}', registered: {:?}",
                task_type,
                self.registry.task_types()
            )));
        }

        let task = NewTask {
            task_id: task_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type: task_type.to_string(),
            payload: payload.into(),
            max_retries: max_retries.unwrap_or(self.config.max_retries),
        };

        self.repo.create(&task).await?;
        info!(task_id = %task.task_id, task_type = %task_type, "Task submitted");

        if let Ok(snapshot) = self.repo.queue_snapshot().await {
            self.events
                .task_created(&task.task_id, snapshot, self.ratio(&snapshot))
                .await;
        }

        Ok(task.task_id)
    }

    /// Fetch one task.
    pub async fn get(&self, task_id: &str) -> BrokerResult<TaskRecord> {
        self.repo.fetch(task_id).await
    }

    /// List tasks with filtering, paging, and sorting.
    ///
    /// Scans the record keyspace; built for operator/dashboard call rates,
    /// not the hot path.
    pub async fn list(&self, filter: &ListFilter) -> BrokerResult<Page<TaskRecord>> {
        let ids = self.repo.scan_task_ids().await?;

        let mut records = Vec::new();
        for task_id in ids {
            // Records can vanish mid-scan; skip them
            let Some(record) = self.repo.try_fetch(&task_id).await? else {
                continue;
            };
            if let Some(state) = filter.state {
                if record.state != state {
                    continue;
                }
            }
            if let Some(task_type) = &filter.task_type {
                if &record.task_type != task_type {
                    continue;
                }
            }
            records.push(record);
        }

        match filter.sort {
            SortOrder::CreatedDesc => {
                records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            }
            SortOrder::CreatedAsc => {
                records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            }
        }

        let total = records.len();
        let page = filter.page.max(1);
        let page_size = filter.page_size.max(1);
        let start = (page - 1) * page_size;
        let items = if start >= total {
            vec![]
        } else {
            records
                .into_iter()
                .skip(start)
                .take(page_size)
                .collect()
        };

        Ok(Page {
            items,
            page,
            page_size,
            total,
        })
    }

    /// Manually retry a FAILED or DLQ task.
    ///
    /// Resets the retry budget and pushes to the retry queue. Retrying a
    /// task that is already queued again is a no-op, so the call is safe
    /// to repeat.
    pub async fn retry(&self, task_id: &str) -> BrokerResult<RetryOutcome> {
        let before = self.repo.fetch(task_id).await?.state;
        let outcome = self.repo.manual_retry(task_id).await?;

        if outcome == RetryOutcome::Requeued {
            info!(task_id = %task_id, from = %before, "Task manually requeued");
            if let Ok(snapshot) = self.repo.queue_snapshot().await {
                self.events
                    .task_state_changed(
                        task_id,
                        before,
                        TaskState::Pending,
                        snapshot,
                        self.ratio(&snapshot),
                    )
                    .await;
            }
        }

        Ok(outcome)
    }

    /// Delete a task record and any queue memberships, atomically.
    pub async fn delete(&self, task_id: &str) -> BrokerResult<()> {
        let state = self.repo.delete(task_id).await?;
        info!(task_id = %task_id, state = %state, "Task deleted");

        if let Ok(snapshot) = self.repo.queue_snapshot().await {
            self.events
                .queue_snapshot(snapshot, self.ratio(&snapshot))
                .await;
        }
        Ok(())
    }

    /// Requeue PENDING tasks that sit in no queue (recovery after worker
    /// crashes or lost shutdown races). Returns the number requeued.
    pub async fn requeue_orphaned(&self) -> BrokerResult<usize> {
        let ids = self.repo.scan_task_ids().await?;
        let mut requeued = 0;

        for task_id in ids {
            if self.repo.requeue_orphan(&task_id).await? == OrphanOutcome::Requeued {
                info!(task_id = %task_id, "Requeued orphaned task");
                requeued += 1;
            }
        }

        if requeued > 0 {
            if let Ok(snapshot) = self.repo.queue_snapshot().await {
                self.events
                    .queue_snapshot(snapshot, self.ratio(&snapshot))
                    .await;
            }
        }

        Ok(requeued)
    }

    /// Queue depths, state counters, and the current adaptive retry ratio.
    pub async fn queue_status(&self) -> BrokerResult<QueueStatus> {
        let snapshot = self.repo.queue_snapshot().await?;
        Ok(QueueStatus {
            retry_ratio: self.ratio(&snapshot),
            snapshot,
        })
    }

    /// List dead-lettered tasks, newest first.
    pub async fn dlq_list(&self, limit: usize) -> BrokerResult<Vec<TaskRecord>> {
        self.dlq.list(limit).await
    }

    /// Broadcast a circuit reset to every worker.
    pub async fn reset_all_circuits(&self) -> BrokerResult<()> {
        self.events.control(ControlCommand::ResetAllCircuits).await
    }

    /// Broadcast a forced circuit open to every worker.
    pub async fn open_all_circuits(&self) -> BrokerResult<()> {
        self.events.control(ControlCommand::OpenAllCircuits).await
    }

    fn ratio(&self, snapshot: &QueueSnapshot) -> f64 {
        adaptive_retry_ratio(
            snapshot.depths.retry,
            self.config.retry_warn_depth,
            self.config.retry_crit_depth,
        )
    }
}
