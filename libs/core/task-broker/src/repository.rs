//! Task record repository.
//!
//! Thin typed layer over the atomic scripts plus the pipelined snapshot
//! reads. All state/counter/queue mutations go through here; callers never
//! touch task keys directly.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use store::StoreClient;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::keys;
use crate::scripts;
use crate::task::{NewTask, TaskRecord, TaskState};

/// Queue membership operations applied inside a transition script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    PushPrimary,
    PushRetry,
    /// Tail insert: used for circuit-open requeues so the task yields to
    /// work already waiting.
    PushRetryTail,
    AddScheduled,
    RemoveScheduled,
    RemovePrimary,
    RemoveRetry,
    RemoveDlq,
    PushDlq,
    DropDlqCopy,
}

impl QueueOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PushPrimary => "push_primary",
            Self::PushRetry => "push_retry",
            Self::PushRetryTail => "push_retry_tail",
            Self::AddScheduled => "add_scheduled",
            Self::RemoveScheduled => "remove_scheduled",
            Self::RemovePrimary => "remove_primary",
            Self::RemoveRetry => "remove_retry",
            Self::RemoveDlq => "remove_dlq",
            Self::PushDlq => "push_dlq",
            Self::DropDlqCopy => "drop_dlq_copy",
        }
    }
}

/// Current depth of each queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueDepths {
    pub primary: usize,
    pub retry: usize,
    pub scheduled: usize,
    pub dlq: usize,
}

/// Per-state task counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub scheduled: i64,
    pub dlq: i64,
}

impl StateCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.active + self.completed + self.failed + self.scheduled + self.dlq
    }

    pub fn get(&self, state: TaskState) -> i64 {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Active => self.active,
            TaskState::Completed => self.completed,
            TaskState::Failed => self.failed,
            TaskState::Scheduled => self.scheduled,
            TaskState::Dlq => self.dlq,
        }
    }
}

/// Combined queue depths and state counters, read in one pipeline.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(rename = "queue_depths")]
    pub depths: QueueDepths,
    #[serde(rename = "state_counts")]
    pub counts: StateCounts,
}

/// Outcome of an orphan requeue check for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanOutcome {
    /// Was PENDING and in no queue; pushed to the retry queue.
    Requeued,
    /// Already present in a queue.
    Queued,
    /// Not in PENDING state; nothing to do.
    Skip,
}

/// Outcome of a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Moved back to PENDING on the retry queue.
    Requeued,
    /// Already PENDING and queued; retry was a no-op.
    AlreadyQueued,
}

/// Repository of task records and their shared queues.
#[derive(Clone)]
pub struct TaskRepository {
    store: StoreClient,
}

impl TaskRepository {
    pub fn new(store: StoreClient) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    fn now_iso() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Create a task record in PENDING and enqueue it on the primary queue.
    pub async fn create(&self, task: &NewTask) -> BrokerResult<()> {
        let task_key = keys::task(&task.task_id);
        let pending_counter = keys::state_counter(TaskState::Pending);
        let max_retries = task.max_retries.to_string();
        let now = Self::now_iso();

        let reply: String = self
            .store
            .run_script(
                &scripts::CREATE_TASK,
                &[&task_key, keys::PRIMARY_QUEUE, &pending_counter],
                &[
                    &task.task_id,
                    &task.task_type,
                    &task.payload,
                    &max_retries,
                    &now,
                ],
            )
            .await?;

        match reply.as_str() {
            "OK" => {
                debug!(task_id = %task.task_id, task_type = %task.task_type, "Created task");
                Ok(())
            }
            "EXISTS" => Err(BrokerError::AlreadyExists(task.task_id.clone())),
            other => Err(BrokerError::Internal(format!(
                "create script returned '{}'",
                other
            ))),
        }
    }

    /// Compare-and-swap state transition.
    ///
    /// Applies the hash patch, queue ops, counter move, and history append
    /// in one atomic script. Fails with `Conflict` when the observed state
    /// differs from `from`.
    pub async fn transition(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        patch: &[(&str, String)],
        ops: &[QueueOp],
        scheduled_score: Option<f64>,
    ) -> BrokerResult<()> {
        let task_key = keys::task(task_id);
        let dlq_copy_key = keys::dlq_task(task_id);
        let counter_from = keys::state_counter(from);
        let counter_to = keys::state_counter(to);

        let patch_json = {
            let map: HashMap<&str, &str> = patch
                .iter()
                .map(|(field, value)| (*field, value.as_str()))
                .collect();
            serde_json::to_string(&map)?
        };
        let ops_json =
            serde_json::to_string(&ops.iter().map(|op| op.as_str()).collect::<Vec<_>>())?;
        let score = scheduled_score.unwrap_or(0.0).to_string();
        let now = Self::now_iso();

        let reply: String = self
            .store
            .run_script(
                &scripts::TRANSITION_TASK,
                &[
                    &task_key,
                    keys::PRIMARY_QUEUE,
                    keys::RETRY_QUEUE,
                    keys::SCHEDULED_SET,
                    keys::DLQ_LIST,
                    &counter_from,
                    &counter_to,
                    &dlq_copy_key,
                ],
                &[
                    from.as_str(),
                    to.as_str(),
                    &now,
                    &patch_json,
                    &ops_json,
                    &score,
                ],
            )
            .await?;

        match reply.as_str() {
            "OK" => {
                debug!(task_id = %task_id, from = %from, to = %to, "Task transitioned");
                Ok(())
            }
            "NOT_FOUND" => Err(BrokerError::NotFound(task_id.to_string())),
            other if other.starts_with("CONFLICT:") => Err(BrokerError::Conflict {
                task_id: task_id.to_string(),
                expected: from.as_str().to_string(),
                found: other["CONFLICT:".len()..].to_string(),
            }),
            other => Err(BrokerError::Internal(format!(
                "transition script returned '{}'",
                other
            ))),
        }
    }

    /// Append to the task's error history and refresh `last_error`.
    pub async fn record_error(
        &self,
        task_id: &str,
        error_type: &str,
        message: &str,
    ) -> BrokerResult<()> {
        let task_key = keys::task(task_id);
        let now = Self::now_iso();

        let reply: String = self
            .store
            .run_script(
                &scripts::RECORD_ERROR,
                &[&task_key],
                &[error_type, message, &now],
            )
            .await?;

        match reply.as_str() {
            "OK" => Ok(()),
            "NOT_FOUND" => Err(BrokerError::NotFound(task_id.to_string())),
            other => Err(BrokerError::Internal(format!(
                "record_error script returned '{}'",
                other
            ))),
        }
    }

    /// Delete a task record plus every queue membership, atomically.
    ///
    /// Returns the state the task was in.
    pub async fn delete(&self, task_id: &str) -> BrokerResult<TaskState> {
        let task_key = keys::task(task_id);
        let dlq_copy_key = keys::dlq_task(task_id);

        let reply: String = self
            .store
            .run_script(
                &scripts::DELETE_TASK,
                &[
                    &task_key,
                    keys::PRIMARY_QUEUE,
                    keys::RETRY_QUEUE,
                    keys::SCHEDULED_SET,
                    keys::DLQ_LIST,
                    &dlq_copy_key,
                ],
                &["metrics:tasks:state:"],
            )
            .await?;

        if reply == "NOT_FOUND" {
            return Err(BrokerError::NotFound(task_id.to_string()));
        }
        TaskState::parse(&reply).ok_or_else(|| {
            BrokerError::Internal(format!("delete script returned '{}'", reply))
        })
    }

    /// Fetch a full task record.
    pub async fn fetch(&self, task_id: &str) -> BrokerResult<TaskRecord> {
        self.try_fetch(task_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(task_id.to_string()))
    }

    /// Fetch a record if it exists.
    pub async fn try_fetch(&self, task_id: &str) -> BrokerResult<Option<TaskRecord>> {
        let fields = self.store.hash_get_all(&keys::task(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        TaskRecord::from_hash(task_id, &fields).map(Some)
    }

    /// Requeue one orphaned task (PENDING, in no queue) onto the retry queue.
    pub async fn requeue_orphan(&self, task_id: &str) -> BrokerResult<OrphanOutcome> {
        let task_key = keys::task(task_id);

        let reply: String = self
            .store
            .run_script(
                &scripts::REQUEUE_ORPHAN,
                &[&task_key, keys::PRIMARY_QUEUE, keys::RETRY_QUEUE],
                &[],
            )
            .await?;

        match reply.as_str() {
            "REQUEUED" => Ok(OrphanOutcome::Requeued),
            "QUEUED" => Ok(OrphanOutcome::Queued),
            "SKIP" => Ok(OrphanOutcome::Skip),
            other => Err(BrokerError::Internal(format!(
                "orphan script returned '{}'",
                other
            ))),
        }
    }

    /// Manual retry: FAILED or DLQ re-enters the retry queue at PENDING with
    /// the retry budget reset.
    ///
    /// Applied to a task that is already PENDING and queued, it is a no-op
    /// (so two retries in a row behave like one).
    pub async fn manual_retry(&self, task_id: &str) -> BrokerResult<RetryOutcome> {
        let record = self.fetch(task_id).await?;
        let reset_patch: [(&str, String); 2] = [
            ("retry_count", "0".to_string()),
            ("retry_after", String::new()),
        ];

        match record.state {
            TaskState::Failed => {
                self.transition(
                    task_id,
                    TaskState::Failed,
                    TaskState::Pending,
                    &reset_patch,
                    &[QueueOp::PushRetry],
                    None,
                )
                .await?;
                Ok(RetryOutcome::Requeued)
            }
            TaskState::Dlq => {
                self.transition(
                    task_id,
                    TaskState::Dlq,
                    TaskState::Pending,
                    &reset_patch,
                    &[QueueOp::RemoveDlq, QueueOp::DropDlqCopy, QueueOp::PushRetry],
                    None,
                )
                .await?;
                Ok(RetryOutcome::Requeued)
            }
            TaskState::Pending => match self.requeue_orphan(task_id).await? {
                OrphanOutcome::Requeued => Ok(RetryOutcome::Requeued),
                _ => Ok(RetryOutcome::AlreadyQueued),
            },
            other => Err(BrokerError::Conflict {
                task_id: task_id.to_string(),
                expected: "FAILED|DLQ".to_string(),
                found: other.as_str().to_string(),
            }),
        }
    }

    /// Read queue depths and state counters in one pipeline round-trip.
    pub async fn queue_snapshot(&self) -> BrokerResult<QueueSnapshot> {
        let mut conn = self.store.manager();
        let mut pipe = redis::pipe();
        pipe.cmd("LLEN").arg(keys::PRIMARY_QUEUE);
        pipe.cmd("LLEN").arg(keys::RETRY_QUEUE);
        pipe.cmd("ZCARD").arg(keys::SCHEDULED_SET);
        pipe.cmd("LLEN").arg(keys::DLQ_LIST);
        for state in TaskState::ALL {
            pipe.cmd("GET").arg(keys::state_counter(state));
        }

        type SnapshotReply = (
            usize,
            usize,
            usize,
            usize,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
        );
        let (primary, retry, scheduled, dlq, pending, active, completed, failed, sched, dead): SnapshotReply =
            pipe.query_async(&mut conn).await.map_err(store::StoreError::Redis)?;

        Ok(QueueSnapshot {
            depths: QueueDepths {
                primary,
                retry,
                scheduled,
                dlq,
            },
            counts: StateCounts {
                pending: pending.unwrap_or(0),
                active: active.unwrap_or(0),
                completed: completed.unwrap_or(0),
                failed: failed.unwrap_or(0),
                scheduled: sched.unwrap_or(0),
                dlq: dead.unwrap_or(0),
            },
        })
    }

    /// Scan all task ids. Admin-scale; used by list() and orphan recovery.
    pub async fn scan_task_ids(&self) -> BrokerResult<Vec<String>> {
        let keys = self.store.scan_keys("task:*").await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix("task:").map(str::to_string))
            .collect())
    }

    /// Patch fields for a scheduled retry.
    pub fn scheduled_patch(
        retry_count: u32,
        retry_after_iso: &str,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("retry_count", retry_count.to_string()),
            ("retry_after", retry_after_iso.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_op_encoding() {
        assert_eq!(QueueOp::PushPrimary.as_str(), "push_primary");
        assert_eq!(QueueOp::PushRetryTail.as_str(), "push_retry_tail");
        assert_eq!(QueueOp::DropDlqCopy.as_str(), "drop_dlq_copy");
    }

    #[test]
    fn test_state_counts_total_and_get() {
        let counts = StateCounts {
            pending: 2,
            active: 1,
            completed: 10,
            failed: 0,
            scheduled: 3,
            dlq: 1,
        };
        assert_eq!(counts.total(), 17);
        assert_eq!(counts.get(TaskState::Completed), 10);
        assert_eq!(counts.get(TaskState::Dlq), 1);
    }

    // Script-backed operations are covered by the integration suite in
    // tests/repository_test.rs against a real store.
}
