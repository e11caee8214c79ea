//! Dead letter queue administration.
//!
//! Dead-lettered tasks keep a frozen copy of their record beside the DLQ
//! list, so inspection works even after the live record is retried or
//! deleted. This manager backs the admin surface: stats, listing,
//! reprocessing, purge.

use serde::{Deserialize, Serialize};
use store::StoreClient;
use tracing::{info, warn};

use crate::error::BrokerResult;
use crate::keys;
use crate::repository::{RetryOutcome, TaskRepository};
use crate::task::TaskRecord;

/// DLQ statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub depth: usize,
    /// Most recently dead-lettered task (head of the list).
    pub newest_task_id: Option<String>,
    /// Oldest entry still in the queue (tail of the list).
    pub oldest_task_id: Option<String>,
}

/// Dead letter queue manager.
#[derive(Clone)]
pub struct DlqManager {
    store: StoreClient,
    repo: TaskRepository,
}

impl DlqManager {
    pub fn new(store: StoreClient, repo: TaskRepository) -> Self {
        Self { store, repo }
    }

    /// Get DLQ statistics.
    pub async fn stats(&self) -> BrokerResult<DlqStats> {
        let depth = self.store.list_len(keys::DLQ_LIST).await?;
        let newest = self.store.list_range(keys::DLQ_LIST, 0, 0).await?;
        let oldest = self.store.list_range(keys::DLQ_LIST, -1, -1).await?;

        Ok(DlqStats {
            depth,
            newest_task_id: newest.into_iter().next(),
            oldest_task_id: oldest.into_iter().next(),
        })
    }

    /// List DLQ entries, newest first, from the frozen copies.
    pub async fn list(&self, limit: usize) -> BrokerResult<Vec<TaskRecord>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let ids = self
            .store
            .list_range(keys::DLQ_LIST, 0, limit as isize - 1)
            .await?;

        let mut entries = Vec::with_capacity(ids.len());
        for task_id in ids {
            let fields = self.store.hash_get_all(&keys::dlq_task(&task_id)).await?;
            if fields.is_empty() {
                warn!(task_id = %task_id, "DLQ entry without a copy record");
                continue;
            }
            match TaskRecord::from_hash(&task_id, &fields) {
                Ok(record) => entries.push(record),
                Err(e) => warn!(task_id = %task_id, error = %e, "Unreadable DLQ copy"),
            }
        }

        Ok(entries)
    }

    /// Reprocess one dead-lettered task: back to PENDING on the retry
    /// queue with its retry budget reset.
    pub async fn reprocess(&self, task_id: &str) -> BrokerResult<RetryOutcome> {
        let outcome = self.repo.manual_retry(task_id).await?;
        info!(task_id = %task_id, "DLQ entry requeued for reprocessing");
        Ok(outcome)
    }

    /// Remove every DLQ entry and its copy. Returns the number removed.
    ///
    /// Live task records are left alone; only the terminal queue and the
    /// frozen copies are dropped.
    pub async fn purge(&self) -> BrokerResult<usize> {
        let ids = self.store.list_range(keys::DLQ_LIST, 0, -1).await?;
        for task_id in &ids {
            self.store.delete_key(&keys::dlq_task(task_id)).await?;
        }
        self.store.delete_key(keys::DLQ_LIST).await?;

        if !ids.is_empty() {
            info!(count = ids.len(), "Purged DLQ");
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    // DLQ flows require dead-lettered records; covered in
    // tests/ingress_test.rs against a real store.
}
