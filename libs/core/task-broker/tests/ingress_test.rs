//! Integration tests for the ingress operations.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::TestBroker;
use task_broker::{
    BrokerError, HandlerContext, HandlerError, HandlerRegistry, ListFilter, QueueOp,
    RetryOutcome, SortOrder, TaskHandler, TaskState, keys,
};

struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn handle(
        &self,
        _task_id: &str,
        payload: &str,
        _ctx: &HandlerContext,
    ) -> Result<String, HandlerError> {
        Ok(payload.to_string())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

fn registry() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(NoopHandler));
    registry.register("summarize", Arc::new(NoopHandler));
    Arc::new(registry)
}

#[tokio::test]
async fn test_submit_validates_task_type() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    let err = ingress
        .submit("unknown-type", "payload", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
    assert_eq!(err.code(), "ValidationError");

    let err = ingress.submit("", "payload", None, None).await.unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
}

#[tokio::test]
async fn test_submit_and_get() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    let task_id = ingress
        .submit("echo", "hello", Some(5), None)
        .await
        .unwrap();

    let record = ingress.get(&task_id).await.unwrap();
    assert_eq!(record.task_type, "echo");
    assert_eq!(record.payload, "hello");
    assert_eq!(record.state, TaskState::Pending);
    assert_eq!(record.max_retries, 5);

    let err = ingress.get("missing").await.unwrap_err();
    assert_eq!(err.code(), "NotFound");
}

#[tokio::test]
async fn test_submit_with_client_id_is_idempotent() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    let task_id = ingress
        .submit("echo", "hello", None, Some("client-1".to_string()))
        .await
        .unwrap();
    assert_eq!(task_id, "client-1");

    let err = ingress
        .submit("echo", "hello", None, Some("client-1".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AlreadyExists");

    // Default retry cap applies when none is given
    let record = ingress.get("client-1").await.unwrap();
    assert_eq!(record.max_retries, broker.config.max_retries);
}

#[tokio::test]
async fn test_list_filters_and_pages() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    for index in 0..5 {
        ingress
            .submit("echo", "p", None, Some(format!("echo-{}", index)))
            .await
            .unwrap();
    }
    ingress
        .submit("summarize", "p", None, Some("sum-0".to_string()))
        .await
        .unwrap();

    // Type filter
    let page = ingress
        .list(&ListFilter::new().with_task_type("summarize"))
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].task_id, "sum-0");

    // State filter matches everything (all PENDING)
    let page = ingress
        .list(&ListFilter::new().with_state(TaskState::Pending).with_page(1, 100))
        .await
        .unwrap();
    assert_eq!(page.total, 6);

    // Paging
    let page = ingress
        .list(&ListFilter::new().with_page(2, 4))
        .await
        .unwrap();
    assert_eq!(page.total, 6);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.page, 2);

    // Past the end
    let page = ingress
        .list(&ListFilter::new().with_page(9, 4))
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.total, 6);
}

#[tokio::test]
async fn test_list_sort_orders() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    for name in ["one", "two", "three"] {
        ingress
            .submit("echo", "p", None, Some(name.to_string()))
            .await
            .unwrap();
        // created_at has microsecond precision; keep submissions apart
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let mut filter = ListFilter::new().with_page(1, 10);
    filter.sort = SortOrder::CreatedAsc;
    let ascending = ingress.list(&filter).await.unwrap();
    assert_eq!(ascending.items[0].task_id, "one");
    assert_eq!(ascending.items[2].task_id, "three");

    filter.sort = SortOrder::CreatedDesc;
    let descending = ingress.list(&filter).await.unwrap();
    assert_eq!(descending.items[0].task_id, "three");
}

#[tokio::test]
async fn test_retry_from_failed_resets_budget() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    ingress
        .submit("echo", "p", Some(3), Some("t1".to_string()))
        .await
        .unwrap();
    broker
        .store
        .list_pop_right(keys::PRIMARY_QUEUE)
        .await
        .unwrap();
    broker
        .repo
        .transition("t1", TaskState::Pending, TaskState::Active, &[], &[], None)
        .await
        .unwrap();
    broker
        .repo
        .transition(
            "t1",
            TaskState::Active,
            TaskState::Failed,
            &[("retry_count", "2".to_string())],
            &[],
            None,
        )
        .await
        .unwrap();

    assert_eq!(ingress.retry("t1").await.unwrap(), RetryOutcome::Requeued);

    let record = ingress.get("t1").await.unwrap();
    assert_eq!(record.state, TaskState::Pending);
    assert_eq!(record.retry_count, 0);
    assert_eq!(broker.store.list_len(keys::RETRY_QUEUE).await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_twice_is_equivalent_to_once() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    ingress
        .submit("echo", "p", Some(3), Some("t1".to_string()))
        .await
        .unwrap();
    broker
        .store
        .list_pop_right(keys::PRIMARY_QUEUE)
        .await
        .unwrap();
    broker
        .repo
        .transition("t1", TaskState::Pending, TaskState::Active, &[], &[], None)
        .await
        .unwrap();
    broker
        .repo
        .transition("t1", TaskState::Active, TaskState::Failed, &[], &[], None)
        .await
        .unwrap();

    assert_eq!(ingress.retry("t1").await.unwrap(), RetryOutcome::Requeued);
    assert_eq!(
        ingress.retry("t1").await.unwrap(),
        RetryOutcome::AlreadyQueued
    );

    // No duplicate queue entry, budget still reset
    assert_eq!(broker.store.list_len(keys::RETRY_QUEUE).await.unwrap(), 1);
    let record = ingress.get("t1").await.unwrap();
    assert_eq!(record.retry_count, 0);
}

#[tokio::test]
async fn test_retry_from_dlq_drops_copy_and_membership() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    ingress
        .submit("echo", "p", Some(0), Some("t1".to_string()))
        .await
        .unwrap();
    broker
        .store
        .list_pop_right(keys::PRIMARY_QUEUE)
        .await
        .unwrap();
    broker
        .repo
        .transition("t1", TaskState::Pending, TaskState::Active, &[], &[], None)
        .await
        .unwrap();
    broker
        .repo
        .transition(
            "t1",
            TaskState::Active,
            TaskState::Dlq,
            &[],
            &[QueueOp::PushDlq],
            None,
        )
        .await
        .unwrap();

    assert_eq!(ingress.retry("t1").await.unwrap(), RetryOutcome::Requeued);

    assert_eq!(broker.store.list_len(keys::DLQ_LIST).await.unwrap(), 0);
    let copy = broker.store.hash_get_all(&keys::dlq_task("t1")).await.unwrap();
    assert!(copy.is_empty(), "DLQ copy must be dropped on retry");

    let snapshot = broker.repo.queue_snapshot().await.unwrap();
    assert_eq!(snapshot.counts.dlq, 0);
    assert_eq!(snapshot.counts.pending, 1);
}

#[tokio::test]
async fn test_retry_rejected_for_wrong_states() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    ingress
        .submit("echo", "p", None, Some("t1".to_string()))
        .await
        .unwrap();
    broker
        .store
        .list_pop_right(keys::PRIMARY_QUEUE)
        .await
        .unwrap();
    broker
        .repo
        .transition("t1", TaskState::Pending, TaskState::Active, &[], &[], None)
        .await
        .unwrap();
    broker
        .repo
        .transition("t1", TaskState::Active, TaskState::Completed, &[], &[], None)
        .await
        .unwrap();

    let err = ingress.retry("t1").await.unwrap_err();
    assert_eq!(err.code(), "Conflict");
}

#[tokio::test]
async fn test_requeue_orphaned_scans_all_records() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    // Two orphans, one healthy queued task
    let orphans = [test_utils::task_id("orphan"), test_utils::task_id("orphan")];
    for task_id in &orphans {
        ingress
            .submit("echo", "p", None, Some(task_id.clone()))
            .await
            .unwrap();
    }
    ingress
        .submit("echo", "p", None, Some(test_utils::task_id("queued")))
        .await
        .unwrap();
    for task_id in &orphans {
        broker.store.list_remove(keys::PRIMARY_QUEUE, task_id).await.unwrap();
    }

    assert_eq!(ingress.requeue_orphaned().await.unwrap(), 2);
    assert_eq!(broker.store.list_len(keys::RETRY_QUEUE).await.unwrap(), 2);

    // Second sweep finds nothing
    assert_eq!(ingress.requeue_orphaned().await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_removes_queue_membership() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    ingress
        .submit("echo", "p", None, Some("t1".to_string()))
        .await
        .unwrap();
    ingress.delete("t1").await.unwrap();

    assert_eq!(ingress.get("t1").await.unwrap_err().code(), "NotFound");
    assert_eq!(broker.store.list_len(keys::PRIMARY_QUEUE).await.unwrap(), 0);

    let status = ingress.queue_status().await.unwrap();
    assert_eq!(status.snapshot.counts.total(), 0);
}

#[tokio::test]
async fn test_queue_status_reports_ratio() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    let status = ingress.queue_status().await.unwrap();
    assert_eq!(status.retry_ratio, 0.30);
    assert_eq!(status.snapshot.depths.primary, 0);

    ingress
        .submit("echo", "p", None, Some("t1".to_string()))
        .await
        .unwrap();
    let status = ingress.queue_status().await.unwrap();
    assert_eq!(status.snapshot.depths.primary, 1);
    assert_eq!(status.snapshot.counts.pending, 1);
}

#[tokio::test]
async fn test_dlq_list_newest_first() {
    let broker = TestBroker::new().await;
    let ingress = broker.ingress(registry());

    for task_id in ["d1", "d2"] {
        ingress
            .submit("echo", "p", Some(0), Some(task_id.to_string()))
            .await
            .unwrap();
        broker
            .store
            .list_pop_right(keys::PRIMARY_QUEUE)
            .await
            .unwrap();
        broker
            .repo
            .transition(task_id, TaskState::Pending, TaskState::Active, &[], &[], None)
            .await
            .unwrap();
        broker
            .repo
            .transition(
                task_id,
                TaskState::Active,
                TaskState::Dlq,
                &[],
                &[QueueOp::PushDlq],
                None,
            )
            .await
            .unwrap();
    }

    let entries = ingress.dlq_list(10).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].task_id, "d2");
    assert_eq!(entries[1].task_id, "d1");
    assert!(entries.iter().all(|entry| entry.state == TaskState::Dlq));
}
