//! SQL queue backend tests against a file-backed SQLite database.
//!
//! Each test gets its own database under a temp dir, so they run in
//! parallel without interfering. MySQL uses the same statements with `?`
//! placeholders and is not exercised here.
//!
//! Run with: `cargo test --test sql_queue`

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

use sync_reconciler::{
    Collaborators, Direction, MemoryAuditSink, NodeOutcome, NodeRegistration, NodeTransport,
    OperationKind, OperationRequest, OperationStatus, Partition, QueueFilter, QueueStore,
    SqlQueue, SyncEngine, SyncEngineConfig, SyncError, SyncOperation,
};

// =============================================================================
// Helpers
// =============================================================================

fn sqlite_url(dir: &TempDir, name: &str) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join(name).display())
}

async fn open(dir: &TempDir) -> SqlQueue {
    SqlQueue::connect(&sqlite_url(dir, "queue.db")).await.unwrap()
}

fn request(node: &str, priority: i32) -> OperationRequest {
    OperationRequest::new(OperationKind::Update, "guard", "G1", json!({"name": "Ada"}))
        .to_node(node)
        .with_priority(priority)
}

async fn insert(queue: &SqlQueue, req: OperationRequest, created_at: i64) -> SyncOperation {
    queue
        .insert(SyncOperation::from_request(req, created_at))
        .await
        .unwrap()
}

fn n1() -> Partition {
    Partition::Node("N1".into())
}

// =============================================================================
// Storage round trip
// =============================================================================

#[tokio::test]
async fn test_insert_and_get_preserve_every_field() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    assert_eq!(queue.backend(), "sql");

    let parent = insert(&queue, request("N1", 5), 10).await;
    let mut req = request("N1", 8)
        .depends_on(parent.id)
        .with_checksum(sync_reconciler::checksum::compute(&json!({"name": "Ada"})));
    req.batch_id = Some("batch-1".into());
    let child = insert(&queue, req, 20).await;
    assert!(child.seq > parent.seq);

    let stored = queue.get(child.id).await.unwrap().unwrap();
    assert_eq!(stored.id, child.id);
    assert_eq!(stored.node_id.as_deref(), Some("N1"));
    assert_eq!(stored.operation_kind, OperationKind::Update);
    assert_eq!(stored.payload, json!({"name": "Ada"}));
    assert_eq!(stored.priority, 8);
    assert_eq!(stored.direction, Direction::CentralToLocal);
    assert_eq!(stored.depends_on, vec![parent.id]);
    assert_eq!(stored.checksum, child.checksum);
    assert_eq!(stored.status, OperationStatus::Pending);
    assert_eq!(stored.created_at, 20);
    assert_eq!(stored.batch_id.as_deref(), Some("batch-1"));

    assert!(queue.get(sync_reconciler::OperationId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_queue_survives_reconnect() {
    let dir = TempDir::new().unwrap();
    let id = {
        let queue = open(&dir).await;
        insert(&queue, request("N1", 5), 0).await.id
    };

    let reopened = open(&dir).await;
    let stored = reopened.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Pending);
}

#[tokio::test]
async fn test_node_outcomes_round_trip() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    let op = insert(
        &queue,
        OperationRequest::new(OperationKind::Sync, "guard", "G1", json!({})),
        0,
    )
    .await;

    let outcomes = vec![
        NodeOutcome {
            node_id: "N1".into(),
            accepted: true,
            error: None,
            latency_ms: 12,
            attempted_at: 5,
        },
        NodeOutcome {
            node_id: "N2".into(),
            accepted: false,
            error: Some("timed out".into()),
            latency_ms: 200,
            attempted_at: 5,
        },
    ];
    queue.set_node_outcomes(op.id, &outcomes).await.unwrap();

    let stored = queue.get(op.id).await.unwrap().unwrap();
    assert_eq!(stored.node_outcomes, outcomes);
}

// =============================================================================
// Ordering and eligibility
// =============================================================================

#[tokio::test]
async fn test_priority_then_fifo() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    let mut ids = Vec::new();
    for (i, priority) in [5, 9, 5, 1].into_iter().enumerate() {
        ids.push(insert(&queue, request("N1", priority), i as i64).await.id);
    }

    let batch = queue.next_batch(&n1(), 10, 100).await.unwrap();
    let order: Vec<_> = batch.iter().map(|op| op.id).collect();
    assert_eq!(order, vec![ids[1], ids[0], ids[2], ids[3]]);

    assert_eq!(queue.next_batch(&n1(), 2, 100).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_partitions_are_disjoint() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    insert(&queue, request("N1", 5), 0).await;
    insert(&queue, request("N2", 5), 0).await;
    let broadcast = insert(
        &queue,
        OperationRequest::new(OperationKind::Sync, "site", "S1", json!({})),
        0,
    )
    .await;

    assert_eq!(queue.next_batch(&n1(), 10, 0).await.unwrap().len(), 1);
    let batch = queue.next_batch(&Partition::Broadcast, 10, 0).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, broadcast.id);
}

#[tokio::test]
async fn test_dependency_gating() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    let parent = insert(&queue, request("N1", 1), 0).await;
    let child = insert(&queue, request("N1", 9).depends_on(parent.id), 1).await;

    let batch = queue.next_batch(&n1(), 10, 0).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, parent.id);

    assert!(queue.mark_processing(parent.id, 0).await.unwrap());
    queue.mark_completed(parent.id, 1).await.unwrap();

    let batch = queue.next_batch(&n1(), 10, 2).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, child.id);
}

#[tokio::test]
async fn test_claim_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(open(&dir).await);
    let op = insert(&queue, request("N1", 5), 0).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move { queue.mark_processing(op.id, 0).await.unwrap() }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

// =============================================================================
// Transitions
// =============================================================================

#[tokio::test]
async fn test_retry_schedule_and_failure() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    let op = insert(&queue, request("N1", 5), 0).await;

    assert!(queue.mark_processing(op.id, 0).await.unwrap());
    assert_eq!(queue.schedule_retry(op.id, 1_000, "timed out", 0).await.unwrap(), 1);

    let stored = queue.get(op.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::RetryScheduled);
    assert_eq!(stored.next_attempt_at, Some(1_000));
    assert_eq!(stored.last_error.as_deref(), Some("timed out"));

    assert!(queue.next_batch(&n1(), 10, 999).await.unwrap().is_empty());
    assert!(!queue.mark_processing(op.id, 999).await.unwrap());
    assert!(queue.mark_processing(op.id, 1_000).await.unwrap());

    queue.mark_failed(op.id, "node rejected payload", 1_001).await.unwrap();
    let stored = queue.get(op.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert!(!queue.mark_processing(op.id, 2_000).await.unwrap());
}

#[tokio::test]
async fn test_transitions_require_processing() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    let op = insert(&queue, request("N1", 5), 0).await;

    let err = queue.mark_completed(op.id, 1).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidTransition { .. }));

    assert!(queue.mark_processing(op.id, 0).await.unwrap());
    queue.mark_completed(op.id, 5).await.unwrap();
    let stored = queue.get(op.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Completed);
    assert_eq!(stored.acknowledged_at, Some(5));
}

// =============================================================================
// Lookups used by the engine
// =============================================================================

#[tokio::test]
async fn test_find_newer_outbound_and_blocked() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    insert(&queue, request("N1", 5), 100).await;
    let newest = insert(&queue, request("N2", 5), 200).await;
    insert(
        &queue,
        request("N1", 5).with_direction(Direction::LocalToCentral),
        300,
    )
    .await;

    let found = queue.find_newer_outbound("guard", "G1", 150).await.unwrap().unwrap();
    assert_eq!(found.id, newest.id);
    assert!(queue.find_newer_outbound("guard", "G1", 200).await.unwrap().is_none());

    let child = insert(&queue, request("N2", 5).depends_on(newest.id), 400).await;
    queue.mark_processing(newest.id, 0).await.unwrap();
    queue.mark_failed(newest.id, "checksum", 0).await.unwrap();

    let blocked = queue.blocked_by_failure(10).await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].0.id, child.id);
    assert_eq!(blocked[0].1, newest.id);

    let statuses = queue.statuses(&[newest.id, child.id]).await.unwrap();
    assert_eq!(statuses[&newest.id], OperationStatus::Failed);
    assert_eq!(statuses[&child.id], OperationStatus::Pending);
}

#[tokio::test]
async fn test_query_filters_pages_and_histogram() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    for i in 0..5 {
        insert(&queue, request("N1", 5), i).await;
    }
    insert(&queue, request("N2", 5), 10).await;

    let first = queue.next_batch(&n1(), 1, 0).await.unwrap()[0].id;
    queue.mark_processing(first, 0).await.unwrap();
    queue.mark_failed(first, "boom", 0).await.unwrap();

    let page = queue
        .query(&QueueFilter::for_node("N1").with_status(OperationStatus::Pending).with_page(1, 3))
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.items.len(), 3);
    assert_eq!(page.items[0].created_at, 4);
    assert_eq!(page.count(OperationStatus::Pending), 4);
    assert_eq!(page.count(OperationStatus::Failed), 1);

    let all = queue.query(&QueueFilter::default()).await.unwrap();
    assert_eq!(all.total, 6);
}

#[tokio::test]
async fn test_query_far_past_last_page_is_empty() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    insert(&queue, request("N1", 5), 0).await;

    let page = queue
        .query(&QueueFilter::default().with_page(usize::MAX, 50))
        .await
        .unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.total, 1);
    assert_eq!(page.page, sync_reconciler::queue::MAX_PAGE);
    assert_eq!(page.count(OperationStatus::Pending), 1);
}

#[tokio::test]
async fn test_release_returns_claim_to_pending() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    let op = insert(&queue, request("N1", 5), 0).await;

    assert!(!queue.release(op.id).await.unwrap());
    assert!(queue.mark_processing(op.id, 0).await.unwrap());
    assert!(queue.release(op.id).await.unwrap());

    let stored = queue.get(op.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OperationStatus::Pending);
    assert!(stored.processed_at.is_none());
    assert_eq!(stored.retry_count, 0);
    assert_eq!(queue.next_batch(&n1(), 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_purge_and_recover() {
    let dir = TempDir::new().unwrap();
    let queue = open(&dir).await;
    let old_done = insert(&queue, request("N1", 5), 0).await;
    let referenced = insert(&queue, request("N1", 5), 0).await;
    let live = insert(&queue, request("N1", 5).depends_on(referenced.id), 0).await;
    for id in [old_done.id, referenced.id] {
        queue.mark_processing(id, 0).await.unwrap();
        queue.mark_failed(id, "x", 10).await.unwrap();
    }

    assert_eq!(queue.purge_terminal(100).await.unwrap(), 1);
    assert!(queue.get(old_done.id).await.unwrap().is_none());
    assert!(queue.get(referenced.id).await.unwrap().is_some());

    queue.mark_processing(live.id, 0).await.unwrap();
    assert_eq!(queue.recover_interrupted().await.unwrap(), 1);
    assert_eq!(
        queue.get(live.id).await.unwrap().unwrap().status,
        OperationStatus::Pending
    );
}

// =============================================================================
// Engine on SQL
// =============================================================================

struct AlwaysUp;

#[async_trait::async_trait]
impl NodeTransport for AlwaysUp {
    async fn dispatch(
        &self,
        _node: &sync_reconciler::LocalNode,
        _envelope: &sync_reconciler::Envelope,
    ) -> Result<(), sync_reconciler::TransportError> {
        Ok(())
    }

    async fn probe(&self, _node: &sync_reconciler::LocalNode) -> Result<(), sync_reconciler::TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_engine_start_connects_configured_queue() {
    let dir = TempDir::new().unwrap();
    let config = SyncEngineConfig {
        queue_url: Some(sqlite_url(&dir, "engine.db")),
        entity_types: vec!["guard".into()],
        ..Default::default()
    };
    let (_tx, rx) = watch::channel(config.clone());
    let collaborators =
        Collaborators::new(Arc::new(AlwaysUp)).with_audit(Arc::new(MemoryAuditSink::new()));
    let mut engine = SyncEngine::new(config, rx, collaborators);
    engine.start().await.unwrap();
    assert_eq!(engine.queue_backend(), "sql");

    engine.register_node(NodeRegistration::new("N1", "north", "http://n1.local"));
    let receipt = engine.enqueue(request("N1", 7)).await.unwrap();
    let report = engine.tick().await;
    assert_eq!(report.completed, 1);

    let op = engine.operation(receipt.id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    engine.shutdown().await;
}
