// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{QueueFilter, QueuePage, QueueStore};
use crate::error::{Result, SyncError};
use crate::operation::{
    Direction, NodeOutcome, OperationId, OperationStatus, Partition, SyncOperation,
};

/// In-process queue. Every transition happens under one write lock, which
/// makes the claim a plain compare-and-set.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    ops: RwLock<HashMap<OperationId, SyncOperation>>,
    seq: AtomicU64,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.read().is_empty()
    }
}

fn not_found(id: OperationId) -> SyncError {
    SyncError::NotFound(format!("operation {id}"))
}

/// Borrow an operation that must currently be `Processing`.
fn processing_mut(
    ops: &mut HashMap<OperationId, SyncOperation>,
    id: OperationId,
    to: OperationStatus,
) -> Result<&mut SyncOperation> {
    let op = ops.get_mut(&id).ok_or_else(|| not_found(id))?;
    if op.status != OperationStatus::Processing {
        return Err(SyncError::InvalidTransition {
            id,
            from: op.status,
            to,
        });
    }
    Ok(op)
}

fn deps_completed(ops: &HashMap<OperationId, SyncOperation>, op: &SyncOperation) -> bool {
    op.depends_on.iter().all(|dep| {
        ops.get(dep)
            .is_some_and(|d| d.status == OperationStatus::Completed)
    })
}

#[async_trait]
impl QueueStore for MemoryQueue {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, mut op: SyncOperation) -> Result<SyncOperation> {
        let mut ops = self.ops.write();
        if ops.contains_key(&op.id) {
            return Err(SyncError::Storage(format!("duplicate operation id {}", op.id)));
        }
        op.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        ops.insert(op.id, op.clone());
        Ok(op)
    }

    async fn get(&self, id: OperationId) -> Result<Option<SyncOperation>> {
        Ok(self.ops.read().get(&id).cloned())
    }

    async fn next_batch(
        &self,
        partition: &Partition,
        limit: usize,
        now: i64,
    ) -> Result<Vec<SyncOperation>> {
        let _timer = crate::metrics::LatencyTimer::new("memory", "next_batch");
        let ops = self.ops.read();
        let mut batch: Vec<SyncOperation> = ops
            .values()
            .filter(|op| partition.matches(op.node_id.as_deref()))
            .filter(|op| op.is_due(now))
            .filter(|op| deps_completed(&ops, op))
            .cloned()
            .collect();
        batch.sort_by_key(SyncOperation::dispatch_order);
        batch.truncate(limit);
        Ok(batch)
    }

    async fn mark_processing(&self, id: OperationId, now: i64) -> Result<bool> {
        let mut ops = self.ops.write();
        match ops.get_mut(&id) {
            Some(op) if op.is_due(now) => {
                op.status = OperationStatus::Processing;
                op.processed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, id: OperationId, now: i64) -> Result<()> {
        let mut ops = self.ops.write();
        let op = processing_mut(&mut ops, id, OperationStatus::Completed)?;
        op.status = OperationStatus::Completed;
        op.processed_at = Some(now);
        op.acknowledged_at = Some(now);
        op.next_attempt_at = None;
        op.last_error = None;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: OperationId,
        not_before: i64,
        error: &str,
        now: i64,
    ) -> Result<u32> {
        let mut ops = self.ops.write();
        let op = processing_mut(&mut ops, id, OperationStatus::RetryScheduled)?;
        op.status = OperationStatus::RetryScheduled;
        op.retry_count = op.retry_count.saturating_add(1);
        op.next_attempt_at = Some(not_before);
        op.last_error = Some(error.to_string());
        op.processed_at = Some(now);
        Ok(op.retry_count)
    }

    async fn mark_failed(&self, id: OperationId, error: &str, now: i64) -> Result<()> {
        let mut ops = self.ops.write();
        let op = processing_mut(&mut ops, id, OperationStatus::Failed)?;
        op.status = OperationStatus::Failed;
        op.last_error = Some(error.to_string());
        op.processed_at = Some(now);
        op.next_attempt_at = None;
        Ok(())
    }

    async fn release(&self, id: OperationId) -> Result<bool> {
        let mut ops = self.ops.write();
        match ops.get_mut(&id) {
            Some(op) if op.status == OperationStatus::Processing => {
                op.status = OperationStatus::Pending;
                op.processed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_node_outcomes(&self, id: OperationId, outcomes: &[NodeOutcome]) -> Result<()> {
        let mut ops = self.ops.write();
        let op = ops.get_mut(&id).ok_or_else(|| not_found(id))?;
        op.node_outcomes = outcomes.to_vec();
        Ok(())
    }

    async fn statuses(&self, ids: &[OperationId]) -> Result<HashMap<OperationId, OperationStatus>> {
        let ops = self.ops.read();
        Ok(ids
            .iter()
            .filter_map(|id| ops.get(id).map(|op| (*id, op.status)))
            .collect())
    }

    async fn find_newer_outbound(
        &self,
        entity_type: &str,
        entity_id: &str,
        since: i64,
    ) -> Result<Option<SyncOperation>> {
        let ops = self.ops.read();
        Ok(ops
            .values()
            .filter(|op| {
                op.direction == Direction::CentralToLocal
                    && op.entity_type == entity_type
                    && op.entity_id == entity_id
                    && op.created_at > since
                    && matches!(
                        op.status,
                        OperationStatus::Pending
                            | OperationStatus::Processing
                            | OperationStatus::Completed
                    )
            })
            .max_by_key(|op| (op.created_at, op.seq))
            .cloned())
    }

    async fn blocked_by_failure(&self, limit: usize) -> Result<Vec<(SyncOperation, OperationId)>> {
        let ops = self.ops.read();
        let mut blocked: Vec<(SyncOperation, OperationId)> = ops
            .values()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::RetryScheduled
                )
            })
            .filter_map(|op| {
                op.depends_on
                    .iter()
                    .find(|dep| ops.get(dep).is_some_and(|d| d.status == OperationStatus::Failed))
                    .map(|dep| (op.clone(), *dep))
            })
            .collect();
        blocked.sort_by_key(|(op, _)| op.dispatch_order());
        blocked.truncate(limit);
        Ok(blocked)
    }

    async fn query(&self, filter: &QueueFilter) -> Result<QueuePage> {
        let (page, page_size) = filter.paging();
        let ops = self.ops.read();

        let mut histogram = BTreeMap::new();
        let mut matched: Vec<&SyncOperation> = Vec::new();
        for op in ops.values().filter(|op| filter.matches_scope(op)) {
            *histogram.entry(op.status).or_insert(0u64) += 1;
            if filter.status.map_or(true, |s| op.status == s) {
                matched.push(op);
            }
        }
        matched.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));

        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(filter.offset())
            .take(page_size)
            .cloned()
            .collect();

        Ok(QueuePage {
            items,
            total,
            page,
            page_size,
            histogram,
        })
    }

    async fn purge_terminal(&self, older_than: i64) -> Result<u64> {
        let mut ops = self.ops.write();
        let referenced: HashSet<OperationId> = ops
            .values()
            .filter(|op| !op.status.is_terminal())
            .flat_map(|op| op.depends_on.iter().copied())
            .collect();

        let before = ops.len();
        ops.retain(|id, op| {
            let last_touched = op.processed_at.unwrap_or(op.created_at);
            !(op.status.is_terminal() && last_touched < older_than && !referenced.contains(id))
        });
        Ok((before - ops.len()) as u64)
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        let mut ops = self.ops.write();
        let mut recovered = 0;
        for op in ops.values_mut() {
            if op.status == OperationStatus::Processing && op.processed_at.is_none() {
                op.status = OperationStatus::Pending;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, OperationRequest};
    use serde_json::json;
    use std::sync::Arc;

    fn request(node: &str, priority: i32) -> OperationRequest {
        OperationRequest::new(OperationKind::Update, "guard", "G1", json!({"p": priority}))
            .to_node(node)
            .with_priority(priority)
    }

    async fn insert(queue: &MemoryQueue, req: OperationRequest, created_at: i64) -> SyncOperation {
        queue
            .insert(SyncOperation::from_request(req, created_at))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryQueue::new();
        let mut ids = Vec::new();
        for (i, priority) in [5, 9, 5, 1].into_iter().enumerate() {
            ids.push(insert(&queue, request("N1", priority), i as i64).await.id);
        }

        let batch = queue.next_batch(&Partition::Node("N1".into()), 10, 100).await.unwrap();
        let order: Vec<OperationId> = batch.iter().map(|op| op.id).collect();
        assert_eq!(order, vec![ids[1], ids[0], ids[2], ids[3]]);
    }

    #[tokio::test]
    async fn test_partitions_are_disjoint() {
        let queue = MemoryQueue::new();
        insert(&queue, request("N1", 5), 0).await;
        insert(&queue, request("N2", 5), 0).await;
        insert(
            &queue,
            OperationRequest::new(OperationKind::Sync, "guard", "G1", json!({})),
            0,
        )
        .await;

        assert_eq!(queue.next_batch(&Partition::Node("N1".into()), 10, 0).await.unwrap().len(), 1);
        let broadcast = queue.next_batch(&Partition::Broadcast, 10, 0).await.unwrap();
        assert_eq!(broadcast.len(), 1);
        assert!(broadcast[0].is_broadcast());
    }

    #[tokio::test]
    async fn test_limit_is_respected() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            insert(&queue, request("N1", 5), i).await;
        }
        assert_eq!(queue.next_batch(&Partition::Node("N1".into()), 2, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dependency_gating() {
        let queue = MemoryQueue::new();
        let parent = insert(&queue, request("N1", 1), 0).await;
        let child = insert(&queue, request("N1", 9).depends_on(parent.id), 1).await;

        let batch = queue.next_batch(&Partition::Node("N1".into()), 10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, parent.id);

        assert!(queue.mark_processing(parent.id, 0).await.unwrap());
        queue.mark_completed(parent.id, 1).await.unwrap();

        let batch = queue.next_batch(&Partition::Node("N1".into()), 10, 2).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, child.id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let queue = Arc::new(MemoryQueue::new());
        let op = insert(&queue, request("N1", 5), 0).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
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

    #[tokio::test]
    async fn test_retry_not_eligible_before_due() {
        let queue = MemoryQueue::new();
        let op = insert(&queue, request("N1", 5), 0).await;
        assert!(queue.mark_processing(op.id, 0).await.unwrap());
        assert_eq!(queue.schedule_retry(op.id, 1_000, "timeout", 0).await.unwrap(), 1);

        let partition = Partition::Node("N1".into());
        assert!(queue.next_batch(&partition, 10, 999).await.unwrap().is_empty());
        assert!(!queue.mark_processing(op.id, 999).await.unwrap());
        assert_eq!(queue.next_batch(&partition, 10, 1_000).await.unwrap().len(), 1);
        assert!(queue.mark_processing(op.id, 1_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_keeps_retry_count() {
        let queue = MemoryQueue::new();
        let op = insert(&queue, request("N1", 5), 0).await;
        assert!(queue.mark_processing(op.id, 0).await.unwrap());
        queue.schedule_retry(op.id, 0, "timeout", 0).await.unwrap();
        assert!(queue.mark_processing(op.id, 0).await.unwrap());

        assert!(queue.release(op.id).await.unwrap());
        assert!(!queue.release(op.id).await.unwrap());

        let stored = queue.get(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.processed_at.is_none());
    }

    #[tokio::test]
    async fn test_transitions_require_processing() {
        let queue = MemoryQueue::new();
        let op = insert(&queue, request("N1", 5), 0).await;

        let err = queue.mark_completed(op.id, 1).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { from: OperationStatus::Pending, .. }));

        assert!(queue.mark_processing(op.id, 0).await.unwrap());
        queue.mark_completed(op.id, 5).await.unwrap();
        let stored = queue.get(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);
        assert_eq!(stored.acknowledged_at, Some(5));

        assert!(!queue.mark_processing(op.id, 10).await.unwrap());
        assert!(queue.mark_failed(op.id, "x", 10).await.is_err());
        assert!(matches!(
            queue.mark_failed(OperationId::new(), "x", 0).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_find_newer_outbound() {
        let queue = MemoryQueue::new();
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
        assert!(queue.find_newer_outbound("guard", "G2", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_dependency_is_reported() {
        let queue = MemoryQueue::new();
        let parent = insert(&queue, request("N1", 5), 0).await;
        let child = insert(&queue, request("N1", 5).depends_on(parent.id), 1).await;
        queue.mark_processing(parent.id, 0).await.unwrap();
        queue.mark_failed(parent.id, "checksum", 0).await.unwrap();

        let blocked = queue.blocked_by_failure(10).await.unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].0.id, child.id);
        assert_eq!(blocked[0].1, parent.id);
    }

    #[tokio::test]
    async fn test_query_pages_newest_first_with_histogram() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            insert(&queue, request("N1", 5), i).await;
        }
        let first = queue.next_batch(&Partition::Node("N1".into()), 1, 0).await.unwrap()[0].id;
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

        let page2 = queue
            .query(&QueueFilter::for_node("N1").with_status(OperationStatus::Pending).with_page(2, 3))
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_keeps_live_and_referenced() {
        let queue = MemoryQueue::new();
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
        assert!(queue.get(live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let queue = MemoryQueue::new();
        let op = insert(&queue, request("N1", 5), 0).await;
        queue.mark_processing(op.id, 0).await.unwrap();

        assert_eq!(queue.recover_interrupted().await.unwrap(), 1);
        assert_eq!(queue.get(op.id).await.unwrap().unwrap().status, OperationStatus::Pending);
        assert_eq!(queue.recover_interrupted().await.unwrap(), 0);
    }
}
