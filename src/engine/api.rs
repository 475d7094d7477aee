//! Producer, inbound and administrative API.
//!
//! Everything here is callable concurrently with the run loop.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{actions, AuditEvent, AuditSeverity};
use crate::conflict::{ConflictRecord, Resolution};
use crate::error::{Result, SyncError};
use crate::node::{LocalNode, NodeRegistration, NodeStatus};
use crate::operation::{
    now_millis, Direction, OperationId, OperationRequest, OperationStatus, SyncOperation,
    MAX_PRIORITY, MIN_PRIORITY,
};
use crate::queue::{QueueFilter, QueuePage};
use crate::resilience::circuit_breaker::CircuitSnapshot;
use crate::stats::Statistics;

use super::types::{
    BatchItemError, BatchReceipt, EnqueueReceipt, FanoutReceipt, InboundChange, ReceiveOutcome,
    SyncToAllOptions,
};
use super::SyncEngine;

impl SyncEngine {
    /// Validate a request and turn it into a pending operation.
    fn prepare(&self, mut request: OperationRequest, now: i64) -> Result<SyncOperation> {
        let checksum_on_enqueue = {
            let config = self.config.read();
            if !config.is_known_entity_type(&request.entity_type)
                && !self.handlers.contains(&request.entity_type)
            {
                return Err(SyncError::InvalidEntityType(request.entity_type));
            }
            config.checksum_on_enqueue
        };

        if request.entity_id.trim().is_empty() {
            let key = self
                .handlers
                .get(&request.entity_type)
                .and_then(|handler| handler.key_of(&request.payload))
                .filter(|key| !key.trim().is_empty());
            match key {
                Some(key) => {
                    debug!(entity_type = %request.entity_type, key = %key, "Entity id taken from payload key");
                    request.entity_id = key;
                }
                None => return Err(SyncError::InvalidData("entity_id must not be empty".into())),
            }
        }

        if let Some(node_id) = &request.node_id {
            if self.nodes.get(node_id).is_none() {
                return Err(SyncError::UnknownNode(node_id.clone()));
            }
        }

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&request.priority) {
            let clamped = request.priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
            debug!(requested = request.priority, clamped, "Priority clamped");
            request.priority = clamped;
        }

        match &request.checksum {
            Some(expected) => crate::checksum::verify(&request.payload, expected)?,
            None if checksum_on_enqueue => {
                request.checksum = Some(crate::checksum::compute(&request.payload));
            }
            None => {}
        }

        Ok(SyncOperation::from_request(request, now))
    }

    /// Every dependency must already be in the queue.
    async fn check_dependencies_exist(&self, op: &SyncOperation) -> Result<()> {
        if op.depends_on.is_empty() {
            return Ok(());
        }
        let known = self.queue.statuses(&op.depends_on).await?;
        match op.depends_on.iter().find(|id| !known.contains_key(id)) {
            Some(missing) => Err(SyncError::InvalidData(format!("unknown dependency {missing}"))),
            None => Ok(()),
        }
    }

    async fn insert_validated(&self, request: OperationRequest) -> Result<SyncOperation> {
        let op = self.prepare(request, now_millis())?;
        self.check_dependencies_exist(&op).await?;
        let stored = self.queue.insert(op).await?;
        self.stats.record_enqueued(1);
        crate::metrics::record_enqueued(&stored.entity_type, stored.is_broadcast());
        Ok(stored)
    }

    /// Add one operation to the queue.
    ///
    /// Fails with `InvalidEntityType` for unknown entity types,
    /// `UnknownNode` for unregistered targets, and `ChecksumMismatch` when a
    /// supplied checksum does not match the payload.
    #[tracing::instrument(skip(self, request), fields(entity_type = %request.entity_type, entity_id = %request.entity_id))]
    pub async fn enqueue(&self, request: OperationRequest) -> Result<EnqueueReceipt> {
        let stored = match self.insert_validated(request).await {
            Ok(op) => op,
            Err(e) => {
                crate::metrics::record_enqueue_rejected(e.kind());
                return Err(e);
            }
        };

        self.audit.log_activity(
            AuditEvent::new(actions::SYNC_ENQUEUED)
                .with("operation_id", stored.id.to_string())
                .with("operation_kind", stored.operation_kind.as_str())
                .with("entity_type", stored.entity_type.as_str())
                .with("entity_id", stored.entity_id.as_str())
                .with("node_id", stored.node_id.clone().unwrap_or_else(|| "*".into()))
                .with("priority", stored.priority),
        );
        debug!(op_id = %stored.id, priority = stored.priority, "Operation enqueued");

        Ok(EnqueueReceipt {
            id: stored.id,
            status: stored.status,
            created_at: stored.created_at,
        })
    }

    /// Enqueue many operations. Each item succeeds or fails on its own; all
    /// accepted items share one batch id.
    #[tracing::instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn enqueue_batch(&self, requests: Vec<OperationRequest>) -> BatchReceipt {
        let batch_id = Uuid::now_v7().to_string();
        let mut receipt = BatchReceipt {
            batch_id: batch_id.clone(),
            succeeded: Vec::with_capacity(requests.len()),
            failed: Vec::new(),
        };

        for (index, mut request) in requests.into_iter().enumerate() {
            request.batch_id.get_or_insert_with(|| batch_id.clone());
            match self.insert_validated(request).await {
                Ok(op) => receipt.succeeded.push(EnqueueReceipt {
                    id: op.id,
                    status: op.status,
                    created_at: op.created_at,
                }),
                Err(e) => {
                    crate::metrics::record_enqueue_rejected(e.kind());
                    receipt.failed.push(BatchItemError {
                        index,
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.audit.log_activity(
            AuditEvent::new(actions::SYNC_BATCH_ENQUEUED)
                .with("batch_id", batch_id.as_str())
                .with("succeeded", receipt.succeeded.len())
                .with("failed", receipt.failed.len()),
        );
        info!(
            batch_id = %batch_id,
            succeeded = receipt.succeeded.len(),
            failed = receipt.failed.len(),
            "Batch enqueued"
        );
        receipt
    }

    /// Enqueue one operation for every reachable node. Any target set on the
    /// request is dropped.
    pub async fn broadcast_to_all(&self, mut request: OperationRequest) -> Result<EnqueueReceipt> {
        request.node_id = None;
        self.enqueue(request).await
    }

    /// Enqueue one targeted operation per active node, optionally limited
    /// to a geographic scope.
    #[tracing::instrument(skip(self, payload, options))]
    pub async fn sync_to_all_nodes(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: serde_json::Value,
        options: SyncToAllOptions,
    ) -> Result<FanoutReceipt> {
        let targets: Vec<LocalNode> = self
            .nodes
            .active()
            .into_iter()
            .filter(|node| {
                options
                    .geo_scope
                    .as_deref()
                    .map_or(true, |scope| node.geo_scope == scope)
            })
            .collect();

        let batch_id = Uuid::now_v7().to_string();
        let mut receipt = FanoutReceipt {
            enqueued_count: 0,
            node_ids: Vec::with_capacity(targets.len()),
            operation_ids: Vec::with_capacity(targets.len()),
            batch_id: batch_id.clone(),
        };

        for node in targets {
            let mut request =
                OperationRequest::new(options.operation_kind, entity_type, entity_id, payload.clone())
                    .to_node(node.node_id.as_str())
                    .with_priority(options.priority)
                    .with_direction(options.direction);
            request.depends_on = options.depends_on.clone();
            request.batch_id = Some(batch_id.clone());

            let op = self.insert_validated(request).await?;
            receipt.enqueued_count += 1;
            receipt.node_ids.push(node.node_id);
            receipt.operation_ids.push(op.id);
        }

        if receipt.enqueued_count > 0 {
            self.audit.log_activity(
                AuditEvent::new(actions::SYNC_BATCH_ENQUEUED)
                    .with("batch_id", batch_id.as_str())
                    .with("entity_type", entity_type)
                    .with("entity_id", entity_id)
                    .with("succeeded", receipt.enqueued_count)
                    .with("node_ids", receipt.node_ids.clone()),
            );
        }
        debug!(nodes = receipt.enqueued_count, "Fan-out enqueued");
        Ok(receipt)
    }

    /// Accept a change made on a local node.
    ///
    /// The change is checked against its checksum and the entity handler,
    /// then against newer central operations on the same entity. With no
    /// conflict (or `LocalWins`) it is applied and journalled as a completed
    /// `LocalToCentral` operation.
    #[tracing::instrument(skip(self, change), fields(entity_type = %change.entity_type, entity_id = %change.entity_id))]
    pub async fn receive_from_local(&self, node_id: &str, change: InboundChange) -> Result<ReceiveOutcome> {
        let now = now_millis();
        match self.nodes.get(node_id) {
            Some(node) if node.status == NodeStatus::Active => {}
            _ => {
                let err = SyncError::UnknownNode(node_id.to_string());
                self.reject_inbound(node_id, &change, &err);
                return Err(err);
            }
        }
        self.nodes.touch(node_id, now);

        let (strategy, known_type) = {
            let config = self.config.read();
            (config.conflict_strategy, config.is_known_entity_type(&change.entity_type))
        };

        if let Some(expected) = &change.checksum {
            if let Err(err) = crate::checksum::verify(&change.payload, expected) {
                self.audit.log_activity(
                    AuditEvent::new(actions::CHECKSUM_MISMATCH)
                        .severity(AuditSeverity::Critical)
                        .with("node_id", node_id)
                        .with("entity_type", change.entity_type.as_str())
                        .with("entity_id", change.entity_id.as_str())
                        .with("direction", Direction::LocalToCentral.as_str()),
                );
                self.reject_inbound(node_id, &change, &err);
                return Err(err);
            }
        }

        let payload = match self.handlers.get(&change.entity_type) {
            Some(handler) => {
                if let Err(reason) = handler.validate(&change.payload) {
                    let err = SyncError::InvalidData(reason);
                    self.reject_inbound(node_id, &change, &err);
                    return Err(err);
                }
                handler.transform(change.payload.clone(), Direction::LocalToCentral)
            }
            None if known_type => change.payload.clone(),
            None => {
                let err = SyncError::InvalidEntityType(change.entity_type.clone());
                self.reject_inbound(node_id, &change, &err);
                return Err(err);
            }
        };

        let competing = self
            .queue
            .find_newer_outbound(&change.entity_type, &change.entity_id, change.local_timestamp)
            .await?;

        let conflict = competing.map(|central| {
            let record = self.conflicts.resolve(strategy, node_id, &change, &central, now);
            self.record_conflict(&record);
            record
        });

        match conflict.as_ref().map(|r| r.resolution) {
            Some(Resolution::CentralPrevails) | Some(Resolution::Parked) => {
                crate::metrics::record_inbound("conflict");
                return Ok(ReceiveOutcome {
                    accepted: false,
                    resolution: conflict.as_ref().map(|r| r.resolution),
                    conflict,
                    journal_id: None,
                });
            }
            Some(Resolution::LocalApplied) | None => {}
        }

        let journal_id = self.apply_inbound(node_id, &change, payload, now).await?;
        Ok(ReceiveOutcome {
            accepted: true,
            resolution: conflict.as_ref().map(|r| r.resolution),
            conflict,
            journal_id: Some(journal_id),
        })
    }

    /// Apply an inbound change and journal it.
    async fn apply_inbound(
        &self,
        node_id: &str,
        change: &InboundChange,
        payload: serde_json::Value,
        now: i64,
    ) -> Result<OperationId> {
        if let Err(reason) = self
            .applier
            .apply(&change.entity_type, &change.entity_id, &payload, change.operation_kind)
            .await
        {
            crate::metrics::record_inbound("apply_failed");
            warn!(node_id, entity_id = %change.entity_id, error = %reason, "Inbound apply failed");
            return Err(SyncError::Apply(reason));
        }

        let checksum = crate::checksum::compute(&payload);
        let mut request =
            OperationRequest::new(change.operation_kind, change.entity_type.as_str(), change.entity_id.as_str(), payload)
                .to_node(node_id)
                .with_direction(Direction::LocalToCentral)
                .with_checksum(checksum);
        request.priority = crate::operation::DEFAULT_PRIORITY;

        let mut journal = SyncOperation::from_request(request, now);
        journal.status = OperationStatus::Completed;
        journal.processed_at = Some(now);
        journal.acknowledged_at = Some(now);
        let journal = self.queue.insert(journal).await?;

        self.stats.record_received();
        crate::metrics::record_inbound("applied");
        self.audit.log_activity(
            AuditEvent::new(actions::INBOUND_APPLIED)
                .with("operation_id", journal.id.to_string())
                .with("node_id", node_id)
                .with("entity_type", change.entity_type.as_str())
                .with("entity_id", change.entity_id.as_str())
                .with("operation_kind", change.operation_kind.as_str()),
        );
        debug!(node_id, op_id = %journal.id, "Inbound change applied");
        Ok(journal.id)
    }

    fn reject_inbound(&self, node_id: &str, change: &InboundChange, err: &SyncError) {
        crate::metrics::record_inbound("rejected");
        warn!(node_id, entity_id = %change.entity_id, error = %err, "Inbound change rejected");
        self.audit.log_activity(
            AuditEvent::new(actions::INBOUND_REJECTED)
                .severity(AuditSeverity::Warning)
                .with("node_id", node_id)
                .with("entity_type", change.entity_type.as_str())
                .with("entity_id", change.entity_id.as_str())
                .with("kind", err.kind())
                .with("error", err.to_string()),
        );
    }

    fn record_conflict(&self, record: &ConflictRecord) {
        self.stats.record_conflict();
        crate::metrics::record_conflict(record.resolution.as_str());
        info!(
            node_id = %record.node_id,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            strategy = record.strategy.as_str(),
            resolution = %record.resolution,
            "Conflict detected"
        );

        let action = if record.resolution == Resolution::Parked {
            actions::CONFLICT_PARKED
        } else {
            actions::CONFLICT_RESOLVED
        };
        self.audit.log_activity(
            AuditEvent::new(action)
                .severity(AuditSeverity::Warning)
                .with("conflict_id", record.id.to_string())
                .with("node_id", record.node_id.as_str())
                .with("entity_type", record.entity_type.as_str())
                .with("entity_id", record.entity_id.as_str())
                .with("local_timestamp", record.local_timestamp)
                .with("central_timestamp", record.central_timestamp)
                .with("central_operation_id", record.central_operation_id.to_string())
                .with("strategy", record.strategy.as_str())
                .with("resolution", record.resolution.as_str()),
        );
    }

    /// Parked conflicts awaiting review, oldest first.
    #[must_use]
    pub fn parked_conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.parked()
    }

    /// Settle a parked conflict. With `accept_local` the parked change is
    /// applied; otherwise it is discarded. A failed apply leaves the
    /// conflict parked.
    pub async fn resolve_parked(&self, conflict_id: Uuid, accept_local: bool) -> Result<Resolution> {
        let record = self
            .conflicts
            .take_parked(conflict_id)
            .ok_or_else(|| SyncError::NotFound(format!("parked conflict {conflict_id}")))?;

        let resolution = if accept_local {
            let change = InboundChange {
                entity_type: record.entity_type.clone(),
                entity_id: record.entity_id.clone(),
                operation_kind: record.operation_kind,
                payload: record.payload.clone(),
                checksum: None,
                local_timestamp: record.local_timestamp,
            };
            let payload = match self.handlers.get(&record.entity_type) {
                Some(handler) => handler.transform(record.payload.clone(), Direction::LocalToCentral),
                None => record.payload.clone(),
            };
            if let Err(e) = self
                .apply_inbound(&record.node_id, &change, payload, now_millis())
                .await
            {
                self.conflicts.restore(record);
                return Err(e);
            }
            Resolution::LocalApplied
        } else {
            Resolution::CentralPrevails
        };

        self.audit.log_activity(
            AuditEvent::new(actions::CONFLICT_RESOLVED)
                .with("conflict_id", record.id.to_string())
                .with("node_id", record.node_id.as_str())
                .with("entity_type", record.entity_type.as_str())
                .with("entity_id", record.entity_id.as_str())
                .with("strategy", record.strategy.as_str())
                .with("resolution", resolution.as_str())
                .with("reviewed", true),
        );
        info!(conflict_id = %conflict_id, resolution = %resolution, "Parked conflict resolved");
        Ok(resolution)
    }

    /// One page of the queue with a per-status histogram.
    pub async fn queue_status(&self, filter: &QueueFilter) -> Result<QueuePage> {
        let page = self.queue.query(filter).await?;
        if filter.node_id.is_none() && !filter.broadcast_only && filter.entity_type.is_none() {
            for status in OperationStatus::ALL {
                crate::metrics::set_queue_depth(status.as_str(), page.count(status) as usize);
            }
        }
        Ok(page)
    }

    pub async fn operation(&self, id: OperationId) -> Result<Option<SyncOperation>> {
        self.queue.get(id).await
    }

    /// Cumulative counters and per-node dispatch figures.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        self.stats.snapshot()
    }

    /// Delete completed and failed operations older than `retention_days`.
    /// Operations still named as a dependency of live work are kept.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_queue(&self, retention_days: u32) -> Result<u64> {
        let cutoff = now_millis().saturating_sub(i64::from(retention_days) * 86_400_000);
        let purged = self.queue.purge_terminal(cutoff).await?;
        crate::metrics::record_purged(purged);
        if purged > 0 {
            info!(purged, retention_days, "Queue cleanup");
            self.audit.log_activity(
                AuditEvent::new(actions::QUEUE_CLEANUP)
                    .with("purged", purged)
                    .with("retention_days", retention_days),
            );
        }
        Ok(purged)
    }

    // ---- node administration ----

    /// Register (or re-register) a node. Re-registration reactivates it.
    pub fn register_node(&self, registration: NodeRegistration) -> LocalNode {
        let node = self.nodes.register(registration, now_millis());
        self.circuits.reset(&node.node_id);
        info!(node_id = %node.node_id, geo_scope = %node.geo_scope, "Node registered");
        self.audit.log_activity(
            AuditEvent::new(actions::NODE_REGISTERED)
                .with("node_id", node.node_id.as_str())
                .with("geo_scope", node.geo_scope.as_str())
                .with("endpoint", node.endpoint.as_str()),
        );
        node
    }

    /// Remove a node. Its queued operations stay in the queue.
    pub fn remove_node(&self, node_id: &str) -> Option<LocalNode> {
        let node = self.nodes.remove(node_id)?;
        self.circuits.reset(node_id);
        self.stats.forget_node(node_id);
        info!(node_id, "Node removed");
        self.audit.log_activity(AuditEvent::new(actions::NODE_REMOVED).with("node_id", node_id));
        Some(node)
    }

    /// Force a node's status. Returns the previous status.
    pub fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<NodeStatus> {
        let previous = self
            .nodes
            .set_status(node_id, status)
            .ok_or_else(|| SyncError::UnknownNode(node_id.to_string()))?;

        if previous != status {
            crate::metrics::record_node_transition(node_id, &status.to_string());
            let action = match status {
                NodeStatus::Active => {
                    self.nodes.touch(node_id, now_millis());
                    actions::NODE_ONLINE
                }
                NodeStatus::Inactive => actions::NODE_OFFLINE,
            };
            self.audit.log_activity(
                AuditEvent::new(action)
                    .with("node_id", node_id)
                    .with("manual", true),
            );
        }
        Ok(previous)
    }

    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<LocalNode> {
        self.nodes.get(node_id)
    }

    /// All registered nodes, sorted by id.
    #[must_use]
    pub fn nodes(&self) -> Vec<LocalNode> {
        self.nodes.all()
    }

    /// Dispatch circuit of every node dispatched to since it registered.
    #[must_use]
    pub fn circuit_snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        self.circuits.snapshots()
    }
}
