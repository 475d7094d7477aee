//! Queue processor: one tick drains eligible work to reachable nodes.
//!
//! Per tick:
//!
//! 1. ask the degraded-mode gate; skip if `"sync"` is refused
//! 2. fail operations whose dependency failed permanently
//! 3. for each reachable node (concurrently), dispatch its targeted batch
//!    in order, one at a time
//! 4. dispatch the broadcast batch to every reachable node
//!
//! Each operation is claimed (`Processing`) before dispatch, so an
//! operation is never handed to two workers. A claim whose processing ends
//! in an engine error is released back to
//! `Pending` for a later tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::audit::{actions, AuditEvent, AuditSeverity};
use crate::config::SyncEngineConfig;
use crate::error::{ErrorCategory, Result, SyncError};
use crate::gate::SYNC_ACTION;
use crate::node::LocalNode;
use crate::operation::{now_millis, NodeOutcome, OperationId, Partition, SyncOperation};
use crate::queue::unmet_dependencies;
use crate::resilience::circuit_breaker::CircuitError;
use crate::resilience::retry::{BackoffPolicy, RetryDecision, RetryManager};
use crate::transport::{Envelope, TransportError};

use super::types::{EngineState, OpOutcome, SkipReason, TickReport};
use super::SyncEngine;

/// Holds the single-flight flag for the duration of a tick.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    /// Run one processing pass.
    ///
    /// Returns immediately with a skipped report when the gate refuses
    /// synchronization or another tick is still running. Engine-level
    /// errors end the tick early and are reported in
    /// [`TickReport::error`]; the next tick starts fresh.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> TickReport {
        if !self.gate.is_action_allowed(SYNC_ACTION) {
            return self.skip(SkipReason::Degraded);
        }
        if self.state() == EngineState::ShuttingDown {
            return self.skip(SkipReason::ShuttingDown);
        }
        let Some(_guard) = TickGuard::acquire(&self.tick_running) else {
            return self.skip(SkipReason::InFlight);
        };

        let start = Instant::now();
        let config = self.config.read().clone();
        let retry = RetryManager::new(BackoffPolicy::from_config(&config));

        let mut report = TickReport::default();
        if let Err(e) = self.run_tick(&config, &retry, &mut report).await {
            error!(error = %e, "Tick aborted");
            crate::metrics::record_tick_error(e.kind());
            report.error = Some(e.to_string());
        }
        report.duration = start.elapsed();

        self.stats
            .record_tick(report.duration, report.claimed as u64, now_millis());
        crate::metrics::record_tick(report.duration, report.claimed);
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                nodes = report.reachable_nodes,
                elapsed_ms = report.duration.as_millis() as u64,
                "Tick finished"
            );
        }
        report
    }

    fn skip(&self, reason: SkipReason) -> TickReport {
        debug!(reason = reason.as_str(), "Tick skipped");
        self.stats.record_tick_skipped();
        crate::metrics::record_tick_skipped(reason.as_str());
        TickReport::skipped(reason)
    }

    async fn run_tick(
        &self,
        config: &SyncEngineConfig,
        retry: &RetryManager,
        report: &mut TickReport,
    ) -> Result<()> {
        self.fail_blocked_dependents(config, retry, report).await?;

        let reachable = self.nodes.reachable(now_millis(), config.heartbeat_interval());
        report.reachable_nodes = reachable.len();
        crate::metrics::set_reachable_nodes(reachable.len());
        if reachable.is_empty() {
            return Ok(());
        }

        let node_reports = join_all(
            reachable
                .iter()
                .map(|node| self.process_node(node, config, retry)),
        )
        .await;
        for node_report in node_reports {
            report.merge(node_report);
        }

        let broadcasts = self
            .queue
            .next_batch(&Partition::Broadcast, config.batch_size, now_millis())
            .await?;
        for op in broadcasts {
            let outcome = self.process_broadcast(op, &reachable, config, retry).await?;
            report.absorb(outcome);
        }
        Ok(())
    }

    /// Fail work that waits on a permanently failed dependency.
    async fn fail_blocked_dependents(
        &self,
        config: &SyncEngineConfig,
        retry: &RetryManager,
        report: &mut TickReport,
    ) -> Result<()> {
        for (op, dependency) in self.queue.blocked_by_failure(config.batch_size).await? {
            if !self.queue.mark_processing(op.id, now_millis()).await? {
                continue;
            }
            let result = self
                .fail_operation(&op, SyncError::DependencyFailed { dependency }, retry)
                .await;
            report.absorb(self.release_on_error(&op, result).await?);
        }
        Ok(())
    }

    /// Drain one node's batch in dispatch order. Queue errors end this
    /// node's batch only.
    async fn process_node(
        &self,
        node: &LocalNode,
        config: &SyncEngineConfig,
        retry: &RetryManager,
    ) -> TickReport {
        let mut report = TickReport::default();
        let partition = Partition::Node(node.node_id.clone());

        let batch = match self.queue.next_batch(&partition, config.batch_size, now_millis()).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(node_id = %node.node_id, error = %e, "Failed to load node batch");
                report.error = Some(e.to_string());
                return report;
            }
        };

        for op in batch {
            match self.process_targeted(op, node, config, retry).await {
                Ok(outcome) => report.absorb(outcome),
                Err(e) => {
                    warn!(node_id = %node.node_id, error = %e, "Node batch aborted");
                    crate::metrics::record_tick_error(e.kind());
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }
        report
    }

    async fn process_targeted(
        &self,
        op: SyncOperation,
        node: &LocalNode,
        config: &SyncEngineConfig,
        retry: &RetryManager,
    ) -> Result<OpOutcome> {
        if !self.queue.mark_processing(op.id, now_millis()).await? {
            return Ok(OpOutcome::Lost);
        }
        let result = self.deliver_targeted(&op, node, config, retry).await;
        self.release_on_error(&op, result).await
    }

    async fn deliver_targeted(
        &self,
        op: &SyncOperation,
        node: &LocalNode,
        config: &SyncEngineConfig,
        retry: &RetryManager,
    ) -> Result<OpOutcome> {
        let envelope = match self.frame(op, config).await? {
            Ok(envelope) => envelope,
            Err(e) => return self.fail_operation(op, e, retry).await,
        };

        match self.dispatch(node, &envelope, config.processing_timeout()).await {
            Ok(()) => {
                self.complete(op, &[node.node_id.clone()]).await?;
                Ok(OpOutcome::Completed)
            }
            Err(e) => self.fail_operation(op, e, retry).await,
        }
    }

    async fn process_broadcast(
        &self,
        op: SyncOperation,
        reachable: &[LocalNode],
        config: &SyncEngineConfig,
        retry: &RetryManager,
    ) -> Result<OpOutcome> {
        if !self.queue.mark_processing(op.id, now_millis()).await? {
            return Ok(OpOutcome::Lost);
        }
        let result = self.deliver_broadcast(&op, reachable, config, retry).await;
        self.release_on_error(&op, result).await
    }

    async fn deliver_broadcast(
        &self,
        op: &SyncOperation,
        reachable: &[LocalNode],
        config: &SyncEngineConfig,
        retry: &RetryManager,
    ) -> Result<OpOutcome> {
        let envelope = match self.frame(op, config).await? {
            Ok(envelope) => envelope,
            Err(e) => return self.fail_operation(op, e, retry).await,
        };

        let timeout = config.processing_timeout();
        let envelope = &envelope;
        let results = join_all(reachable.iter().map(|node| async move {
            let attempted_at = now_millis();
            let started = Instant::now();
            let result = self.dispatch(node, envelope, timeout).await;
            NodeOutcome {
                node_id: node.node_id.clone(),
                accepted: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                latency_ms: started.elapsed().as_millis() as u64,
                attempted_at,
            }
        }))
        .await;

        self.queue.set_node_outcomes(op.id, &results).await?;
        let accepted: Vec<String> = results
            .iter()
            .filter(|o| o.accepted)
            .map(|o| o.node_id.clone())
            .collect();

        debug!(
            op_id = %op.id,
            attempted = results.len(),
            accepted = accepted.len(),
            "Broadcast dispatched"
        );

        if accepted.is_empty() {
            let err = SyncError::Transport(TransportError::Unreachable(format!(
                "no node accepted the broadcast ({} attempted)",
                results.len()
            )));
            return self.fail_operation(op, err, retry).await;
        }
        self.complete(op, &accepted).await?;
        Ok(OpOutcome::Completed)
    }

    /// Hand a claimed operation back to the queue when its processing ended
    /// in an engine error, so a later tick picks it up again. The error is
    /// passed through.
    async fn release_on_error(
        &self,
        op: &SyncOperation,
        result: Result<OpOutcome>,
    ) -> Result<OpOutcome> {
        if let Err(e) = &result {
            let node = op.node_id.as_deref().unwrap_or("broadcast");
            match self.queue.release(op.id).await {
                Ok(true) => {
                    crate::metrics::record_released(node);
                    warn!(op_id = %op.id, node_id = node, error = %e, "Claim released after engine error");
                }
                Ok(false) => {}
                Err(release_err) => error!(
                    op_id = %op.id,
                    node_id = node,
                    error = %release_err,
                    "Failed to release claim; it is recovered on next start"
                ),
            }
        }
        result
    }

    /// Check dependencies, integrity and entity rules, then frame the
    /// operation. The outer error is engine-level; the inner one belongs to
    /// the operation.
    async fn frame(
        &self,
        op: &SyncOperation,
        config: &SyncEngineConfig,
    ) -> Result<std::result::Result<Envelope, SyncError>> {
        if !op.depends_on.is_empty() {
            let statuses = self.queue.statuses(&op.depends_on).await?;
            if let Some(dependency) = op.depends_on.iter().copied().find(|dep| {
                statuses.get(dep) == Some(&crate::operation::OperationStatus::Failed)
            }) {
                return Ok(Err(SyncError::DependencyFailed { dependency }));
            }
            let pending = unmet_dependencies(op, &statuses);
            if !pending.is_empty() {
                return Ok(Err(SyncError::UnmetDependencies { pending }));
            }
        }

        if let Some(expected) = &op.checksum {
            if let Err(e) = crate::checksum::verify(&op.payload, expected) {
                return Ok(Err(e));
            }
        }

        let payload = match self.handlers.get(&op.entity_type) {
            Some(handler) => {
                if let Err(reason) = handler.validate(&op.payload) {
                    return Ok(Err(SyncError::InvalidData(reason)));
                }
                handler.transform(op.payload.clone(), op.direction)
            }
            None => op.payload.clone(),
        };

        Ok(Ok(Envelope::for_operation(
            op,
            payload,
            &config.central_node_id,
            now_millis(),
        )))
    }

    /// Send one envelope through the node's circuit breaker, bounded by
    /// `timeout`.
    async fn dispatch(&self, node: &LocalNode, envelope: &Envelope, timeout: Duration) -> Result<()> {
        let circuit = self.circuits.for_node(&node.node_id);
        let started = Instant::now();

        let result = circuit
            .call(move || async move {
                match tokio::time::timeout(timeout, self.transport.dispatch(node, envelope)).await {
                    Ok(result) => result.map_err(SyncError::from),
                    Err(_) => {
                        crate::metrics::record_dispatch_timeout(&node.node_id);
                        Err(SyncError::Timeout(timeout))
                    }
                }
            })
            .await;

        let elapsed = started.elapsed();
        let result = match result {
            Ok(()) => Ok(()),
            Err(CircuitError::Rejected) => Err(SyncError::NodeUnavailable(node.node_id.clone())),
            Err(CircuitError::Inner(e)) => Err(e),
        };
        self.stats.record_dispatch(&node.node_id, result.is_ok(), elapsed);
        crate::metrics::record_dispatch(&node.node_id, result.is_ok(), elapsed);
        result
    }

    async fn complete(&self, op: &SyncOperation, accepted_by: &[String]) -> Result<()> {
        let now = now_millis();
        self.queue.mark_completed(op.id, now).await?;

        for node_id in accepted_by {
            self.nodes.touch(node_id, now);
            if let Err(e) = self.applier.acknowledge(op, node_id).await {
                warn!(op_id = %op.id, node_id = %node_id, error = %e, "Acknowledge hook failed");
            }
            crate::metrics::record_completed(node_id, &op.entity_type);
        }

        self.stats.record_synced();
        self.audit.log_activity(
            AuditEvent::new(actions::SYNC_COMPLETED)
                .with("operation_id", op.id.to_string())
                .with("operation_kind", op.operation_kind.as_str())
                .with("entity_type", op.entity_type.as_str())
                .with("entity_id", op.entity_id.as_str())
                .with("node_ids", accepted_by.to_vec())
                .with("retry_count", op.retry_count),
        );
        debug!(op_id = %op.id, nodes = accepted_by.len(), "Operation completed");
        Ok(())
    }

    /// Hand a claimed operation's failure to the retry manager.
    async fn fail_operation(
        &self,
        op: &SyncOperation,
        err: SyncError,
        retry: &RetryManager,
    ) -> Result<OpOutcome> {
        let category = err.category();
        if category == ErrorCategory::Integrity {
            self.audit.log_activity(
                AuditEvent::new(actions::CHECKSUM_MISMATCH)
                    .severity(AuditSeverity::Critical)
                    .with("operation_id", op.id.to_string())
                    .with("entity_type", op.entity_type.as_str())
                    .with("entity_id", op.entity_id.as_str())
                    .with("error", err.to_string()),
            );
        }

        let decision = retry
            .handle_failure(self.queue.as_ref(), op, &err, now_millis())
            .await?;
        if let RetryDecision::Scheduled { .. } = decision {
            self.stats.record_retry();
            return Ok(OpOutcome::Retried);
        }

        let node = op.node_id.as_deref().unwrap_or("broadcast");
        self.stats.record_failed();
        crate::metrics::record_failed(node, category.as_str());

        let severity = match category {
            ErrorCategory::Integrity => AuditSeverity::Critical,
            _ => AuditSeverity::Warning,
        };
        let reason = match decision {
            RetryDecision::Exhausted => "retries_exhausted",
            _ => "non_retryable",
        };
        self.audit.log_activity(
            AuditEvent::new(actions::SYNC_FAILED)
                .severity(severity)
                .with("operation_id", op.id.to_string())
                .with("node_id", node)
                .with("entity_type", op.entity_type.as_str())
                .with("entity_id", op.entity_id.as_str())
                .with("category", category.as_str())
                .with("kind", err.kind())
                .with("reason", reason)
                .with("retry_count", op.retry_count)
                .with("error", err.to_string()),
        );
        warn!(op_id = %op.id, node_id = node, error = %err, reason, "Operation failed");
        Ok(OpOutcome::Failed)
    }

    /// Whether a tick is in flight right now.
    #[must_use]
    pub fn is_ticking(&self) -> bool {
        self.tick_running.load(Ordering::Acquire)
    }

    /// Ids currently blocked behind a failed dependency, with that
    /// dependency. Read-only; the next tick fails them.
    pub async fn blocked_operations(&self) -> Result<Vec<(OperationId, OperationId)>> {
        let limit = self.config.read().batch_size;
        Ok(self
            .queue
            .blocked_by_failure(limit)
            .await?
            .into_iter()
            .map(|(op, dep)| (op.id, dep))
            .collect())
    }
}
