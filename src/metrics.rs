// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the reconciler.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `sync_reconciler_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `node`: target node id, or `broadcast`
//! - `entity_type`: entity tag of the operation
//! - `category`: validation, integrity, transient, conflict, engine

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE - Operation lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Record an accepted enqueue
pub fn record_enqueued(entity_type: &str, broadcast: bool) {
    counter!(
        "sync_reconciler_enqueued_total",
        "entity_type" => entity_type.to_string(),
        "target" => if broadcast { "broadcast" } else { "node" }
    )
    .increment(1);
}

/// Record an enqueue rejected by validation
pub fn record_enqueue_rejected(kind: &str) {
    counter!(
        "sync_reconciler_enqueue_rejected_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an operation reaching `Completed`
pub fn record_completed(node: &str, entity_type: &str) {
    counter!(
        "sync_reconciler_completed_total",
        "node" => node.to_string(),
        "entity_type" => entity_type.to_string()
    )
    .increment(1);
}

/// Record an operation reaching terminal `Failed`
pub fn record_failed(node: &str, category: &str) {
    counter!(
        "sync_reconciler_failed_total",
        "node" => node.to_string(),
        "category" => category.to_string()
    )
    .increment(1);
}

/// Record a retry being scheduled
pub fn record_retry_scheduled(node: &str, attempt: u32) {
    counter!(
        "sync_reconciler_retries_total",
        "node" => node.to_string()
    )
    .increment(1);
    histogram!("sync_reconciler_retry_attempt").record(attempt as f64);
}

/// Set queue depth per status
pub fn set_queue_depth(status: &str, count: usize) {
    gauge!(
        "sync_reconciler_queue_depth",
        "status" => status.to_string()
    )
    .set(count as f64);
}

/// Record retention cleanup
pub fn record_purged(count: u64) {
    counter!("sync_reconciler_purged_total").increment(count);
}

/// Record operations reset at startup
pub fn record_recovered(count: u64) {
    counter!("sync_reconciler_recovered_total").increment(count);
}

/// Record a claim handed back to the queue after an engine error
pub fn record_released(node: &str) {
    counter!("sync_reconciler_released_total", "node" => node.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// DISPATCH - Transport to nodes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a dispatch attempt and its latency
pub fn record_dispatch(node: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "error" };
    counter!(
        "sync_reconciler_dispatch_total",
        "node" => node.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "sync_reconciler_dispatch_seconds",
        "node" => node.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a dispatch cut off by the processing timeout
pub fn record_dispatch_timeout(node: &str) {
    counter!(
        "sync_reconciler_dispatch_timeouts_total",
        "node" => node.to_string()
    )
    .increment(1);
}

/// Record a compressed envelope body
pub fn record_compression(original_bytes: usize, compressed_bytes: usize) {
    counter!("sync_reconciler_compressed_envelopes_total").increment(1);
    histogram!("sync_reconciler_envelope_bytes", "form" => "raw").record(original_bytes as f64);
    histogram!("sync_reconciler_envelope_bytes", "form" => "compressed").record(compressed_bytes as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// INTEGRITY & CONFLICTS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a checksum mismatch (always an alerting signal)
pub fn record_checksum_mismatch() {
    counter!("sync_reconciler_checksum_mismatches_total").increment(1);
}

/// Record a detected conflict and how it was resolved
pub fn record_conflict(resolution: &str) {
    counter!(
        "sync_reconciler_conflicts_total",
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

/// Record an inbound change from a local node
pub fn record_inbound(status: &str) {
    counter!(
        "sync_reconciler_inbound_total",
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// NODES
// ═══════════════════════════════════════════════════════════════════════════

/// Set number of nodes considered reachable by the last tick
pub fn set_reachable_nodes(count: usize) {
    gauge!("sync_reconciler_reachable_nodes").set(count as f64);
}

/// Record a node status transition (active/inactive)
pub fn record_node_transition(node: &str, to: &str) {
    counter!(
        "sync_reconciler_node_transitions_total",
        "node" => node.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record a health probe outcome
pub fn record_probe(node: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "sync_reconciler_probes_total",
        "node" => node.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "sync_reconciler_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "sync_reconciler_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE - Ticks and lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed tick
pub fn record_tick(duration: Duration, processed: usize) {
    counter!("sync_reconciler_ticks_total").increment(1);
    histogram!("sync_reconciler_tick_seconds").record(duration.as_secs_f64());
    histogram!("sync_reconciler_tick_operations").record(processed as f64);
}

/// Record a tick that did not run
pub fn record_tick_skipped(reason: &str) {
    counter!(
        "sync_reconciler_ticks_skipped_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an engine-level error that aborted a tick
pub fn record_tick_error(kind: &str) {
    counter!(
        "sync_reconciler_tick_errors_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record SQL queue connection failures
pub fn record_connection_error(backend: &str) {
    counter!(
        "sync_reconciler_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "sync_reconciler_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "sync_reconciler_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records queue call latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "sync_reconciler_queue_seconds",
            "backend" => self.backend,
            "operation" => self.operation
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
