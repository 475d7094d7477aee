// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process statistics behind `SyncEngine::statistics`.
//!
//! These are cumulative since engine construction and independent of the
//! `metrics` exporter, so callers can read them without one installed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy)]
struct NodeCounters {
    attempts: u64,
    successes: u64,
    failures: u64,
    total_latency_ms: u64,
    last_latency_ms: u64,
}

#[derive(Debug, Default)]
pub struct SyncStats {
    total_enqueued: AtomicU64,
    total_synced: AtomicU64,
    total_failed: AtomicU64,
    total_retries: AtomicU64,
    total_conflicts: AtomicU64,
    total_received: AtomicU64,
    ticks: AtomicU64,
    ticks_skipped: AtomicU64,
    last_tick_ms: AtomicU64,
    last_tick_processed: AtomicU64,
    last_tick_at: AtomicI64,
    nodes: DashMap<String, NodeCounters>,
}

impl SyncStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, count: u64) {
        self.total_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_synced(&self) {
        self.total_synced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.total_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick(&self, duration: Duration, processed: u64, now: i64) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.last_tick_ms.store(duration.as_millis() as u64, Ordering::Relaxed);
        self.last_tick_processed.store(processed, Ordering::Relaxed);
        self.last_tick_at.store(now, Ordering::Relaxed);
    }

    pub fn record_tick_skipped(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// One dispatch attempt to `node_id`.
    pub fn record_dispatch(&self, node_id: &str, success: bool, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        let mut counters = self.nodes.entry(node_id.to_string()).or_default();
        counters.attempts += 1;
        if success {
            counters.successes += 1;
        } else {
            counters.failures += 1;
        }
        counters.total_latency_ms += latency_ms;
        counters.last_latency_ms = latency_ms;
    }

    pub fn forget_node(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    #[must_use]
    pub fn snapshot(&self) -> Statistics {
        let last_tick_ms = self.last_tick_ms.load(Ordering::Relaxed);
        let last_tick_processed = self.last_tick_processed.load(Ordering::Relaxed);
        let throughput_per_sec = if last_tick_ms > 0 {
            last_tick_processed as f64 * 1000.0 / last_tick_ms as f64
        } else {
            0.0
        };

        let per_node = self
            .nodes
            .iter()
            .map(|entry| {
                let c = *entry.value();
                let (success_rate, avg_latency_ms) = if c.attempts > 0 {
                    (
                        c.successes as f64 / c.attempts as f64,
                        c.total_latency_ms as f64 / c.attempts as f64,
                    )
                } else {
                    (0.0, 0.0)
                };
                (
                    entry.key().clone(),
                    NodeStatistics {
                        attempts: c.attempts,
                        successes: c.successes,
                        failures: c.failures,
                        success_rate,
                        avg_latency_ms,
                        last_latency_ms: c.last_latency_ms,
                    },
                )
            })
            .collect();

        Statistics {
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_synced: self.total_synced.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            total_conflicts: self.total_conflicts.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            last_tick_ms,
            last_tick_processed,
            last_tick_at: match self.last_tick_at.load(Ordering::Relaxed) {
                0 => None,
                at => Some(at),
            },
            throughput_per_sec,
            per_node,
        }
    }
}

/// Per-node dispatch figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatistics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// successes / attempts, 0.0 with no attempts
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub last_latency_ms: u64,
}

/// Point-in-time view returned by `SyncEngine::statistics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub total_enqueued: u64,
    pub total_synced: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub total_conflicts: u64,
    pub total_received: u64,
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub last_tick_ms: u64,
    pub last_tick_processed: u64,
    pub last_tick_at: Option<i64>,
    /// Operations per second over the last tick.
    pub throughput_per_sec: f64,
    pub per_node: BTreeMap<String, NodeStatistics>,
}
