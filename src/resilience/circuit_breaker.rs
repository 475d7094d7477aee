// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-node circuit breakers using the recloser crate.
//!
//! A node that keeps failing dispatches gets its circuit tripped, and
//! further dispatches fail fast (as a transient `NodeUnavailable`) instead
//! of each burning a full processing timeout. The circuit is dropped when
//! the node is re-registered or removed.
//!
//! States:
//! - Closed: dispatches pass through
//! - Open: dispatches are rejected without touching the network
//! - HalfOpen: a few trial dispatches decide whether to close again

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Circuit open; the call was never made.
    #[error("circuit open, dispatch rejected")]
    Rejected,

    #[error("dispatch failed: {0}")]
    Inner(#[source] E),
}

/// Tripping policy shared by every node's circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure rate (0.0 - 1.0) at which the circuit opens
    pub error_rate: f32,
    /// Dispatches observed while closed before the rate is evaluated
    pub window: u32,
    /// Trial dispatches allowed while half-open
    pub half_open_calls: u32,
    /// How long an open circuit rejects before going half-open
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.5,
            window: 20,
            half_open_calls: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of one node's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Failed dispatches since the last success.
    pub consecutive_failures: u32,
    /// Dispatches refused while open, over the circuit's lifetime.
    pub rejections: u64,
}

pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.error_rate)
            .closed_len(config.window.max(1) as usize)
            .half_open_len(config.half_open_calls.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last state observed through calls. recloser does not expose its
    /// state, so a rejection means open and a success means closed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    fn observe(&self, state: CircuitState) {
        let previous = CircuitState::from_u8(self.state.swap(state as u8, Ordering::Relaxed));
        if previous == state {
            return;
        }
        crate::metrics::set_circuit_state(&self.name, state as u8);
        match state {
            CircuitState::Open => warn!(circuit = %self.name, "Circuit open, dispatches rejected"),
            _ => info!(circuit = %self.name, from = %previous, to = %state, "Circuit state changed"),
        }
    }

    /// Run `f` through the breaker. When the circuit is open, `f`'s future
    /// is dropped unpolled.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.inner.call(f()).await {
            Ok(result) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.observe(CircuitState::Closed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                self.observe(CircuitState::Open);
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(circuit = %self.name, failures, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }
}

/// Lazily created circuit per node id.
pub struct NodeCircuits {
    config: CircuitConfig,
    circuits: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for NodeCircuits {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl NodeCircuits {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Circuit for `node_id`, created on first use.
    pub fn for_node(&self, node_id: &str) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(format!("node:{node_id}"), &self.config)))
            .clone()
    }

    /// Drop a node's circuit (node removed or re-registered).
    pub fn reset(&self, node_id: &str) {
        self.circuits.remove(node_id);
    }

    /// Snapshot of every node dispatched to so far, sorted by node id.
    #[must_use]
    pub fn snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        let mut all: Vec<(String, CircuitSnapshot)> = self
            .circuits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
