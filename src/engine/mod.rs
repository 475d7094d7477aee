// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine.
//!
//! The [`SyncEngine`] ties the queue, node directory, entity handlers, retry
//! manager, conflict resolver and transport together:
//!
//! - producers call [`SyncEngine::enqueue`] and friends
//! - the run loop calls [`SyncEngine::tick`] on a fixed interval
//! - local nodes push changes through [`SyncEngine::receive_from_local`]
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Recovering → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sync_reconciler::{Collaborators, EngineState, HttpTransport, SyncEngine, SyncEngineConfig};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SyncEngineConfig::default();
//! let transport = Arc::new(HttpTransport::from_config(&config).expect("client"));
//! let (_tx, rx) = watch::channel(config.clone());
//! let mut engine = SyncEngine::new(config, rx, Collaborators::new(transport));
//!
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! // engine.start().await.expect("Start failed");
//! // assert!(engine.is_ready());
//! # }
//! ```

mod types;
mod api;
mod lifecycle;
mod processor;

pub use types::{
    BatchItemError, BatchReceipt, EngineState, EnqueueReceipt, FanoutReceipt, InboundChange,
    ReceiveOutcome, SkipReason, SyncToAllOptions, TickReport,
};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};

use crate::apply::{EntityApplier, NoopApplier};
use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::SyncEngineConfig;
use crate::conflict::ConflictResolver;
use crate::gate::{AlwaysAllow, DegradedModeGate};
use crate::handlers::{EntityHandler, HandlerRegistry};
use crate::node::health::HealthMonitor;
use crate::node::NodeDirectory;
use crate::queue::{MemoryQueue, QueueStore};
use crate::resilience::circuit_breaker::NodeCircuits;
use crate::stats::SyncStats;
use crate::transport::NodeTransport;

/// External collaborators the engine talks to.
///
/// Only the transport is mandatory; the rest default to an allow-all gate,
/// an audit sink that writes to `tracing`, and an applier that discards.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn NodeTransport>,
    pub applier: Arc<dyn EntityApplier>,
    pub audit: Arc<dyn AuditSink>,
    pub gate: Arc<dyn DegradedModeGate>,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn NodeTransport>) -> Self {
        Self {
            transport,
            applier: Arc::new(NoopApplier),
            audit: Arc::new(TracingAuditSink),
            gate: Arc::new(AlwaysAllow),
        }
    }

    #[must_use]
    pub fn with_applier(mut self, applier: Arc<dyn EntityApplier>) -> Self {
        self.applier = applier;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn with_gate(mut self, gate: Arc<dyn DegradedModeGate>) -> Self {
        self.gate = gate;
        self
    }
}

/// Main reconciliation engine.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; wrap it in an `Arc` to share it between the
/// run loop and request handlers.
pub struct SyncEngine {
    /// Configuration (can be updated at runtime via watch channel)
    pub(super) config: RwLock<SyncEngineConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: Mutex<watch::Receiver<SyncEngineConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Operation queue. In-memory until `start` connects a durable one.
    pub(super) queue: Arc<dyn QueueStore>,

    pub(super) nodes: Arc<NodeDirectory>,
    pub(super) handlers: HandlerRegistry,
    pub(super) transport: Arc<dyn NodeTransport>,
    pub(super) applier: Arc<dyn EntityApplier>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) gate: Arc<dyn DegradedModeGate>,
    pub(super) health: HealthMonitor,
    pub(super) conflicts: ConflictResolver,

    /// One breaker per node
    pub(super) circuits: NodeCircuits,

    pub(super) stats: SyncStats,

    /// Set while a tick is in flight
    pub(super) tick_running: AtomicBool,
}

impl SyncEngine {
    /// Create a new engine backed by an in-memory queue.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to connect the durable queue (if `queue_url` is set), recover
    /// interrupted work and transition to `Ready`.
    pub fn new(
        config: SyncEngineConfig,
        config_rx: watch::Receiver<SyncEngineConfig>,
        collaborators: Collaborators,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let nodes = Arc::new(NodeDirectory::new());
        let health = HealthMonitor::new(
            nodes.clone(),
            collaborators.transport.clone(),
            collaborators.audit.clone(),
        );

        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            queue: Arc::new(MemoryQueue::new()),
            nodes,
            handlers: HandlerRegistry::new(),
            transport: collaborators.transport,
            applier: collaborators.applier,
            audit: collaborators.audit,
            gate: collaborators.gate,
            health,
            conflicts: ConflictResolver::new(),
            circuits: NodeCircuits::default(),
            stats: SyncStats::new(),
            tick_running: AtomicBool::new(false),
        }
    }

    /// Use `queue` instead of the in-memory default. `start` will not
    /// replace it.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn QueueStore>) -> Self {
        self.queue = queue;
        self
    }

    /// Use a custom circuit breaker configuration for node dispatch.
    #[must_use]
    pub fn with_circuits(mut self, circuits: NodeCircuits) -> Self {
        self.circuits = circuits;
        self
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is ready to accept requests.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Snapshot of the live configuration.
    #[must_use]
    pub fn config(&self) -> SyncEngineConfig {
        self.config.read().clone()
    }

    /// Register the handler for `entity_type`, replacing any previous one.
    pub fn register_handler(&self, entity_type: impl Into<String>, handler: Arc<dyn EntityHandler>) {
        self.handlers.register(entity_type, handler);
    }

    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Name of the queue backend in use ("memory", "sqlite", "mysql").
    #[must_use]
    pub fn queue_backend(&self) -> &'static str {
        self.queue.backend()
    }
}
