//! # Sync Reconciler
//!
//! Central-to-local reconciliation engine for a fleet of intermittently
//! connected nodes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Producers                            │
//! │  • enqueue / enqueue_batch / broadcast / sync_to_all_nodes  │
//! │  • validation + checksum at the door                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Durable Priority Queue                    │
//! │  • SQLite/MySQL (or in-memory) operation store              │
//! │  • priority DESC, then FIFO, per node partition             │
//! │  • dependency gating, retry scheduling                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     (tick: claim → frame → dispatch)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Node Transport                          │
//! │  • per-node circuit breakers and timeouts                   │
//! │  • broadcast fan-out with per-node outcomes                 │
//! │  • health probes mark silent nodes inactive                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                     (receive_from_local)
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Local Nodes                           │
//! │  • inbound changes checked against newer central work       │
//! │  • CentralWins / LocalWins / Manual conflict policies       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sync_reconciler::{
//!     Collaborators, HttpTransport, NodeRegistration, OperationKind, OperationRequest,
//!     SyncEngine, SyncEngineConfig,
//! };
//! use serde_json::json;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncEngineConfig {
//!         queue_url: Some("sqlite://sync_queue.db?mode=rwc".into()),
//!         entity_types: vec!["guard".into()],
//!         ..Default::default()
//!     };
//!
//!     let transport = Arc::new(HttpTransport::from_config(&config).expect("http client"));
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let mut engine = SyncEngine::new(config, rx, Collaborators::new(transport));
//!     engine.start().await.expect("Failed to start");
//!
//!     engine.register_node(NodeRegistration::new("N1", "north", "http://10.0.0.5:8080"));
//!
//!     let request = OperationRequest::new(OperationKind::Update, "guard", "G1", json!({"name": "Ada"}))
//!         .to_node("N1")
//!         .with_priority(8);
//!     engine.enqueue(request).await.expect("Failed to enqueue");
//!
//!     let report = engine.tick().await;
//!     println!("completed {}", report.completed);
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`SyncEngineConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`engine`]: The main [`SyncEngine`] orchestrating all components
//! - [`queue`]: Operation store contract, SQL and in-memory backends
//! - [`node`]: Node directory and health probing
//! - [`transport`]: Envelope framing and the HTTP node transport
//! - [`conflict`]: Inbound conflict detection policies
//! - [`resilience`]: Circuit breakers, backoff and retry management
//! - [`handlers`]: Per-entity validation and field transforms

pub mod config;
pub mod error;
pub mod operation;
pub mod checksum;
pub mod compression;
pub mod handlers;
pub mod node;
pub mod queue;
pub mod resilience;
pub mod conflict;
pub mod transport;
pub mod audit;
pub mod gate;
pub mod apply;
pub mod stats;
pub mod engine;
pub mod metrics;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::SyncEngineConfig;
pub use error::{ErrorCategory, Result, SyncError};
pub use operation::{
    Direction, NodeOutcome, OperationId, OperationKind, OperationRequest, OperationStatus,
    Partition, SyncOperation,
};
pub use engine::{
    BatchItemError, BatchReceipt, Collaborators, EngineState, EnqueueReceipt, FanoutReceipt,
    InboundChange, ReceiveOutcome, SkipReason, SyncEngine, SyncToAllOptions, TickReport,
};
pub use queue::{MemoryQueue, QueueFilter, QueuePage, QueueStore, SqlQueue};
pub use node::{LocalNode, NodeDirectory, NodeRegistration, NodeStatus};
pub use conflict::{ConflictRecord, ConflictStrategy, Resolution};
pub use transport::{Envelope, HttpTransport, NodeTransport, TransportError};
pub use handlers::{EntityHandler, FieldPolicyHandler, HandlerRegistry};
pub use audit::{AuditEvent, AuditSeverity, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use gate::{AlwaysAllow, DegradedModeGate, DegradedModeState, OperatingMode};
pub use apply::{EntityApplier, NoopApplier};
pub use stats::{NodeStatistics, Statistics};
pub use resilience::circuit_breaker::{
    CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot, CircuitState, NodeCircuits,
};
pub use resilience::retry::{BackoffPolicy, RetryConfig, RetryDecision, RetryManager};
pub use metrics::LatencyTimer;
