//! Public types for the reconciliation engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conflict::{ConflictRecord, Resolution};
use crate::operation::{Direction, OperationId, OperationKind, OperationStatus, DEFAULT_PRIORITY};

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to the durable queue
    Connecting,
    /// Resetting operations interrupted by the previous shutdown
    Recovering,
    /// Ready to accept work
    Ready,
    /// Run loop active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Returned by `enqueue` and `broadcast_to_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub id: OperationId,
    pub status: OperationStatus,
    pub created_at: i64,
}

/// A rejected item of `enqueue_batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemError {
    /// Position in the submitted batch.
    pub index: usize,
    /// Machine-readable error kind.
    pub kind: String,
    pub error: String,
}

/// Per-item report of `enqueue_batch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub succeeded: Vec<EnqueueReceipt>,
    pub failed: Vec<BatchItemError>,
}

impl BatchReceipt {
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Options for `sync_to_all_nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncToAllOptions {
    #[serde(default = "default_kind")]
    pub operation_kind: OperationKind,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub depends_on: Vec<OperationId>,
    /// Only nodes in this scope.
    #[serde(default)]
    pub geo_scope: Option<String>,
}

fn default_kind() -> OperationKind { OperationKind::Sync }
fn default_priority() -> i32 { DEFAULT_PRIORITY }
fn default_direction() -> Direction { Direction::CentralToLocal }

impl Default for SyncToAllOptions {
    fn default() -> Self {
        Self {
            operation_kind: default_kind(),
            priority: default_priority(),
            direction: default_direction(),
            depends_on: Vec::new(),
            geo_scope: None,
        }
    }
}

/// Returned by `sync_to_all_nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutReceipt {
    pub enqueued_count: usize,
    pub node_ids: Vec<String>,
    pub operation_ids: Vec<OperationId>,
    pub batch_id: String,
}

/// A change submitted by a local node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundChange {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default = "default_kind")]
    pub operation_kind: OperationKind,
    pub payload: Value,
    #[serde(default)]
    pub checksum: Option<String>,
    /// When the node made the change (epoch millis).
    pub local_timestamp: i64,
}

/// Returned by `receive_from_local`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiveOutcome {
    /// The change was applied to the central store.
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Journal entry of an applied change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_id: Option<OperationId>,
}

/// Why a tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The degraded-mode gate refused the sync action.
    Degraded,
    /// A previous tick is still running.
    InFlight,
    ShuttingDown,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Degraded => "degraded",
            Self::InFlight => "in_flight",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Summary of one processor tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub skipped: Option<SkipReason>,
    pub reachable_nodes: usize,
    /// Operations claimed into `Processing`.
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Engine-level error that cut the tick short.
    pub error: Option<String>,
    pub duration: Duration,
}

impl TickReport {
    pub(super) fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn ran(&self) -> bool {
        self.skipped.is_none()
    }

    pub(super) fn absorb(&mut self, outcome: OpOutcome) {
        match outcome {
            OpOutcome::Lost => return,
            OpOutcome::Completed => self.completed += 1,
            OpOutcome::Retried => self.retried += 1,
            OpOutcome::Failed => self.failed += 1,
        }
        self.claimed += 1;
    }

    pub(super) fn merge(&mut self, other: TickReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.retried += other.retried;
        self.failed += other.failed;
        if self.error.is_none() {
            self.error = other.error;
        }
    }
}

/// What happened to one operation in a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum OpOutcome {
    Completed,
    Retried,
    Failed,
    /// Another claimant got it first.
    Lost,
}
