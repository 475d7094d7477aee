// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync operation data model.
//!
//! A [`SyncOperation`] is the unit of work that flows through the queue. It is
//! either targeted at one local node or, with no `node_id`, broadcast to every
//! reachable node.
//!
//! # Example
//!
//! ```
//! use sync_reconciler::{OperationKind, OperationRequest};
//! use serde_json::json;
//!
//! let request = OperationRequest::new(OperationKind::Update, "guard", "G1", json!({"name": "Ada"}))
//!     .to_node("N1")
//!     .with_priority(8);
//!
//! assert_eq!(request.node_id.as_deref(), Some("N1"));
//! assert_eq!(request.priority, 8);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;

/// Default priority when the producer does not pick one.
pub const DEFAULT_PRIORITY: i32 = 5;
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Opaque operation identifier. UUIDv7, so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::InvalidData(format!("bad operation id '{s}': {e}")))
    }
}

/// What the operation does to the target entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Upsert.
    Sync,
    Bulk,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sync => "sync",
            Self::Bulk => "bulk",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "sync" | "upsert" => Ok(Self::Sync),
            "bulk" => Ok(Self::Bulk),
            _ => Err(SyncError::InvalidOperationKind(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    CentralToLocal,
    LocalToCentral,
    Bidirectional,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CentralToLocal => "central_to_local",
            Self::LocalToCentral => "local_to_central",
            Self::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "central_to_local" => Ok(Self::CentralToLocal),
            "local_to_central" => Ok(Self::LocalToCentral),
            "bidirectional" => Ok(Self::Bidirectional),
            _ => Err(SyncError::InvalidData(format!("unknown direction '{s}'"))),
        }
    }
}

/// Lifecycle status of an operation.
///
/// ```text
/// Pending → Processing → Completed
///                      → RetryScheduled → (due) → Processing
///                      → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RetryScheduled,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::RetryScheduled,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry_scheduled",
        }
    }

    /// Completed and Failed never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            _ => Err(SyncError::Storage(format!("unknown status '{s}'"))),
        }
    }
}

/// Which slice of the queue a batch is pulled from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partition {
    Node(String),
    /// Operations with no node affinity.
    Broadcast,
}

impl Partition {
    #[must_use]
    pub fn matches(&self, node_id: Option<&str>) -> bool {
        match (self, node_id) {
            (Self::Node(want), Some(have)) => want == have,
            (Self::Broadcast, None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node:{id}"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// Result of dispatching one broadcast operation to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub attempted_at: i64,
}

/// A queued unit of synchronization work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: OperationId,
    /// Insertion sequence, assigned by the queue. Breaks `created_at` ties.
    #[serde(default)]
    pub seq: u64,
    /// `None` = broadcast to all reachable nodes.
    pub node_id: Option<String>,
    pub operation_kind: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub priority: i32,
    pub direction: Direction,
    #[serde(default)]
    pub depends_on: Vec<OperationId>,
    pub checksum: Option<String>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
    pub acknowledged_at: Option<i64>,
    /// Not eligible for dispatch before this instant (epoch millis).
    pub next_attempt_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_outcomes: Vec<NodeOutcome>,
}

impl SyncOperation {
    /// Build a pending operation from a validated request.
    #[must_use]
    pub fn from_request(request: OperationRequest, created_at: i64) -> Self {
        Self {
            id: OperationId::new(),
            seq: 0,
            node_id: request.node_id,
            operation_kind: request.operation_kind,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            payload: request.payload,
            priority: request.priority,
            direction: request.direction,
            depends_on: request.depends_on,
            checksum: request.checksum,
            status: OperationStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at,
            processed_at: None,
            acknowledged_at: None,
            next_attempt_at: None,
            batch_id: request.batch_id,
            node_outcomes: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.node_id.is_none()
    }

    /// Pending, or retry-scheduled and due.
    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::RetryScheduled => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    #[must_use]
    pub fn partition(&self) -> Partition {
        match &self.node_id {
            Some(id) => Partition::Node(id.clone()),
            None => Partition::Broadcast,
        }
    }

    /// Sort key for dispatch order: priority descending, then FIFO.
    #[must_use]
    pub fn dispatch_order(&self) -> (std::cmp::Reverse<i32>, i64, u64) {
        (std::cmp::Reverse(self.priority), self.created_at, self.seq)
    }
}

/// Producer-facing request to enqueue an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    #[serde(default)]
    pub node_id: Option<String>,
    pub operation_kind: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub depends_on: Vec<OperationId>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

fn default_priority() -> i32 { DEFAULT_PRIORITY }
fn default_direction() -> Direction { Direction::CentralToLocal }

impl OperationRequest {
    /// A broadcast, central-to-local request at default priority.
    pub fn new(
        operation_kind: OperationKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            node_id: None,
            operation_kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            direction: Direction::CentralToLocal,
            depends_on: Vec::new(),
            checksum: None,
            batch_id: None,
        }
    }

    /// Parse a request whose kind arrives as a loose string (e.g. from another
    /// subsystem's JSON). Unknown kinds fail with `InvalidOperationKind`.
    pub fn from_parts(
        kind: &str,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Result<Self, SyncError> {
        Ok(Self::new(kind.parse()?, entity_type, entity_id, payload))
    }

    #[must_use]
    pub fn to_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: OperationId) -> Self {
        self.depends_on.push(id);
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}
