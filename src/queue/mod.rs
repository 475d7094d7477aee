// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync queue: the single source of truth for operation state.
//!
//! The queue is partitioned by target node, plus one broadcast partition
//! for operations with no node affinity. Within a partition, eligible
//! operations are served by priority (descending) then FIFO.
//!
//! # Claim semantics
//!
//! [`QueueStore::mark_processing`] is a compare-and-set: it succeeds only
//! when the operation is `Pending` or a due `RetryScheduled`, so two
//! concurrent claims on the same id never both win. Every other transition
//! requires the operation to be `Processing`.
//!
//! # Backends
//!
//! | Backend        | Durability        | Use                          |
//! |----------------|-------------------|------------------------------|
//! | [`MemoryQueue`]| process lifetime  | tests, single-process setups |
//! | [`SqlQueue`]   | SQLite / MySQL    | production                   |

mod memory;
mod sql;

pub use memory::MemoryQueue;
pub use sql::SqlQueue;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::operation::{
    Direction, NodeOutcome, OperationId, OperationStatus, Partition, SyncOperation,
};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;
/// Highest page number served; larger requests get this (empty) page.
pub const MAX_PAGE: usize = 1_000_000;

/// Filters for [`QueueStore::query`]. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueFilter {
    /// Restrict to one node's partition.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Restrict to broadcast operations. Ignored when `node_id` is set.
    #[serde(default)]
    pub broadcast_only: bool,
    #[serde(default)]
    pub status: Option<OperationStatus>,
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub direction: Option<Direction>,
    /// 1-based page number.
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub page_size: usize,
}

impl QueueFilter {
    #[must_use]
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Effective (page, page_size) after defaults and caps.
    #[must_use]
    pub fn paging(&self) -> (usize, usize) {
        let page = self.page.clamp(1, MAX_PAGE);
        let size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        (page, size)
    }

    /// Rows to skip before the requested page.
    #[must_use]
    pub fn offset(&self) -> usize {
        let (page, page_size) = self.paging();
        (page - 1).saturating_mul(page_size)
    }

    /// Matches everything except the status filter (histogram scope).
    fn matches_scope(&self, op: &SyncOperation) -> bool {
        let partition_ok = match (&self.node_id, self.broadcast_only) {
            (Some(node), _) => op.node_id.as_deref() == Some(node.as_str()),
            (None, true) => op.node_id.is_none(),
            (None, false) => true,
        };
        partition_ok
            && self.entity_type.as_ref().map_or(true, |t| &op.entity_type == t)
            && self.direction.map_or(true, |d| op.direction == d)
    }

    #[must_use]
    pub fn matches(&self, op: &SyncOperation) -> bool {
        self.matches_scope(op) && self.status.map_or(true, |s| op.status == s)
    }
}

/// One page of [`QueueStore::query`] results, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct QueuePage {
    pub items: Vec<SyncOperation>,
    /// Matches across all pages.
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    /// Count per status over the filter without its status restriction.
    pub histogram: BTreeMap<OperationStatus, u64>,
}

impl QueuePage {
    #[must_use]
    pub fn count(&self, status: OperationStatus) -> u64 {
        self.histogram.get(&status).copied().unwrap_or(0)
    }
}

/// Storage contract for the sync queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Short backend name for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Store a new operation, assigning its insertion sequence.
    async fn insert(&self, op: SyncOperation) -> Result<SyncOperation>;

    async fn get(&self, id: OperationId) -> Result<Option<SyncOperation>>;

    /// Up to `limit` eligible operations of `partition`, in dispatch order.
    ///
    /// Eligible: `Pending` or due `RetryScheduled`, with every `depends_on`
    /// id `Completed`.
    async fn next_batch(
        &self,
        partition: &Partition,
        limit: usize,
        now: i64,
    ) -> Result<Vec<SyncOperation>>;

    /// Atomically claim an operation. Returns false if it was not claimable.
    async fn mark_processing(&self, id: OperationId, now: i64) -> Result<bool>;

    /// Processing → Completed; stamps `processed_at` and `acknowledged_at`.
    async fn mark_completed(&self, id: OperationId, now: i64) -> Result<()>;

    /// Processing → RetryScheduled; increments and returns `retry_count`.
    async fn schedule_retry(
        &self,
        id: OperationId,
        not_before: i64,
        error: &str,
        now: i64,
    ) -> Result<u32>;

    /// Processing → Failed.
    async fn mark_failed(&self, id: OperationId, error: &str, now: i64) -> Result<()>;

    /// Processing → Pending, undoing a claim whose processing was cut short
    /// by an engine error. `retry_count` is unchanged. Returns false if the
    /// operation was not `Processing`.
    async fn release(&self, id: OperationId) -> Result<bool>;

    async fn set_node_outcomes(&self, id: OperationId, outcomes: &[NodeOutcome]) -> Result<()>;

    /// Current status of each id that exists.
    async fn statuses(&self, ids: &[OperationId]) -> Result<HashMap<OperationId, OperationStatus>>;

    /// Newest `CentralToLocal` operation on the entity created after `since`
    /// that is `Pending`, `Processing` or `Completed`.
    async fn find_newer_outbound(
        &self,
        entity_type: &str,
        entity_id: &str,
        since: i64,
    ) -> Result<Option<SyncOperation>>;

    /// Non-terminal operations with a dependency in `Failed`, paired with
    /// that dependency.
    async fn blocked_by_failure(&self, limit: usize) -> Result<Vec<(SyncOperation, OperationId)>>;

    async fn query(&self, filter: &QueueFilter) -> Result<QueuePage>;

    /// Delete `Completed`/`Failed` operations last touched before
    /// `older_than`, except those still referenced by a live operation.
    async fn purge_terminal(&self, older_than: i64) -> Result<u64>;

    /// Reset `Processing` operations with no `processed_at` to `Pending`.
    async fn recover_interrupted(&self) -> Result<u64>;
}

/// Ids in `depends_on` that are not `Completed`. Unknown ids count as unmet.
#[must_use]
pub fn unmet_dependencies(
    op: &SyncOperation,
    statuses: &HashMap<OperationId, OperationStatus>,
) -> Vec<OperationId> {
    op.depends_on
        .iter()
        .filter(|dep| statuses.get(dep) != Some(&OperationStatus::Completed))
        .copied()
        .collect()
}
