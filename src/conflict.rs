// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict resolution for inbound changes.
//!
//! An inbound change conflicts when central already has a newer outbound
//! (`CentralToLocal`) operation for the same entity that is pending, in
//! flight, or completed. Resolution is policy-driven:
//!
//! | Strategy      | Inbound change                      |
//! |---------------|-------------------------------------|
//! | `CentralWins` | discarded, node should resync       |
//! | `LocalWins`   | applied                             |
//! | `Manual`      | parked for administrator review     |
//!
//! Conflict records are decision artifacts: they are logged and audited,
//! and only parked ones are kept (in memory) until reviewed.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::InboundChange;
use crate::operation::{OperationId, OperationKind, SyncOperation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    CentralWins,
    LocalWins,
    Manual,
}

impl ConflictStrategy {
    #[must_use]
    pub fn resolution(self) -> Resolution {
        match self {
            Self::CentralWins => Resolution::CentralPrevails,
            Self::LocalWins => Resolution::LocalApplied,
            Self::Manual => Resolution::Parked,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CentralWins => "central_wins",
            Self::LocalWins => "local_wins",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Inbound change discarded.
    CentralPrevails,
    /// Inbound change applied.
    LocalApplied,
    /// Held for review; nothing applied.
    Parked,
}

impl Resolution {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CentralPrevails => "central_prevails",
            Self::LocalApplied => "local_applied",
            Self::Parked => "parked",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub node_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation_kind: OperationKind,
    /// When the local node made its change.
    pub local_timestamp: i64,
    /// Creation time of the competing central operation.
    pub central_timestamp: i64,
    pub central_operation_id: OperationId,
    pub strategy: ConflictStrategy,
    pub resolution: Resolution,
    pub detected_at: i64,
    /// The inbound payload, kept so a parked change can be applied later.
    pub payload: Value,
}

/// Applies a strategy and keeps parked conflicts.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    parked: DashMap<Uuid, ConflictRecord>,
}

impl ConflictResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide `change` against the newer `central` operation. Under
    /// `Manual` the record is parked before it is returned.
    pub fn resolve(
        &self,
        strategy: ConflictStrategy,
        node_id: &str,
        change: &InboundChange,
        central: &SyncOperation,
        now: i64,
    ) -> ConflictRecord {
        let record = ConflictRecord {
            id: Uuid::now_v7(),
            node_id: node_id.to_string(),
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            operation_kind: change.operation_kind,
            local_timestamp: change.local_timestamp,
            central_timestamp: central.created_at,
            central_operation_id: central.id,
            strategy,
            resolution: strategy.resolution(),
            detected_at: now,
            payload: change.payload.clone(),
        };
        if record.resolution == Resolution::Parked {
            self.parked.insert(record.id, record.clone());
        }
        record
    }

    /// Parked conflicts, oldest first.
    #[must_use]
    pub fn parked(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self.parked.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| (r.detected_at, r.id));
        records
    }

    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Remove a parked conflict for review.
    pub fn take_parked(&self, id: Uuid) -> Option<ConflictRecord> {
        self.parked.remove(&id).map(|(_, record)| record)
    }

    /// Put a record back (e.g. when applying it failed).
    pub fn restore(&self, record: ConflictRecord) {
        self.parked.insert(record.id, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationRequest;
    use serde_json::json;

    fn change(local_timestamp: i64) -> InboundChange {
        InboundChange {
            entity_type: "guard".into(),
            entity_id: "G1".into(),
            operation_kind: OperationKind::Update,
            payload: json!({"name": "local"}),
            checksum: None,
            local_timestamp,
        }
    }

    fn central(created_at: i64) -> SyncOperation {
        SyncOperation::from_request(
            OperationRequest::new(OperationKind::Update, "guard", "G1", json!({"name": "central"})),
            created_at,
        )
    }

    #[test]
    fn test_default_strategy_is_central_wins() {
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::CentralWins);
        let parsed: ConflictStrategy = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(parsed, ConflictStrategy::Manual);
    }

    #[test]
    fn test_record_carries_both_timestamps() {
        let resolver = ConflictResolver::new();
        let central = central(2_000);
        let record = resolver.resolve(ConflictStrategy::CentralWins, "N1", &change(1_000), &central, 3_000);

        assert_eq!(record.resolution, Resolution::CentralPrevails);
        assert_eq!(record.local_timestamp, 1_000);
        assert_eq!(record.central_timestamp, 2_000);
        assert_eq!(record.central_operation_id, central.id);
        assert_eq!(resolver.parked_count(), 0);
    }

    #[test]
    fn test_local_wins_applies_without_parking() {
        let resolver = ConflictResolver::new();
        let record = resolver.resolve(ConflictStrategy::LocalWins, "N1", &change(1), &central(2), 3);
        assert_eq!(record.resolution, Resolution::LocalApplied);
        assert!(resolver.parked().is_empty());
    }

    #[test]
    fn test_manual_parks_until_taken() {
        let resolver = ConflictResolver::new();
        let first = resolver.resolve(ConflictStrategy::Manual, "N1", &change(1), &central(2), 3);
        let second = resolver.resolve(ConflictStrategy::Manual, "N2", &change(1), &central(2), 4);
        assert_eq!(first.resolution, Resolution::Parked);

        let parked = resolver.parked();
        assert_eq!(parked.len(), 2);
        assert_eq!(parked[0].id, first.id);

        let taken = resolver.take_parked(second.id).unwrap();
        assert_eq!(taken.node_id, "N2");
        assert!(resolver.take_parked(second.id).is_none());

        resolver.restore(taken);
        assert_eq!(resolver.parked_count(), 2);
    }
}
