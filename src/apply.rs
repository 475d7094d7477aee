// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity-apply contract.
//!
//! The engine never persists entities itself. Accepted inbound changes are
//! handed to an [`EntityApplier`] with create/update/delete/upsert semantics,
//! and successful outbound dispatches are reported through
//! [`EntityApplier::acknowledge`] so the host can keep its own bookkeeping.

use async_trait::async_trait;
use serde_json::Value;

use crate::operation::{OperationKind, SyncOperation};

#[async_trait]
pub trait EntityApplier: Send + Sync {
    /// Apply a change to the central store. Errors are reported back to the
    /// caller of `receive_from_local` as `SyncError::Apply`.
    async fn apply(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        kind: OperationKind,
    ) -> Result<(), String>;

    /// Called after `node_id` accepted `op`. Failures are logged only.
    async fn acknowledge(&self, _op: &SyncOperation, _node_id: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Applier that accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApplier;

#[async_trait]
impl EntityApplier for NoopApplier {
    async fn apply(
        &self,
        entity_type: &str,
        entity_id: &str,
        _payload: &Value,
        kind: OperationKind,
    ) -> Result<(), String> {
        tracing::debug!(entity_type, entity_id, kind = %kind, "No-op apply");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationRequest;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_applier_accepts() {
        let applier = NoopApplier;
        applier
            .apply("guard", "G1", &json!({}), OperationKind::Delete)
            .await
            .unwrap();

        let op = SyncOperation::from_request(
            OperationRequest::new(OperationKind::Create, "guard", "G1", json!({})),
            0,
        );
        assert!(applier.acknowledge(&op, "N1").await.is_ok());
    }
}
