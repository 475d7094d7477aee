// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the reconciliation engine.
//!
//! Every failure the engine can observe falls into one of five categories,
//! and the category decides what happens next:
//!
//! | Category     | Examples                                   | Outcome                       |
//! |--------------|--------------------------------------------|-------------------------------|
//! | `validation` | bad kind, unknown entity type, bad payload | rejected, never retried       |
//! | `integrity`  | checksum mismatch                          | terminal, audited as critical |
//! | `transient`  | timeout, unreachable node, unmet deps      | exponential backoff           |
//! | `conflict`   | unknown node on inbound traffic            | expected outcome, audited     |
//! | `engine`     | storage/config failures                    | aborts the current tick only  |

use thiserror::Error;

use crate::operation::{OperationId, OperationStatus};
use crate::transport::TransportError;

/// Convenience alias used across the crate.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),

    #[error("invalid entity type: {0}")]
    InvalidEntityType(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unmet dependencies: {} operation(s) not completed", pending.len())]
    UnmetDependencies { pending: Vec<OperationId> },

    #[error("dependency {dependency} failed permanently")]
    DependencyFailed { dependency: OperationId },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("node {0} unavailable")]
    NodeUnavailable(String),

    #[error("unknown or inactive node: {0}")]
    UnknownNode(String),

    #[error("operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue storage error: {0}")]
    Storage(String),

    #[error("entity apply failed: {0}")]
    Apply(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Broad class of an error, used for metrics labels and audit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Integrity,
    Transient,
    Conflict,
    Engine,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Integrity => "integrity",
            Self::Transient => "transient",
            Self::Conflict => "conflict",
            Self::Engine => "engine",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidOperationKind(_)
            | Self::InvalidEntityType(_)
            | Self::InvalidData(_)
            | Self::DependencyFailed { .. } => ErrorCategory::Validation,
            Self::ChecksumMismatch { .. } => ErrorCategory::Integrity,
            Self::UnmetDependencies { .. }
            | Self::Transport(_)
            | Self::Timeout(_)
            | Self::NodeUnavailable(_) => ErrorCategory::Transient,
            Self::UnknownNode(_) => ErrorCategory::Conflict,
            Self::InvalidTransition { .. }
            | Self::NotFound(_)
            | Self::Storage(_)
            | Self::Apply(_)
            | Self::Config(_) => ErrorCategory::Engine,
        }
    }

    /// Whether the retry manager may re-admit an operation that failed with this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Short machine-readable tag for metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidOperationKind(_) => "invalid_operation_kind",
            Self::InvalidEntityType(_) => "invalid_entity_type",
            Self::InvalidData(_) => "invalid_data",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::UnmetDependencies { .. } => "unmet_dependencies",
            Self::DependencyFailed { .. } => "dependency_failed",
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::NodeUnavailable(_) => "node_unavailable",
            Self::UnknownNode(_) => "unknown_node",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::Apply(_) => "apply",
            Self::Config(_) => "config",
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(SyncError::NodeUnavailable("n1".into()).is_retryable());
        assert!(SyncError::UnmetDependencies { pending: vec![OperationId::new()] }.is_retryable());
        assert!(SyncError::Transport(TransportError::Unreachable("refused".into())).is_retryable());
    }

    #[test]
    fn test_integrity_and_validation_are_terminal() {
        let mismatch = SyncError::ChecksumMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(!mismatch.is_retryable());
        assert_eq!(mismatch.category(), ErrorCategory::Integrity);

        assert!(!SyncError::InvalidData("missing name".into()).is_retryable());
        assert!(!SyncError::InvalidEntityType("ghost".into()).is_retryable());
        assert!(!SyncError::DependencyFailed { dependency: OperationId::new() }.is_retryable());
    }

    #[test]
    fn test_unknown_node_is_conflict_category() {
        let err = SyncError::UnknownNode("n9".into());
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert_eq!(err.kind(), "unknown_node");
    }

    #[test]
    fn test_display_messages() {
        let err = SyncError::ChecksumMismatch {
            expected: "abc".into(),
            actual: "def".into(),
        };
        assert_eq!(err.to_string(), "checksum mismatch: expected abc, got def");
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
    }
}
