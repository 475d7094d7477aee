// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Audit sink contract.
//!
//! The engine reports enqueues, completions, terminal failures, conflict
//! resolutions and node state changes to an [`AuditSink`]. The sink is owned
//! by the host system; [`TracingAuditSink`] forwards events to `tracing`, and
//! [`MemoryAuditSink`] keeps them in memory for inspection.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

/// Well-known audit action names.
pub mod actions {
    pub const SYNC_ENQUEUED: &str = "sync_enqueued";
    pub const SYNC_BATCH_ENQUEUED: &str = "sync_batch_enqueued";
    pub const SYNC_COMPLETED: &str = "sync_completed";
    pub const SYNC_FAILED: &str = "sync_failed";
    pub const CHECKSUM_MISMATCH: &str = "checksum_mismatch";
    pub const CONFLICT_RESOLVED: &str = "conflict_resolved";
    pub const CONFLICT_PARKED: &str = "conflict_parked";
    pub const INBOUND_APPLIED: &str = "inbound_applied";
    pub const INBOUND_REJECTED: &str = "inbound_rejected";
    pub const NODE_OFFLINE: &str = "node_offline";
    pub const NODE_ONLINE: &str = "node_online";
    pub const NODE_REGISTERED: &str = "node_registered";
    pub const NODE_REMOVED: &str = "node_removed";
    pub const QUEUE_CLEANUP: &str = "queue_cleanup";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub action: String,
    pub severity: AuditSeverity,
    pub fields: Map<String, Value>,
    pub timestamp: i64,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            severity: AuditSeverity::Info,
            fields: Map::new(),
            timestamp: crate::operation::now_millis(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

pub trait AuditSink: Send + Sync {
    fn log_activity(&self, event: AuditEvent);
}

/// Emits audit events as `tracing` records under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_activity(&self, event: AuditEvent) {
        let fields = Value::Object(event.fields).to_string();
        match event.severity {
            AuditSeverity::Info => tracing::info!(target: "audit", action = %event.action, %fields),
            AuditSeverity::Warning => tracing::warn!(target: "audit", action = %event.action, %fields),
            AuditSeverity::Critical => tracing::error!(target: "audit", action = %event.action, %fields),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn with_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, action: &str) -> usize {
        self.events.lock().iter().filter(|e| e.action == action).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_activity(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = AuditEvent::new(actions::SYNC_FAILED)
            .with("op_id", "abc")
            .with("retry_count", 3)
            .severity(AuditSeverity::Warning);
        assert_eq!(event.action, "sync_failed");
        assert_eq!(event.severity, AuditSeverity::Warning);
        assert_eq!(event.field("retry_count"), Some(&Value::from(3)));
        assert!(event.timestamp > 0);
    }

    #[test]
    fn test_memory_sink_filters_by_action() {
        let sink = MemoryAuditSink::new();
        sink.log_activity(AuditEvent::new(actions::SYNC_COMPLETED));
        sink.log_activity(AuditEvent::new(actions::SYNC_COMPLETED));
        sink.log_activity(AuditEvent::new(actions::NODE_OFFLINE));

        assert_eq!(sink.count(actions::SYNC_COMPLETED), 2);
        assert_eq!(sink.with_action(actions::NODE_OFFLINE).len(), 1);
        assert_eq!(sink.events().len(), 3);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_all_severities() {
        let sink = TracingAuditSink;
        sink.log_activity(AuditEvent::new("a"));
        sink.log_activity(AuditEvent::new("b").severity(AuditSeverity::Warning));
        sink.log_activity(AuditEvent::new("c").severity(AuditSeverity::Critical));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AuditSeverity::Critical > AuditSeverity::Warning);
        assert!(AuditSeverity::Warning > AuditSeverity::Info);
    }
}
