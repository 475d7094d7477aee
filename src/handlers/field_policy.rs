// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Declarative handler: required fields, outbound redaction, key field.

use serde_json::Value;

use super::EntityHandler;
use crate::operation::Direction;

/// Handler configured by field lists instead of code.
///
/// ```
/// use sync_reconciler::handlers::{EntityHandler, FieldPolicyHandler};
/// use sync_reconciler::Direction;
/// use serde_json::json;
///
/// let guards = FieldPolicyHandler::new()
///     .require("badge")
///     .redact_outbound("password_hash")
///     .key_field("badge");
///
/// let out = guards.transform(json!({"badge": "A-17", "password_hash": "x"}), Direction::CentralToLocal);
/// assert_eq!(out, json!({"badge": "A-17"}));
/// ```
#[derive(Debug, Clone, Default)]
pub struct FieldPolicyHandler {
    required: Vec<String>,
    redacted: Vec<String>,
    key_field: Option<String>,
}

impl FieldPolicyHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    /// Field removed from payloads flowing central → local (and bidirectional).
    #[must_use]
    pub fn redact_outbound(mut self, field: impl Into<String>) -> Self {
        self.redacted.push(field.into());
        self
    }

    #[must_use]
    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }
}

impl EntityHandler for FieldPolicyHandler {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let Some(object) = payload.as_object() else {
            return Err("payload must be a JSON object".to_string());
        };
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required field(s): {}", missing.join(", ")))
        }
    }

    fn transform(&self, mut payload: Value, direction: Direction) -> Value {
        if direction == Direction::LocalToCentral {
            return payload;
        }
        if let Some(object) = payload.as_object_mut() {
            for field in &self.redacted {
                object.remove(field);
            }
        }
        payload
    }

    fn key_of(&self, payload: &Value) -> Option<String> {
        let value = payload.get(self.key_field.as_deref()?)?;
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}
