// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity-type validation, transformation and key derivation.
//!
//! Each synchronizable entity type may register an [`EntityHandler`]. The
//! engine looks handlers up by `entity_type` before every dispatch; types with
//! no handler are forwarded untouched so newer producers can ship entity types
//! older engines don't know about yet.

mod field_policy;

pub use field_policy::FieldPolicyHandler;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::operation::Direction;

/// Strategy triple for one entity type.
pub trait EntityHandler: Send + Sync {
    /// Check the payload shape. `Err` carries a human-readable reason.
    fn validate(&self, payload: &Value) -> Result<(), String>;

    /// Reshape the payload for the given direction (e.g. strip credentials
    /// before sending central → local).
    fn transform(&self, payload: Value, direction: Direction) -> Value;

    /// Natural key of the record carried by the payload, if it has one.
    /// Enqueue uses it as the entity id when the request leaves that blank.
    fn key_of(&self, payload: &Value) -> Option<String>;
}

/// Registry of handlers keyed by entity type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn EntityHandler>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `entity_type`.
    pub fn register(&self, entity_type: impl Into<String>, handler: Arc<dyn EntityHandler>) {
        let entity_type = entity_type.into();
        tracing::debug!(entity_type = %entity_type, "Entity handler registered");
        self.handlers.write().insert(entity_type, handler);
    }

    #[must_use]
    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn EntityHandler>> {
        self.handlers.read().get(entity_type).cloned()
    }

    #[must_use]
    pub fn contains(&self, entity_type: &str) -> bool {
        self.handlers.read().contains_key(entity_type)
    }

    #[must_use]
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}
