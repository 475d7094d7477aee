// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Degraded-mode gate.
//!
//! The engine asks the gate before every tick whether the `"sync"` action is
//! allowed. The gate's state is owned by whoever manages the system-wide
//! operating mode; [`DegradedModeState`] is a shareable implementation that
//! such a collaborator can hold a clone of and flip at runtime.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Action name the processor checks before each tick.
pub const SYNC_ACTION: &str = "sync";

pub trait DegradedModeGate: Send + Sync {
    fn is_action_allowed(&self, action: &str) -> bool;
}

/// Gate that allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAllow;

impl DegradedModeGate for AlwaysAllow {
    fn is_action_allowed(&self, _action: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Normal,
    /// Reduced service: actions in the blocked set are refused.
    Degraded,
    /// Cut off from central: synchronization is refused outright.
    Autonomous,
}

#[derive(Debug, Default)]
struct ModeInner {
    mode: OperatingMode,
    blocked: HashSet<String>,
}

/// Shared, explicit operating-mode state. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct DegradedModeState {
    inner: Arc<RwLock<ModeInner>>,
}

impl DegradedModeState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mode(&self) -> OperatingMode {
        self.inner.read().mode
    }

    pub fn set_mode(&self, mode: OperatingMode) {
        self.inner.write().mode = mode;
    }

    /// Refuse `action` while in `Degraded` mode.
    pub fn block(&self, action: impl Into<String>) {
        self.inner.write().blocked.insert(action.into());
    }

    pub fn unblock(&self, action: &str) {
        self.inner.write().blocked.remove(action);
    }
}

impl DegradedModeGate for DegradedModeState {
    fn is_action_allowed(&self, action: &str) -> bool {
        let inner = self.inner.read();
        match inner.mode {
            OperatingMode::Normal => true,
            OperatingMode::Degraded => !inner.blocked.contains(action),
            OperatingMode::Autonomous => action != SYNC_ACTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_allows_everything() {
        let state = DegradedModeState::new();
        state.block(SYNC_ACTION);
        assert!(state.is_action_allowed(SYNC_ACTION));
        assert!(AlwaysAllow.is_action_allowed(SYNC_ACTION));
    }

    #[test]
    fn test_degraded_refuses_blocked_actions() {
        let state = DegradedModeState::new();
        let shared = state.clone();
        state.block(SYNC_ACTION);
        shared.set_mode(OperatingMode::Degraded);

        assert!(!state.is_action_allowed(SYNC_ACTION));
        assert!(state.is_action_allowed("report"));

        state.unblock(SYNC_ACTION);
        assert!(shared.is_action_allowed(SYNC_ACTION));
    }

    #[test]
    fn test_autonomous_refuses_sync() {
        let state = DegradedModeState::new();
        state.set_mode(OperatingMode::Autonomous);
        assert_eq!(state.mode(), OperatingMode::Autonomous);
        assert!(!state.is_action_allowed(SYNC_ACTION));
        assert!(state.is_action_allowed("report"));
    }
}
