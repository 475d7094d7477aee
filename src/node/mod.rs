// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Directory of local nodes and their reachability.
//!
//! Nodes are created by registration and only removed by an explicit
//! administrative call. Heartbeats come from inbound traffic, successful
//! dispatches and health probes; the [`health::HealthMonitor`] flips nodes to
//! `Inactive` when they stay silent past the offline threshold.

pub mod health;

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Registration request for a local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub geo_scope: String,
    /// Base URL of the node's sync API.
    pub endpoint: String,
}

impl NodeRegistration {
    pub fn new(
        node_id: impl Into<String>,
        geo_scope: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            geo_scope: geo_scope.into(),
            endpoint: endpoint.into(),
        }
    }
}

/// A registered remote participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalNode {
    pub node_id: String,
    pub geo_scope: String,
    pub endpoint: String,
    pub status: NodeStatus,
    /// Epoch millis of the last sign of life.
    pub last_heartbeat: i64,
    pub registered_at: i64,
    /// Probe failures since the last successful heartbeat.
    pub consecutive_probe_failures: u32,
}

impl LocalNode {
    /// Active and heard from within two heartbeat intervals.
    #[must_use]
    pub fn is_reachable(&self, now: i64, heartbeat_interval: Duration) -> bool {
        let window = 2 * heartbeat_interval.as_millis() as i64;
        self.status == NodeStatus::Active && now - self.last_heartbeat < window
    }

    #[must_use]
    pub fn silence(&self, now: i64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_heartbeat).max(0) as u64)
    }
}

/// Concurrent node directory. Each record is updated atomically.
#[derive(Debug, Default)]
pub struct NodeDirectory {
    nodes: DashMap<String, LocalNode>,
}

impl NodeDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, or refresh an existing one's endpoint and scope.
    /// Registration counts as a heartbeat and (re)activates the node.
    pub fn register(&self, registration: NodeRegistration, now: i64) -> LocalNode {
        let NodeRegistration { node_id, geo_scope, endpoint } = registration;
        let mut entry = self
            .nodes
            .entry(node_id.clone())
            .or_insert_with(|| LocalNode {
                node_id: node_id.clone(),
                geo_scope: geo_scope.clone(),
                endpoint: endpoint.clone(),
                status: NodeStatus::Active,
                last_heartbeat: now,
                registered_at: now,
                consecutive_probe_failures: 0,
            });
        entry.geo_scope = geo_scope;
        entry.endpoint = endpoint;
        entry.status = NodeStatus::Active;
        entry.last_heartbeat = now;
        entry.consecutive_probe_failures = 0;
        entry.clone()
    }

    pub fn remove(&self, node_id: &str) -> Option<LocalNode> {
        self.nodes.remove(node_id).map(|(_, node)| node)
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<LocalNode> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, sorted by id.
    #[must_use]
    pub fn all(&self) -> Vec<LocalNode> {
        let mut nodes: Vec<LocalNode> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    #[must_use]
    pub fn active(&self) -> Vec<LocalNode> {
        self.all()
            .into_iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect()
    }

    #[must_use]
    pub fn reachable(&self, now: i64, heartbeat_interval: Duration) -> Vec<LocalNode> {
        self.all()
            .into_iter()
            .filter(|n| n.is_reachable(now, heartbeat_interval))
            .collect()
    }

    /// Record a heartbeat. Returns false for unknown nodes.
    pub fn touch(&self, node_id: &str, now: i64) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(mut node) => {
                node.last_heartbeat = node.last_heartbeat.max(now);
                node.consecutive_probe_failures = 0;
                true
            }
            None => false,
        }
    }

    /// Set the status, returning the previous one.
    pub fn set_status(&self, node_id: &str, status: NodeStatus) -> Option<NodeStatus> {
        let mut node = self.nodes.get_mut(node_id)?;
        let previous = node.status;
        node.status = status;
        Some(previous)
    }

    /// Count a failed probe, returning the new consecutive failure count.
    pub fn record_probe_failure(&self, node_id: &str) -> Option<u32> {
        let mut node = self.nodes.get_mut(node_id)?;
        node.consecutive_probe_failures = node.consecutive_probe_failures.saturating_add(1);
        Some(node.consecutive_probe_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn directory_with(ids: &[&str], now: i64) -> NodeDirectory {
        let dir = NodeDirectory::new();
        for id in ids {
            dir.register(NodeRegistration::new(*id, "north", format!("http://{id}.local")), now);
        }
        dir
    }

    #[test]
    fn test_register_is_active_and_reachable() {
        let dir = directory_with(&["N1"], 1_000);
        let node = dir.get("N1").unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert!(node.is_reachable(1_000, MINUTE));
    }

    #[test]
    fn test_reachability_window_is_two_intervals() {
        let dir = directory_with(&["N1"], 0);
        let node = dir.get("N1").unwrap();
        assert!(node.is_reachable(119_999, MINUTE));
        assert!(!node.is_reachable(120_000, MINUTE));
    }

    #[test]
    fn test_inactive_is_never_reachable() {
        let dir = directory_with(&["N1"], 0);
        assert_eq!(dir.set_status("N1", NodeStatus::Inactive), Some(NodeStatus::Active));
        assert!(dir.reachable(1, MINUTE).is_empty());
        assert!(dir.active().is_empty());
        assert_eq!(dir.all().len(), 1);
    }

    #[test]
    fn test_touch_refreshes_heartbeat_monotonically() {
        let dir = directory_with(&["N1"], 5_000);
        dir.record_probe_failure("N1");
        assert!(dir.touch("N1", 9_000));
        assert!(dir.touch("N1", 7_000));
        let node = dir.get("N1").unwrap();
        assert_eq!(node.last_heartbeat, 9_000);
        assert_eq!(node.consecutive_probe_failures, 0);
        assert!(!dir.touch("ghost", 9_000));
    }

    #[test]
    fn test_reregistration_updates_endpoint_and_reactivates() {
        let dir = directory_with(&["N1"], 0);
        dir.set_status("N1", NodeStatus::Inactive);
        let node = dir.register(NodeRegistration::new("N1", "south", "http://new"), 50);
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.endpoint, "http://new");
        assert_eq!(node.geo_scope, "south");
        assert_eq!(node.registered_at, 0);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_remove_is_explicit() {
        let dir = directory_with(&["N1", "N2"], 0);
        assert!(dir.remove("N1").is_some());
        assert!(dir.remove("N1").is_none());
        let ids: Vec<String> = dir.all().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["N2".to_string()]);
    }

    #[test]
    fn test_silence() {
        let dir = directory_with(&["N1"], 1_000);
        assert_eq!(dir.get("N1").unwrap().silence(4_000), Duration::from_secs(3));
        assert_eq!(dir.get("N1").unwrap().silence(0), Duration::ZERO);
    }
}
