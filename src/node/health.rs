// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic reachability probing.
//!
//! Each round probes every registered node concurrently, each probe bounded
//! by the probe timeout:
//!
//! - success: heartbeat refreshed; an `Inactive` node comes back `Active`
//! - failure: an `Active` node silent for at least the offline threshold
//!   goes `Inactive`
//!
//! Going offline never touches already-completed operations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{LocalNode, NodeDirectory, NodeStatus};
use crate::audit::{actions, AuditEvent, AuditSeverity, AuditSink};
use crate::transport::{NodeTransport, TransportError};

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub probed: usize,
    pub healthy: usize,
    pub went_offline: Vec<String>,
    pub came_online: Vec<String>,
}

pub struct HealthMonitor {
    nodes: Arc<NodeDirectory>,
    transport: Arc<dyn NodeTransport>,
    audit: Arc<dyn AuditSink>,
}

impl HealthMonitor {
    pub fn new(
        nodes: Arc<NodeDirectory>,
        transport: Arc<dyn NodeTransport>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            nodes,
            transport,
            audit,
        }
    }

    async fn probe_one(&self, node: LocalNode, timeout: Duration) -> (LocalNode, Result<(), TransportError>) {
        let result = match tokio::time::timeout(timeout, self.transport.probe(&node)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        (node, result)
    }

    /// Probe all nodes once. `now` is the epoch-millis reference for
    /// heartbeats and silence.
    #[tracing::instrument(skip(self), fields(nodes = self.nodes.len()))]
    pub async fn probe_all(&self, probe_timeout: Duration, offline_threshold: Duration, now: i64) -> ProbeRound {
        let start = Instant::now();
        let nodes = self.nodes.all();
        let results = join_all(nodes.into_iter().map(|node| self.probe_one(node, probe_timeout))).await;

        let mut round = ProbeRound {
            probed: results.len(),
            ..Default::default()
        };

        for (node, result) in results {
            crate::metrics::record_probe(&node.node_id, result.is_ok());
            match result {
                Ok(()) => {
                    round.healthy += 1;
                    self.nodes.touch(&node.node_id, now);
                    if self.nodes.set_status(&node.node_id, NodeStatus::Active) == Some(NodeStatus::Inactive) {
                        info!(node_id = %node.node_id, "Node back online");
                        crate::metrics::record_node_transition(&node.node_id, "active");
                        self.audit.log_activity(
                            AuditEvent::new(actions::NODE_ONLINE).with("node_id", node.node_id.as_str()),
                        );
                        round.came_online.push(node.node_id);
                    }
                }
                Err(err) => {
                    let failures = self.nodes.record_probe_failure(&node.node_id).unwrap_or(0);
                    debug!(node_id = %node.node_id, failures, error = %err, "Probe failed");

                    let silence = node.silence(now);
                    if node.status == NodeStatus::Active && silence >= offline_threshold {
                        self.nodes.set_status(&node.node_id, NodeStatus::Inactive);
                        warn!(
                            node_id = %node.node_id,
                            silence_secs = silence.as_secs(),
                            failures,
                            "Node marked inactive"
                        );
                        crate::metrics::record_node_transition(&node.node_id, "inactive");
                        self.audit.log_activity(
                            AuditEvent::new(actions::NODE_OFFLINE)
                                .severity(AuditSeverity::Warning)
                                .with("node_id", node.node_id.as_str())
                                .with("silence_secs", silence.as_secs())
                                .with("consecutive_failures", failures)
                                .with("error", err.to_string()),
                        );
                        round.went_offline.push(node.node_id);
                    }
                }
            }
        }

        debug!(
            probed = round.probed,
            healthy = round.healthy,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Probe round done"
        );
        round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::node::NodeRegistration;
    use crate::transport::Envelope;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Nodes in `down` fail their probe; `slow` nodes never answer.
    struct FakeTransport {
        down: HashSet<String>,
        slow: HashSet<String>,
    }

    #[async_trait]
    impl NodeTransport for FakeTransport {
        async fn dispatch(&self, _node: &LocalNode, _envelope: &Envelope) -> Result<(), TransportError> {
            Ok(())
        }

        async fn probe(&self, node: &LocalNode) -> Result<(), TransportError> {
            if self.slow.contains(&node.node_id) {
                std::future::pending::<()>().await;
            }
            if self.down.contains(&node.node_id) {
                Err(TransportError::Unreachable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn monitor(down: &[&str], slow: &[&str]) -> (HealthMonitor, Arc<NodeDirectory>, Arc<MemoryAuditSink>) {
        let nodes = Arc::new(NodeDirectory::new());
        for id in ["N1", "N2", "N3"] {
            nodes.register(NodeRegistration::new(id, "north", format!("http://{id}")), 0);
        }
        let audit = Arc::new(MemoryAuditSink::new());
        let transport = Arc::new(FakeTransport {
            down: down.iter().map(|s| s.to_string()).collect(),
            slow: slow.iter().map(|s| s.to_string()).collect(),
        });
        (HealthMonitor::new(nodes.clone(), transport, audit.clone()), nodes, audit)
    }

    const PROBE: Duration = Duration::from_millis(50);
    const OFFLINE: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_success_refreshes_heartbeat() {
        let (monitor, nodes, _) = monitor(&[], &[]);
        let round = monitor.probe_all(PROBE, OFFLINE, 10_000).await;
        assert_eq!(round.probed, 3);
        assert_eq!(round.healthy, 3);
        assert_eq!(nodes.get("N1").unwrap().last_heartbeat, 10_000);
    }

    #[tokio::test]
    async fn test_failure_within_threshold_keeps_node_active() {
        let (monitor, nodes, audit) = monitor(&["N2"], &[]);
        let round = monitor.probe_all(PROBE, OFFLINE, 60_000).await;
        assert!(round.went_offline.is_empty());
        let n2 = nodes.get("N2").unwrap();
        assert_eq!(n2.status, NodeStatus::Active);
        assert_eq!(n2.consecutive_probe_failures, 1);
        assert_eq!(audit.count(actions::NODE_OFFLINE), 0);
    }

    #[tokio::test]
    async fn test_silence_past_threshold_goes_inactive() {
        let (monitor, nodes, audit) = monitor(&["N2"], &["N3"]);
        let round = monitor.probe_all(PROBE, OFFLINE, 300_000).await;

        assert_eq!(round.healthy, 1);
        assert_eq!(round.went_offline, vec!["N2".to_string(), "N3".to_string()]);
        assert_eq!(nodes.get("N2").unwrap().status, NodeStatus::Inactive);
        assert_eq!(nodes.get("N1").unwrap().status, NodeStatus::Active);

        let events = audit.with_action(actions::NODE_OFFLINE);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, AuditSeverity::Warning);
    }

    #[tokio::test]
    async fn test_inactive_node_comes_back() {
        let (monitor, nodes, audit) = monitor(&[], &[]);
        nodes.set_status("N1", NodeStatus::Inactive);

        let round = monitor.probe_all(PROBE, OFFLINE, 1_000).await;
        assert_eq!(round.came_online, vec!["N1".to_string()]);
        assert_eq!(nodes.get("N1").unwrap().status, NodeStatus::Active);
        assert_eq!(audit.count(actions::NODE_ONLINE), 1);
    }
}
