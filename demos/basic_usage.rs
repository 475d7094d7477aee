// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic sync-reconciler usage example.
//!
//! Demonstrates:
//! 1. Starting the engine on a SQLite-backed queue
//! 2. Registering three local nodes
//! 3. Enqueuing targeted, broadcast and fan-out operations
//! 4. Running ticks against a simulated node that is down
//! 5. Receiving a conflicting change from a local node
//! 6. Queue status, statistics and clean shutdown
//!
//! No external services are needed: nodes are simulated in-process.
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sync_reconciler::{
    Collaborators, ConflictStrategy, Envelope, InboundChange, LocalNode, NodeRegistration,
    NodeTransport, OperationKind, OperationRequest, QueueFilter, SyncEngine, SyncEngineConfig,
    SyncToAllOptions, TransportError,
};
use tokio::sync::watch;

/// Prints every delivery; nodes in `down` refuse connections.
#[derive(Default)]
struct SimulatedNodes {
    down: Mutex<HashSet<String>>,
}

#[async_trait]
impl NodeTransport for SimulatedNodes {
    async fn dispatch(&self, node: &LocalNode, envelope: &Envelope) -> Result<(), TransportError> {
        if self.down.lock().contains(&node.node_id) {
            return Err(TransportError::Unreachable("connection refused".into()));
        }
        println!(
            "   → {} received {} {}/{}",
            node.node_id, envelope.operation_kind, envelope.entity_type, envelope.entity_id
        );
        Ok(())
    }

    async fn probe(&self, node: &LocalNode) -> Result<(), TransportError> {
        if self.down.lock().contains(&node.node_id) {
            Err(TransportError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           sync-reconciler: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let db_path = std::env::temp_dir().join("sync_reconciler_demo.db");
    let _ = std::fs::remove_file(&db_path);

    let config = SyncEngineConfig {
        queue_url: Some(format!("sqlite://{}?mode=rwc", db_path.display())),
        entity_types: vec!["guard".into(), "site".into()],
        conflict_strategy: ConflictStrategy::CentralWins,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        ..Default::default()
    };

    let nodes = Arc::new(SimulatedNodes::default());
    let (_config_tx, config_rx) = watch::channel(config.clone());
    let mut engine = SyncEngine::new(config, config_rx, Collaborators::new(nodes.clone()));
    engine.start().await?;
    println!("✅ Engine {} on {} queue\n", engine.state(), engine.queue_backend());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Register nodes
    // ─────────────────────────────────────────────────────────────────────────
    engine.register_node(NodeRegistration::new("N1", "north", "http://10.0.1.5:8080"));
    engine.register_node(NodeRegistration::new("N2", "north", "http://10.0.1.6:8080"));
    engine.register_node(NodeRegistration::new("N3", "south", "http://10.0.2.5:8080"));
    println!("📡 Registered {} nodes\n", engine.nodes().len());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Enqueue work
    // ─────────────────────────────────────────────────────────────────────────
    let guard = engine
        .enqueue(
            OperationRequest::new(
                OperationKind::Update,
                "guard",
                "G1",
                json!({"name": "Ada", "badge": "A-1"}),
            )
            .to_node("N1")
            .with_priority(8),
        )
        .await?;
    engine
        .broadcast_to_all(OperationRequest::new(
            OperationKind::Create,
            "site",
            "S1",
            json!({"name": "Main gate"}),
        ))
        .await?;
    let fanout = engine
        .sync_to_all_nodes(
            "site",
            "S2",
            json!({"name": "North depot"}),
            SyncToAllOptions {
                geo_scope: Some("north".into()),
                ..Default::default()
            },
        )
        .await?;
    println!("📝 Enqueued guard update {} plus broadcast and {} fan-out ops\n", guard.id, fanout.enqueued_count);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Process with one node down
    // ─────────────────────────────────────────────────────────────────────────
    nodes.down.lock().insert("N2".into());
    println!("⚙️  Tick with N2 down:");
    let report = engine.tick().await;
    println!(
        "   completed={} retried={} failed={}\n",
        report.completed, report.retried, report.failed
    );

    nodes.down.lock().clear();
    println!("⚙️  Tick with N2 back:");
    let report = engine.tick().await;
    println!("   completed={} retried={}\n", report.completed, report.retried);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Inbound change that races the central update
    // ─────────────────────────────────────────────────────────────────────────
    let outcome = engine
        .receive_from_local(
            "N1",
            InboundChange {
                entity_type: "guard".into(),
                entity_id: "G1".into(),
                operation_kind: OperationKind::Update,
                payload: json!({"name": "Ada L.", "badge": "A-1"}),
                checksum: None,
                local_timestamp: guard.created_at - 1_000,
            },
        )
        .await?;
    println!(
        "🔀 Inbound from N1: accepted={} resolution={:?}\n",
        outcome.accepted,
        outcome.resolution.map(|r| r.as_str())
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Status, statistics, shutdown
    // ─────────────────────────────────────────────────────────────────────────
    let page = engine.queue_status(&QueueFilter::default()).await?;
    println!("📊 Queue: {} operations", page.total);
    for (status, count) in &page.histogram {
        println!("   {:<16} {count}", status.as_str());
    }

    let stats = engine.statistics();
    println!(
        "\n📈 enqueued={} synced={} retries={} conflicts={}",
        stats.total_enqueued, stats.total_synced, stats.total_retries, stats.total_conflicts
    );
    for (node_id, node) in &stats.per_node {
        println!(
            "   {node_id}: {}/{} ok ({:.0}%)",
            node.successes,
            node.attempts,
            node.success_rate * 100.0
        );
    }

    engine.shutdown().await;
    let _ = std::fs::remove_file(&db_path);
    println!("\n👋 Done");
    Ok(())
}
