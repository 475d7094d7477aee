//! Property-based tests (fuzzing) for reconciler invariants.
//!
//! Uses proptest to generate random payloads, priorities and request fields
//! and verify the ordering, checksum and backoff guarantees hold, and that
//! malformed input only ever produces clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{Map, Value};
use tokio::sync::watch;

use sync_reconciler::checksum;
use sync_reconciler::{
    BackoffPolicy, Collaborators, Envelope, LocalNode, MemoryAuditSink, MemoryQueue,
    NodeRegistration, NodeTransport, OperationKind, OperationRequest, Partition, QueueStore,
    SyncEngine, SyncEngineConfig, SyncError, SyncOperation, TransportError,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Arbitrary JSON values, nested up to a few levels.
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

/// Distinct object fields, in generation order.
fn fields_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map("[a-z]{1,8}", arbitrary_json_strategy(), 1..12)
        .prop_map(|m| m.into_iter().collect())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

struct NullTransport;

#[async_trait]
impl NodeTransport for NullTransport {
    async fn dispatch(&self, _node: &LocalNode, _envelope: &Envelope) -> Result<(), TransportError> {
        Ok(())
    }

    async fn probe(&self, _node: &LocalNode) -> Result<(), TransportError> {
        Ok(())
    }
}

fn engine() -> SyncEngine {
    let config = SyncEngineConfig {
        entity_types: vec!["guard".into(), "site".into()],
        ..Default::default()
    };
    let (_tx, rx) = watch::channel(config.clone());
    let collaborators =
        Collaborators::new(Arc::new(NullTransport)).with_audit(Arc::new(MemoryAuditSink::new()));
    let engine = SyncEngine::new(config, rx, collaborators);
    engine.register_node(NodeRegistration::new("N1", "north", "http://n1.local"));
    engine
}

// =============================================================================
// Checksums
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Field order never changes the digest.
    #[test]
    fn test_checksum_ignores_field_order(fields in fields_strategy()) {
        let forward: Map<String, Value> = fields.iter().cloned().collect();
        let backward: Map<String, Value> = fields.iter().rev().cloned().collect();

        prop_assert_eq!(
            checksum::compute(&Value::Object(forward)),
            checksum::compute(&Value::Object(backward))
        );
    }

    /// The canonical rendering is valid JSON for the same value.
    #[test]
    fn test_canonical_json_parses_back(value in arbitrary_json_strategy()) {
        let rendered = checksum::canonical_json(&value);
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        prop_assert_eq!(parsed, value);
    }

    #[test]
    fn test_checksum_verifies_own_digest(value in arbitrary_json_strategy()) {
        let digest = checksum::compute(&value);
        prop_assert_eq!(digest.len(), 64);
        prop_assert!(checksum::verify(&value, &digest).is_ok());
        prop_assert!(checksum::verify(&value, &digest.to_uppercase()).is_ok());
    }

    /// Any change to a field value is detected.
    #[test]
    fn test_checksum_detects_changed_field(fields in fields_strategy(), replacement in any::<i64>()) {
        let original: Map<String, Value> = fields.iter().cloned().collect();
        let mut tampered = original.clone();
        let (key, old) = &fields[0];
        let new = Value::Number(replacement.into());
        prop_assume!(old != &new);
        tampered.insert(key.clone(), new);

        let digest = checksum::compute(&Value::Object(original));
        let result = checksum::verify(&Value::Object(tampered), &digest);
        prop_assert!(
            matches!(result, Err(SyncError::ChecksumMismatch { .. })),
            "expected checksum mismatch"
        );
    }
}

// =============================================================================
// Backoff
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Delays never shrink as retries grow and never exceed the cap.
    #[test]
    fn test_backoff_is_monotone_and_capped(
        base_ms in 0u64..10_000,
        extra_ms in 0u64..600_000,
        retries in 0u32..64,
    ) {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms + extra_ms),
            max_retries: 3,
        };

        let mut previous = Duration::ZERO;
        for retry in 0..retries {
            let delay = policy.delay_for(retry);
            prop_assert!(delay >= previous, "delay shrank at retry {}", retry);
            prop_assert!(delay <= policy.max_delay);
            previous = delay;
        }
        prop_assert_eq!(policy.delay_for(0), policy.base_delay);
    }
}

// =============================================================================
// Queue ordering and claims
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Higher priority first; equal priority in insertion order.
    #[test]
    fn test_batch_is_priority_then_fifo(priorities in prop::collection::vec(1i32..=10, 1..40)) {
        let rt = runtime();
        rt.block_on(async {
            let queue = MemoryQueue::new();
            for (i, priority) in priorities.iter().enumerate() {
                let req = OperationRequest::new(
                    OperationKind::Update,
                    "guard",
                    format!("G{i}"),
                    Value::Null,
                )
                .to_node("N1")
                .with_priority(*priority);
                queue.insert(SyncOperation::from_request(req, 0)).await.unwrap();
            }

            let batch = queue
                .next_batch(&Partition::Node("N1".into()), priorities.len(), 0)
                .await
                .unwrap();
            prop_assert_eq!(batch.len(), priorities.len());
            for pair in batch.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(
                    a.priority > b.priority || (a.priority == b.priority && a.seq < b.seq),
                    "out of order: ({}, {}) before ({}, {})",
                    a.priority, a.seq, b.priority, b.seq
                );
            }
            Ok(())
        })?;
    }

    /// However many workers race for an operation, exactly one claims it.
    #[test]
    fn test_single_claim_winner(workers in 2usize..24) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let winners = rt.block_on(async {
            let queue = Arc::new(MemoryQueue::new());
            let req = OperationRequest::new(OperationKind::Sync, "guard", "G1", Value::Null);
            let op = queue.insert(SyncOperation::from_request(req, 0)).await.unwrap();

            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let queue = queue.clone();
                    tokio::spawn(async move { queue.mark_processing(op.id, 0).await.unwrap() })
                })
                .collect();
            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            winners
        });
        prop_assert_eq!(winners, 1);
    }
}

// =============================================================================
// Malformed producer input
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_unknown_kind_strings_are_rejected(kind in ".*") {
        let known = ["create", "update", "delete", "sync", "upsert", "bulk"];
        let result = OperationRequest::from_parts(&kind, "guard", "G1", Value::Null);
        if known.contains(&kind.to_ascii_lowercase().as_str()) {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(
                matches!(result, Err(SyncError::InvalidOperationKind(_))),
                "expected InvalidOperationKind"
            );
        }
    }

    /// Random requests either land with a clamped priority and a valid
    /// checksum, or fail with a clean validation error.
    #[test]
    fn test_enqueue_never_panics(
        entity_type in prop_oneof![Just("guard".to_string()), Just("site".to_string()), "[a-z]{0,6}"],
        entity_id in "[ a-zA-Z0-9]{0,6}",
        target in prop_oneof![Just(None), Just(Some("N1".to_string())), Just(Some("N9".to_string()))],
        priority in any::<i32>(),
        payload in arbitrary_json_strategy(),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let engine = engine();
            let mut req = OperationRequest::new(OperationKind::Update, entity_type, entity_id, payload)
                .with_priority(priority);
            req.node_id = target;

            match engine.enqueue(req).await {
                Ok(receipt) => {
                    let op = engine.operation(receipt.id).await.unwrap().unwrap();
                    prop_assert!((1..=10).contains(&op.priority));
                    let digest = op.checksum.clone().unwrap();
                    prop_assert!(checksum::verify(&op.payload, &digest).is_ok());
                }
                Err(e) => prop_assert!(
                    matches!(
                        e,
                        SyncError::InvalidEntityType(_)
                            | SyncError::InvalidData(_)
                            | SyncError::UnknownNode(_)
                    ),
                    "unexpected error: {}",
                    e
                ),
            }
            Ok(())
        })?;
    }
}
