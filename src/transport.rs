// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node transport: how envelopes reach local nodes.
//!
//! The engine only depends on the [`NodeTransport`] trait. [`HttpTransport`]
//! is the production implementation: JSON over HTTP(S) with a per-request
//! timeout, and zstd compression for bodies above a size threshold.
//!
//! Wire contract (relative to the node's `endpoint`):
//!
//! | Call     | Request                        | Success            |
//! |----------|--------------------------------|--------------------|
//! | dispatch | `POST /api/sync/receive` + [`Envelope`] | any 2xx   |
//! | probe    | `GET /api/health`              | any 2xx            |

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::node::LocalNode;
use crate::operation::{Direction, OperationId, OperationKind, SyncOperation};

pub const DISPATCH_PATH: &str = "/api/sync/receive";
pub const HEALTH_PATH: &str = "/api/health";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("node rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Framed operation as sent to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub operation_id: OperationId,
    pub operation_kind: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub direction: Direction,
    pub payload: Value,
    /// Digest of `payload` as sent (after entity transforms).
    pub checksum: String,
    /// Epoch millis at framing time.
    pub timestamp: i64,
    /// Id of the sending central node.
    pub origin: String,
}

impl Envelope {
    /// Frame `op` with an already transformed payload.
    #[must_use]
    pub fn for_operation(op: &SyncOperation, payload: Value, origin: &str, timestamp: i64) -> Self {
        let checksum = crate::checksum::compute(&payload);
        Self {
            operation_id: op.id,
            operation_kind: op.operation_kind,
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            direction: op.direction,
            payload,
            checksum,
            timestamp,
            origin: origin.to_string(),
        }
    }
}

/// Request/response primitive towards local nodes.
///
/// Implementations should bound their own I/O, but the engine also wraps
/// every call in a timeout.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Deliver an envelope. `Ok` means the node accepted it.
    async fn dispatch(&self, node: &LocalNode, envelope: &Envelope) -> Result<(), TransportError>;

    /// Liveness check.
    async fn probe(&self, node: &LocalNode) -> Result<(), TransportError>;
}

/// JSON-over-HTTP transport built on `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    request_timeout: Duration,
    probe_timeout: Duration,
    compression_threshold: usize,
}

impl HttpTransport {
    pub fn new(
        request_timeout: Duration,
        probe_timeout: Duration,
        compression_threshold: usize,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(probe_timeout.min(request_timeout))
            .build()
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        Ok(Self {
            client,
            request_timeout,
            probe_timeout,
            compression_threshold,
        })
    }

    /// Build from the engine configuration.
    pub fn from_config(config: &crate::config::SyncEngineConfig) -> Result<Self, TransportError> {
        Self::new(
            config.processing_timeout(),
            config.health_probe_timeout(),
            config.compression_threshold_bytes,
        )
    }

    fn url(node: &LocalNode, path: &str) -> String {
        format!("{}{}", node.endpoint.trim_end_matches('/'), path)
    }

    /// Serialize and, above the threshold, compress the envelope body.
    /// Returns the body and whether it was compressed.
    fn encode_body(&self, envelope: &Envelope) -> Result<(Vec<u8>, bool), TransportError> {
        let body = serde_json::to_vec(envelope).map_err(|e| TransportError::Encoding(e.to_string()))?;
        let raw_len = body.len();
        let (body, compressed) = crate::compression::frame_body(body, self.compression_threshold)
            .map_err(|e| TransportError::Encoding(e.to_string()))?;
        if compressed {
            debug!(raw = raw_len, compressed = body.len(), "Compressed envelope body");
        }
        Ok((body, compressed))
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn dispatch(&self, node: &LocalNode, envelope: &Envelope) -> Result<(), TransportError> {
        let (body, compressed) = self.encode_body(envelope)?;
        let start = Instant::now();

        let mut request = self
            .client
            .post(Self::url(node, DISPATCH_PATH))
            .timeout(self.request_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Sync-Checksum", envelope.checksum.as_str())
            .header("X-Sync-Operation", envelope.operation_id.to_string());
        if compressed {
            request = request.header(reqwest::header::CONTENT_ENCODING, "zstd");
        }

        let response = request.body(body).send().await.map_err(Self::classify)?;
        let status = response.status();
        debug!(
            node_id = %node.node_id,
            op_id = %envelope.operation_id,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dispatch response"
        );

        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn probe(&self, node: &LocalNode) -> Result<(), TransportError> {
        let response = self
            .client
            .get(Self::url(node, HEALTH_PATH))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(Self::classify)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeStatus;
    use crate::operation::OperationRequest;
    use serde_json::json;

    fn node(endpoint: &str) -> LocalNode {
        LocalNode {
            node_id: "N1".into(),
            geo_scope: "north".into(),
            endpoint: endpoint.into(),
            status: NodeStatus::Active,
            last_heartbeat: 0,
            registered_at: 0,
            consecutive_probe_failures: 0,
        }
    }

    fn envelope(payload: Value) -> Envelope {
        let op = SyncOperation::from_request(
            OperationRequest::new(OperationKind::Update, "guard", "G1", payload.clone()),
            0,
        );
        Envelope::for_operation(&op, payload, "central", 42)
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        assert_eq!(
            HttpTransport::url(&node("http://n1.local/"), DISPATCH_PATH),
            "http://n1.local/api/sync/receive"
        );
        assert_eq!(
            HttpTransport::url(&node("http://n1.local"), HEALTH_PATH),
            "http://n1.local/api/health"
        );
    }

    #[test]
    fn test_envelope_checksums_sent_payload() {
        let env = envelope(json!({"name": "Ada"}));
        assert_eq!(env.checksum, crate::checksum::compute(&json!({"name": "Ada"})));
        assert_eq!(env.origin, "central");
        assert_eq!(env.timestamp, 42);
    }

    #[test]
    fn test_small_bodies_are_not_compressed() {
        let transport = HttpTransport::new(Duration::from_secs(1), Duration::from_secs(1), 1024).unwrap();
        let (_, compressed) = transport.encode_body(&envelope(json!({"a": 1}))).unwrap();
        assert!(!compressed);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_large_bodies_are_compressed() {
        let transport = HttpTransport::new(Duration::from_secs(1), Duration::from_secs(1), 1024).unwrap();
        let big = json!({"notes": "patrol ".repeat(2_000)});
        let (body, compressed) = transport.encode_body(&envelope(big.clone())).unwrap();
        assert!(compressed);
        assert!(crate::compression::is_compressed(&body));

        let raw = crate::compression::unframe_body(&body).unwrap();
        let decoded: Envelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.payload, big);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let transport =
            HttpTransport::new(Duration::from_millis(300), Duration::from_millis(300), 0).unwrap();
        // Port 9 (discard) on localhost is almost never listening.
        let err = transport.probe(&node("http://127.0.0.1:9")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_) | TransportError::Timeout));
    }
}
