//! Configuration for the reconciliation engine.
//!
//! # Example
//!
//! ```
//! use sync_reconciler::{ConflictStrategy, SyncEngineConfig};
//!
//! // Minimal config (uses defaults, in-memory queue)
//! let config = SyncEngineConfig::default();
//! assert_eq!(config.tick_interval_ms, 5_000);
//! assert_eq!(config.conflict_strategy, ConflictStrategy::CentralWins);
//!
//! // Durable queue, faster ticks
//! let config = SyncEngineConfig {
//!     queue_url: Some("sqlite:reconciler.db?mode=rwc".into()),
//!     tick_interval_ms: 1_000,
//!     batch_size: 100,
//!     entity_types: vec!["guard".into(), "shift".into()],
//!     ..Default::default()
//! };
//! assert!(config.is_known_entity_type("shift"));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::conflict::ConflictStrategy;

/// Configuration for the reconciliation engine.
///
/// All fields have defaults. Without `queue_url` the queue lives in memory
/// and does not survive restarts.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEngineConfig {
    /// Durable queue connection string ("sqlite:..." or "mysql://...").
    #[serde(default)]
    pub queue_url: Option<String>,

    /// Processor tick interval.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Max operations pulled per node (and for broadcast) per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound for a single dispatch.
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Retry ceiling and backoff
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Expected heartbeat cadence; a node is reachable for two intervals.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Health probing
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,

    /// Silence after which an active node is marked inactive.
    #[serde(default = "default_offline_threshold_secs")]
    pub offline_threshold_secs: u64,

    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Envelopes at or above this size are zstd-compressed (0 = never).
    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,

    /// Entity types accepted at enqueue, in addition to any type with a
    /// registered handler. Empty means only handler-backed types.
    #[serde(default)]
    pub entity_types: Vec<String>,

    /// Retention for terminal operations
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Compute a checksum at enqueue when the producer did not supply one.
    #[serde(default = "default_checksum_on_enqueue")]
    pub checksum_on_enqueue: bool,

    /// Origin id stamped on outbound envelopes.
    #[serde(default = "default_central_node_id")]
    pub central_node_id: String,
}

fn default_tick_interval_ms() -> u64 { 5_000 }
fn default_batch_size() -> usize { 50 }
fn default_processing_timeout_ms() -> u64 { 30_000 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 1_000 }
fn default_retry_max_delay_ms() -> u64 { 300_000 } // 5 min
fn default_heartbeat_interval_secs() -> u64 { 60 }
fn default_health_check_interval_secs() -> u64 { 30 }
fn default_health_probe_timeout_ms() -> u64 { 5_000 }
fn default_offline_threshold_secs() -> u64 { 300 }
fn default_compression_threshold_bytes() -> usize { 64 * 1024 } // 64 KiB
fn default_retention_days() -> u32 { 30 }
fn default_cleanup_interval_secs() -> u64 { 3_600 }
fn default_checksum_on_enqueue() -> bool { true }
fn default_central_node_id() -> String { "central".to_string() }

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            queue_url: None,
            tick_interval_ms: default_tick_interval_ms(),
            batch_size: default_batch_size(),
            processing_timeout_ms: default_processing_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            health_probe_timeout_ms: default_health_probe_timeout_ms(),
            offline_threshold_secs: default_offline_threshold_secs(),
            conflict_strategy: ConflictStrategy::default(),
            compression_threshold_bytes: default_compression_threshold_bytes(),
            entity_types: Vec::new(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            checksum_on_enqueue: default_checksum_on_enqueue(),
            central_node_id: default_central_node_id(),
        }
    }
}

impl SyncEngineConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    #[must_use]
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms.max(1))
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    /// Probe timeout, kept strictly below the tick interval so a slow probe
    /// round cannot starve the processor.
    #[must_use]
    pub fn health_probe_timeout(&self) -> Duration {
        let ceiling = self.tick_interval_ms.saturating_sub(1).max(1);
        Duration::from_millis(self.health_probe_timeout_ms.clamp(1, ceiling))
    }

    #[must_use]
    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    #[must_use]
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Whether `entity_type` is listed in `entity_types`.
    #[must_use]
    pub fn is_known_entity_type(&self, entity_type: &str) -> bool {
        self.entity_types.iter().any(|t| t == entity_type)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(crate::SyncError::Config("batch_size must be > 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(crate::SyncError::Config("tick_interval_ms must be > 0".into()));
        }
        if self.health_check_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(crate::SyncError::Config("health and cleanup intervals must be > 0".into()));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(crate::SyncError::Config(
                "retry_max_delay_ms must be >= retry_base_delay_ms".into(),
            ));
        }
        if self.central_node_id.trim().is_empty() {
            return Err(crate::SyncError::Config("central_node_id must not be empty".into()));
        }
        Ok(())
    }
}
