// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Two layers live here:
//!
//! - [`RetryConfig`] + [`retry`]: in-process retry of infrastructure calls
//!   (queue database connect, schema setup, reads).
//! - [`BackoffPolicy`] + [`RetryManager`]: re-admission of failed sync
//!   operations through the queue. An operation is never slept on; it is
//!   parked as `RetryScheduled` with a not-before timestamp.
//!
//! # Example
//!
//! ```
//! use sync_reconciler::resilience::retry::{BackoffPolicy, RetryConfig};
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, 5);
//!
//! // Operations: 1s, 2s, 4s ... capped at 5 minutes
//! let policy = BackoffPolicy::default();
//! assert_eq!(policy.delay_for(0), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(4));
//! assert_eq!(policy.delay_for(30), Duration::from_secs(300));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SyncEngineConfig;
use crate::error::{Result, SyncError};
use crate::operation::SyncOperation;
use crate::queue::QueueStore;

/// Configuration for connection/query retry behavior.
///
/// Use the preset constructors:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual queries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, including the first.
    pub max_retries: usize,
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block the tick).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if attempts >= config.max_retries {
                    return Err(err);
                }
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_retries, err, delay
                );
                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

/// Backoff for failed sync operations: `min(base × 2^retry_count, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Re-attempts allowed after the first failure.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SyncEngineConfig::default())
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &SyncEngineConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            max_retries: config.max_retries,
        }
    }

    /// Delay before re-admission after the `retry_count`-th retry.
    /// Non-decreasing in `retry_count` and never above `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    #[must_use]
    pub fn can_retry(&self, op: &SyncOperation) -> bool {
        op.retry_count < self.max_retries
    }
}

/// What the retry manager did with a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Parked as `RetryScheduled` until `not_before`.
    Scheduled {
        attempt: u32,
        delay: Duration,
        not_before: i64,
    },
    /// Retries used up; now `Failed`.
    Exhausted,
    /// Error is not retryable; now `Failed`.
    Terminal,
}

impl RetryDecision {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled { .. })
    }
}

/// Routes a failed, claimed operation to `RetryScheduled` or `Failed`.
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: BackoffPolicy,
}

impl RetryManager {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: BackoffPolicy) {
        self.policy = policy;
    }

    #[must_use]
    pub fn can_retry(&self, op: &SyncOperation) -> bool {
        self.policy.can_retry(op)
    }

    /// Record `error` against `op`, which must currently be `Processing`.
    pub async fn handle_failure(
        &self,
        queue: &dyn QueueStore,
        op: &SyncOperation,
        error: &SyncError,
        now: i64,
    ) -> Result<RetryDecision> {
        let message = error.to_string();

        if !error.is_retryable() {
            queue.mark_failed(op.id, &message, now).await?;
            debug!(op_id = %op.id, kind = error.kind(), "Non-retryable failure");
            return Ok(RetryDecision::Terminal);
        }

        if !self.can_retry(op) {
            queue.mark_failed(op.id, &message, now).await?;
            warn!(
                op_id = %op.id,
                retries = op.retry_count,
                error = %message,
                "Retries exhausted, operation failed"
            );
            return Ok(RetryDecision::Exhausted);
        }

        let delay = self.policy.delay_for(op.retry_count);
        let not_before = now.saturating_add(delay.as_millis() as i64);
        let attempt = queue.schedule_retry(op.id, not_before, &message, now).await?;
        crate::metrics::record_retry_scheduled(op.node_id.as_deref().unwrap_or("broadcast"), attempt);
        debug!(op_id = %op.id, attempt, ?delay, error = %message, "Retry scheduled");

        Ok(RetryDecision::Scheduled {
            attempt,
            delay,
            not_before,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationKind, OperationRequest, OperationStatus};
    use crate::queue::MemoryQueue;
    use crate::transport::TransportError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: std::result::Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(TestError(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: std::result::Result<i32, TestError> = retry("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(TestError("always fail".to_string()))
            }
        })
        .await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_retries: 10,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    fn claimed_op() -> SyncOperation {
        SyncOperation::from_request(
            OperationRequest::new(OperationKind::Update, "guard", "G1", json!({})).to_node("N1"),
            0,
        )
    }

    async fn setup() -> (MemoryQueue, SyncOperation) {
        let queue = MemoryQueue::new();
        let op = queue.insert(claimed_op()).await.unwrap();
        assert!(queue.mark_processing(op.id, 0).await.unwrap());
        (queue, op)
    }

    fn manager(max_retries: u32) -> RetryManager {
        RetryManager::new(BackoffPolicy {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(60_000),
            max_retries,
        })
    }

    #[tokio::test]
    async fn test_transient_failure_is_scheduled() {
        let (queue, op) = setup().await;
        let err = SyncError::Transport(TransportError::Timeout);

        let decision = manager(3).handle_failure(&queue, &op, &err, 10_000).await.unwrap();
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(1),
                not_before: 11_000,
            }
        );
        let stored = queue.get(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::RetryScheduled);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.next_attempt_at, Some(11_000));
    }

    #[tokio::test]
    async fn test_integrity_failure_bypasses_retry() {
        let (queue, op) = setup().await;
        let err = SyncError::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };

        let decision = manager(3).handle_failure(&queue, &op, &err, 0).await.unwrap();
        assert_eq!(decision, RetryDecision::Terminal);
        let stored = queue.get(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let (queue, mut op) = setup().await;
        op.retry_count = 3;
        let err = SyncError::NodeUnavailable("N1".into());

        let decision = manager(3).handle_failure(&queue, &op, &err, 0).await.unwrap();
        assert_eq!(decision, RetryDecision::Exhausted);
        assert!(decision.is_terminal());
        assert_eq!(queue.get(op.id).await.unwrap().unwrap().status, OperationStatus::Failed);
    }
}
