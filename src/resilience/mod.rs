//! Failure handling: operation backoff, infrastructure retry, per-node circuits.

pub mod circuit_breaker;
pub mod retry;
