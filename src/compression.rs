// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! zstd framing for large dispatch bodies.
//!
//! Compression is a transport optimization only: the receiving node sees a
//! `Content-Encoding: zstd` header and the magic bytes, and checksums are
//! always taken over the uncompressed payload.
//!
//! # Feature Flag
//!
//! Requires the `compression` feature (enabled by default). Without it,
//! [`frame_body`] passes every body through unchanged.

/// Zstd frame magic (little-endian 0xFD2FB528).
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Level 3 keeps dispatch latency low.
#[cfg(feature = "compression")]
const LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    CompressFailed(String),

    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    #[error("body is zstd-compressed but the compression feature is disabled")]
    Unsupported,
}

/// Whether `data` starts with a zstd frame header.
#[inline]
#[must_use]
pub fn is_compressed(data: &[u8]) -> bool {
    data.starts_with(&ZSTD_MAGIC)
}

/// Compress `body` when it is at least `threshold` bytes and compression
/// actually shrinks it. `threshold == 0` disables compression.
///
/// Returns the body to send and whether it is compressed.
#[cfg(feature = "compression")]
pub fn frame_body(body: Vec<u8>, threshold: usize) -> Result<(Vec<u8>, bool), CompressionError> {
    if threshold == 0 || body.len() < threshold {
        return Ok((body, false));
    }
    let compressed =
        zstd::encode_all(body.as_slice(), LEVEL).map_err(|e| CompressionError::CompressFailed(e.to_string()))?;
    if compressed.len() >= body.len() {
        return Ok((body, false));
    }
    crate::metrics::record_compression(body.len(), compressed.len());
    Ok((compressed, true))
}

#[cfg(not(feature = "compression"))]
pub fn frame_body(body: Vec<u8>, _threshold: usize) -> Result<(Vec<u8>, bool), CompressionError> {
    Ok((body, false))
}

/// Undo [`frame_body`]. Bodies without a zstd header pass through.
pub fn unframe_body(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    #[cfg(feature = "compression")]
    {
        zstd::decode_all(data).map_err(|e| CompressionError::DecompressFailed(e.to_string()))
    }
    #[cfg(not(feature = "compression"))]
    {
        Err(CompressionError::Unsupported)
    }
}
