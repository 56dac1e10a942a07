//! Remote Payload Envelope and Compression
//!
//! Values written to the remote tier are wrapped in a small envelope so a
//! reader can tell how the body was encoded and when it was written:
//!
//! ```text
//! ┌──────────┬──────────────────────────┬─────────────────────────┐
//! │ tag (u8) │ stored_at ms (u64, BE)   │ body (raw or LZ4 block) │
//! └──────────┴──────────────────────────┴─────────────────────────┘
//! ```
//!
//! Bodies at or above the threshold (1KB by default) are LZ4-compressed when
//! the strategy asks for it. Compressed output is only kept when it is
//! actually smaller than the input.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Tag byte for an uncompressed body
const TAG_RAW: u8 = 0xC0;

/// Tag byte for an LZ4 block body (size-prefixed)
const TAG_LZ4: u8 = 0xC1;

/// Envelope header length: tag + timestamp
pub const HEADER_LEN: usize = 9;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Body encodings understood by the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 block compression
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Whether the body is stored compressed
    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionAlgorithm::None)
    }

    fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => TAG_RAW,
            CompressionAlgorithm::Lz4 => TAG_LZ4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_RAW => Some(CompressionAlgorithm::None),
            TAG_LZ4 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for payload compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Bodies smaller than this are stored raw
    pub threshold_bytes: usize,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 1024, // 1KB
            level: 4,
        }
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A decoded remote payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Original (decompressed) body
    pub body: Bytes,
    /// Encoding the body was stored with
    pub algorithm: CompressionAlgorithm,
    /// Wall-clock write time
    pub stored_at: DateTime<Utc>,
}

/// Encodes and decodes remote payload envelopes
pub struct PayloadCodec {
    config: CompressionConfig,
}

impl PayloadCodec {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Wrap `body`, compressing it when allowed and worthwhile.
    ///
    /// Compression failures fall back to a raw body.
    pub fn encode(&self, body: &[u8], compress: bool, stored_at: DateTime<Utc>) -> (Bytes, CompressionAlgorithm) {
        let mut algorithm = CompressionAlgorithm::None;
        let mut compressed = None;

        if compress && body.len() >= self.config.threshold_bytes {
            match lz4_compress(body, self.config.level) {
                Ok(out) if out.len() < body.len() => {
                    algorithm = CompressionAlgorithm::Lz4;
                    compressed = Some(out);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Compression failed, storing raw: {}", e),
            }
        }

        let payload: &[u8] = compressed.as_deref().unwrap_or(body);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(algorithm.tag());
        buf.put_u64(stored_at.timestamp_millis().max(0) as u64);
        buf.put_slice(payload);
        (buf.freeze(), algorithm)
    }

    /// Unwrap a stored payload, decompressing if needed
    pub fn decode(&self, key: &str, raw: &[u8]) -> Result<Envelope> {
        let (algorithm, stored_at) = parse_header(raw).ok_or_else(|| Error::CorruptPayload {
            key: key.to_string(),
            reason: "missing or unknown envelope header".into(),
        })?;

        let payload = &raw[HEADER_LEN..];
        let body = match algorithm {
            CompressionAlgorithm::None => Bytes::copy_from_slice(payload),
            CompressionAlgorithm::Lz4 => Bytes::from(lz4_decompress(payload)?),
        };

        Ok(Envelope {
            body,
            algorithm,
            stored_at,
        })
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Read only the envelope header (tag + write time).
///
/// Returns `None` for values not written through the envelope.
pub fn parse_header(raw: &[u8]) -> Option<(CompressionAlgorithm, DateTime<Utc>)> {
    if raw.len() < HEADER_LEN {
        return None;
    }
    let algorithm = CompressionAlgorithm::from_tag(raw[0])?;
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[1..HEADER_LEN]);
    let millis = i64::try_from(u64::from_be_bytes(ts)).ok()?;
    let stored_at = Utc.timestamp_millis_opt(millis).single()?;
    Some((algorithm, stored_at))
}

fn lz4_compress(data: &[u8], level: i32) -> Result<Vec<u8>> {
    lz4::block::compress(
        data,
        Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level)),
        true,
    )
    .map_err(|e| Error::CompressionFailed {
        algorithm: "LZ4".into(),
        reason: e.to_string(),
    })
}

fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>> {
    lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
        algorithm: "LZ4".into(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
