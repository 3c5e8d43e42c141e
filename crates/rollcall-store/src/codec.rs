//! Column encodings: descriptor blobs and timestamps.

use chrono::{DateTime, SecondsFormat, Utc};
use rollcall_core::Descriptor;

/// Pack a descriptor as little-endian f32 bytes.
pub fn encode_descriptor(descriptor: &Descriptor) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(descriptor.len() * 4);
    for value in &descriptor.values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Unpack a descriptor blob written by [`encode_descriptor`].
pub fn decode_descriptor(blob: &[u8], dim: usize) -> Result<Descriptor, CodecError> {
    if blob.len() != dim * 4 {
        return Err(CodecError::BlobLength {
            expected: dim * 4,
            actual: blob.len(),
        });
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Descriptor::new(values))
}

/// Fixed-width RFC 3339 so that text order equals time order.
pub fn encode_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_timestamp(text: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CodecError::Timestamp(format!("{text}: {e}")))
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid descriptor blob length: expected {expected}, got {actual}")]
    BlobLength { expected: usize, actual: usize },
    #[error("invalid timestamp {0}")]
    Timestamp(String),
}
