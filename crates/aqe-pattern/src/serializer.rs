//! Binary pattern codec.
//!
//! Frame layout:
//!
//! ```text
//! magic "PATT" (4B) | version (1B) | total_len (4B BE)
//! | embedding_len (4B BE) | embedding (little-endian f32)
//! | json_len (4B BE) | json_utf8
//! | checksum (32B SHA-256 over all preceding bytes)
//! ```
//!
//! The JSON payload is the pattern with the embedding removed; the
//! embedding travels as a typed array so float printing never perturbs it.

use crate::model::SharedPattern;
use crate::vector::{decode_f32_le, encode_f32_le};
use crate::{PatternError, PatternResult};
use sha2::{Digest, Sha256};

/// Frame magic bytes.
pub const PATTERN_MAGIC: [u8; 4] = *b"PATT";

/// Current frame format version.
pub const PATTERN_FORMAT_VERSION: u8 = 1;

/// Default upper bound on an encoded frame.
pub const MAX_PATTERN_SIZE: usize = 1 << 20; // 1 MiB

const HEADER_LEN: usize = 4 + 1 + 4;
const CHECKSUM_LEN: usize = 32;
const MIN_FRAME_LEN: usize = HEADER_LEN + 4 + 4 + CHECKSUM_LEN;

/// Encoder/decoder for the pattern wire format.
#[derive(Debug, Clone)]
pub struct PatternCodec {
    max_size: usize,
}

impl Default for PatternCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternCodec {
    /// Codec with the default size bound.
    pub fn new() -> Self {
        Self {
            max_size: MAX_PATTERN_SIZE,
        }
    }

    /// Codec with an explicit size bound.
    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    /// Encode a pattern into a framed byte vector.
    pub fn serialize(&self, pattern: &SharedPattern) -> PatternResult<Vec<u8>> {
        let mut json_value = serde_json::to_value(pattern)
            .map_err(|e| PatternError::Serialization(format!("pattern to JSON: {e}")))?;
        if let Some(obj) = json_value.as_object_mut() {
            obj.remove("embedding");
        }
        let json_bytes = serde_json::to_vec(&json_value)
            .map_err(|e| PatternError::Serialization(format!("JSON encode: {e}")))?;

        let embedding_bytes = encode_f32_le(&pattern.embedding);
        let total_len =
            HEADER_LEN + 4 + embedding_bytes.len() + 4 + json_bytes.len() + CHECKSUM_LEN;
        if total_len > self.max_size {
            return Err(PatternError::PatternTooLarge {
                size: total_len,
                max: self.max_size,
            });
        }

        let mut frame = Vec::with_capacity(total_len);
        frame.extend_from_slice(&PATTERN_MAGIC);
        frame.push(PATTERN_FORMAT_VERSION);
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&(embedding_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&embedding_bytes);
        frame.extend_from_slice(&(json_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&json_bytes);

        let checksum = Sha256::digest(&frame);
        frame.extend_from_slice(&checksum);
        Ok(frame)
    }

    /// Decode a framed byte vector, verifying structure and checksum.
    pub fn deserialize(&self, bytes: &[u8]) -> PatternResult<SharedPattern> {
        if bytes.len() > self.max_size {
            return Err(PatternError::PatternTooLarge {
                size: bytes.len(),
                max: self.max_size,
            });
        }
        if bytes.len() < MIN_FRAME_LEN {
            return Err(PatternError::Serialization(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0..4] != PATTERN_MAGIC {
            return Err(PatternError::Serialization("bad magic".to_string()));
        }
        let version = bytes[4];
        if version > PATTERN_FORMAT_VERSION || version == 0 {
            return Err(PatternError::Serialization(format!(
                "unsupported format version {version}"
            )));
        }

        let total_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        if total_len != bytes.len() {
            return Err(PatternError::Serialization(format!(
                "length mismatch: header says {total_len}, frame is {}",
                bytes.len()
            )));
        }

        let emb_len =
            u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]) as usize;
        let emb_start = HEADER_LEN + 4;
        let emb_end = emb_start
            .checked_add(emb_len)
            .ok_or_else(|| PatternError::Serialization("embedding length overflow".to_string()))?;
        if emb_end + 4 + CHECKSUM_LEN > bytes.len() {
            return Err(PatternError::Serialization(
                "embedding length exceeds frame".to_string(),
            ));
        }

        let json_len = u32::from_be_bytes([
            bytes[emb_end],
            bytes[emb_end + 1],
            bytes[emb_end + 2],
            bytes[emb_end + 3],
        ]) as usize;
        let json_start = emb_end + 4;
        let json_end = json_start
            .checked_add(json_len)
            .ok_or_else(|| PatternError::Serialization("json length overflow".to_string()))?;
        if json_end + CHECKSUM_LEN != bytes.len() {
            return Err(PatternError::Serialization(
                "json length inconsistent with frame".to_string(),
            ));
        }

        let expected = Sha256::digest(&bytes[..json_end]);
        if expected.as_slice() != &bytes[json_end..] {
            return Err(PatternError::Serialization("checksum mismatch".to_string()));
        }

        let embedding = decode_f32_le(&bytes[emb_start..emb_end])
            .ok_or_else(|| PatternError::Serialization("embedding not f32-aligned".to_string()))?;

        let mut json_value: serde_json::Value = serde_json::from_slice(&bytes[json_start..json_end])
            .map_err(|e| PatternError::Serialization(format!("JSON decode: {e}")))?;
        if let Some(obj) = json_value.as_object_mut() {
            obj.insert(
                "embedding".to_string(),
                serde_json::to_value(&embedding)
                    .map_err(|e| PatternError::Serialization(e.to_string()))?,
            );
        }

        serde_json::from_value(json_value)
            .map_err(|e| PatternError::Serialization(format!("pattern decode: {e}")))
    }
}
