//! Decode GVSP chunk payloads into typed values.
//!
//! Chunk layout walking lives here rather than in `tl-gige::gvsp`: the core
//! wire codec stops at the trailer per spec.md's GVSP Non-goals, so this
//! module is self-contained — it owns both the raw chunk walk and the
//! known-id decode.

use std::collections::HashMap;

use bytes::{Buf, Bytes};
use thiserror::Error;
use tracing::trace;

/// One undecoded chunk entry: a 16-bit id followed by its raw payload.
#[derive(Debug, Clone)]
pub struct ChunkRaw {
    pub id: u16,
    pub data: Bytes,
}

/// Walk a chunk-data payload into its raw `id | data` entries.
///
/// Each entry is `id:u16 | reserved:u16 | length:u32 | data[length]`,
/// repeated until the buffer is exhausted.
pub fn parse_chunks(data: &[u8]) -> Result<Vec<ChunkRaw>, ChunkError> {
    let mut chunks = Vec::new();
    let mut cursor = data;
    while !cursor.is_empty() {
        if cursor.len() < 8 {
            return Err(ChunkError::Truncated);
        }
        let id = cursor.get_u16();
        let _reserved = cursor.get_u16();
        let length = cursor.get_u32() as usize;
        if cursor.len() < length {
            return Err(ChunkError::Truncated);
        }
        let data = Bytes::copy_from_slice(&cursor[..length]);
        cursor.advance(length);
        chunks.push(ChunkRaw { id, data });
    }
    Ok(chunks)
}

/// Known chunk identifiers defined by SFNC.
pub mod ids {
    /// Timestamp chunk (device time in ticks).
    pub const TIMESTAMP: u16 = 0x0001;
    /// Exposure time chunk (in microseconds).
    pub const EXPOSURE_TIME: u16 = 0x0002;
    /// Gain chunk (linear gain value).
    pub const GAIN: u16 = 0x0003;
    /// Line status bitfield chunk.
    pub const LINE_STATUS_ALL: u16 = 0x0004;
}

/// Typed representation of known chunk kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    Timestamp,
    ExposureTime,
    Gain,
    LineStatusAll,
}

/// Decoded value of a chunk entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkValue {
    Timestamp(u64),
    ExposureTime(f64),
    Gain(f64),
    LineStatusAll(u64),
}

pub type ChunkMap = HashMap<ChunkKind, ChunkValue>;

/// Errors that can occur while decoding chunk payloads.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk data truncated")]
    Truncated,
    #[error("invalid payload for chunk {0:#06x}")]
    InvalidPayload(u16),
}

pub fn decode_raw_chunks(chunks: &[ChunkRaw]) -> Result<ChunkMap, ChunkError> {
    let mut map = HashMap::new();
    for chunk in chunks {
        trace!(chunk_id = chunk.id, len = chunk.data.len(), "decoding chunk");
        match chunk.id {
            ids::TIMESTAMP => {
                if chunk.data.len() != 8 {
                    return Err(ChunkError::InvalidPayload(chunk.id));
                }
                let mut buf = chunk.data.clone();
                let value = buf.get_u64();
                map.insert(ChunkKind::Timestamp, ChunkValue::Timestamp(value));
            }
            ids::EXPOSURE_TIME => {
                if chunk.data.len() != 8 {
                    return Err(ChunkError::InvalidPayload(chunk.id));
                }
                let mut buf = chunk.data.clone();
                let value = buf.get_f64();
                map.insert(ChunkKind::ExposureTime, ChunkValue::ExposureTime(value));
            }
            ids::GAIN => {
                if chunk.data.len() != 8 {
                    return Err(ChunkError::InvalidPayload(chunk.id));
                }
                let mut buf = chunk.data.clone();
                let value = buf.get_f64();
                map.insert(ChunkKind::Gain, ChunkValue::Gain(value));
            }
            ids::LINE_STATUS_ALL => {
                let mut bytes = [0u8; 8];
                let len = chunk.data.len().min(bytes.len());
                bytes[..len].copy_from_slice(&chunk.data[..len]);
                let value = u64::from_be_bytes(bytes);
                map.insert(ChunkKind::LineStatusAll, ChunkValue::LineStatusAll(value));
            }
            _ => {}
        }
    }
    Ok(map)
}

/// Parse raw bytes into chunks and decode known values.
pub fn parse_chunk_bytes(data: &[u8]) -> Result<ChunkMap, ChunkError> {
    let raw = parse_chunks(data)?;
    decode_raw_chunks(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_chunks() {
        let mut data = Vec::new();
        data.extend_from_slice(&ids::TIMESTAMP.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&8u32.to_be_bytes());
        data.extend_from_slice(&0x1234_5678_9ABC_DEF0u64.to_be_bytes());
        data.extend_from_slice(&ids::EXPOSURE_TIME.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&8u32.to_be_bytes());
        data.extend_from_slice(&1.5f64.to_be_bytes());
        let map = parse_chunk_bytes(&data).expect("decode");
        assert!(matches!(
            map.get(&ChunkKind::Timestamp),
            Some(ChunkValue::Timestamp(0x1234_5678_9ABC_DEF0))
        ));
        assert!(matches!(
            map.get(&ChunkKind::ExposureTime),
            Some(ChunkValue::ExposureTime(v)) if (*v - 1.5).abs() < f64::EPSILON
        ));
    }
}
