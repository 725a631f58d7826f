//! On-disk envelope for transaction records
//!
//! Every record file holds exactly one envelope:
//!
//! ```text
//! magic("HCTX", 4) + version(4) + payload_len(4) + payload + crc32(4)
//! ```
//!
//! The payload is the record encoded as named-field MessagePack, so fields
//! added later with `#[serde(default)]` still decode from older files. The
//! CRC covers the header and the payload.

use crate::error::{LogError, LogResult};
use hotclone_core::TransactionRecord;

/// Magic bytes at the start of every record file
pub const RECORD_MAGIC: &[u8; 4] = b"HCTX";

/// Current envelope format version
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Bytes before the payload
pub const HEADER_SIZE: usize = 12;

/// Bytes after the payload
pub const TRAILER_SIZE: usize = 4;

/// Serialize a record into a checksummed envelope
pub fn encode_record(record: &TransactionRecord) -> LogResult<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(record).map_err(|e| LogError::Encode(e.to_string()))?;
    let payload_len =
        u32::try_from(payload.len()).map_err(|_| LogError::Encode("record too large".into()))?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    buf.extend_from_slice(RECORD_MAGIC);
    buf.extend_from_slice(&RECORD_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(&payload);

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Validate an envelope and decode the record inside
pub fn decode_record(data: &[u8]) -> LogResult<TransactionRecord> {
    if data.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(LogError::LengthMismatch {
            expected: HEADER_SIZE + TRAILER_SIZE,
            actual: data.len(),
        });
    }

    if &data[0..4] != RECORD_MAGIC {
        return Err(LogError::InvalidMagic);
    }

    let version = read_u32(data, 4);
    if version != RECORD_FORMAT_VERSION {
        return Err(LogError::UnsupportedVersion(version));
    }

    let payload_len = read_u32(data, 8) as usize;
    let expected = HEADER_SIZE + payload_len + TRAILER_SIZE;
    if data.len() != expected {
        return Err(LogError::LengthMismatch {
            expected,
            actual: data.len(),
        });
    }

    let crc_offset = HEADER_SIZE + payload_len;
    let stored = read_u32(data, crc_offset);
    let computed = crc32fast::hash(&data[..crc_offset]);
    if stored != computed {
        return Err(LogError::ChecksumMismatch { stored, computed });
    }

    rmp_serde::from_slice(&data[HEADER_SIZE..crc_offset]).map_err(|e| LogError::Decode(e.to_string()))
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}
