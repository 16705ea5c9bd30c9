//! Frame Protocol
//!
//! Wire format for every envelope carried on the bus: a length-prefixed JSON
//! payload with a CRC32 checksum for integrity verification.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | InvocationRequest / Reply / Broadcast    |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! The bus already delimits messages, so one bus message carries exactly one
//! frame. The length field is still checked against the message size: a
//! mismatch means the message was truncated or padded in transit.
//!
//! # Security
//!
//! - Payloads are plain JSON data; nothing on the wire can name code to run
//! - Maximum frame size is enforced to prevent memory exhaustion
//! - CRC32 checksum detects data corruption in transit

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Maximum frame size (10 MB)
///
/// This prevents memory exhaustion from malicious or corrupted frames.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size: 4 bytes length + 4 bytes checksum
pub const HEADER_SIZE: usize = 8;

/// Compute CRC32 checksum for payload
#[inline]
fn compute_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encode a message to a length-prefixed frame with CRC32 checksum
///
/// # Errors
///
/// Returns `TransportError::SerializationError` if:
/// - JSON serialization fails
/// - Resulting frame exceeds `MAX_FRAME_SIZE`
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;

    if json.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Frame too large: {} bytes (max: {})",
            json.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = json.len() as u32;
    let checksum = compute_checksum(&json);

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode one complete frame
///
/// # Errors
///
/// - `SerializationError` if the frame is shorter than its header, its
///   length field disagrees with the message size, it exceeds
///   `MAX_FRAME_SIZE`, or the payload is not valid JSON for `T`
/// - `ChecksumMismatch` if the payload was corrupted
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    if frame.len() < HEADER_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Frame too short: {} bytes (header is {HEADER_SIZE})",
            frame.len()
        )));
    }

    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }

    let payload = &frame[HEADER_SIZE..];
    if payload.len() != len {
        return Err(TransportError::SerializationError(format!(
            "Frame length field says {len} bytes but {} arrived",
            payload.len()
        )));
    }

    let expected_checksum = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let actual_checksum = compute_checksum(payload);
    if actual_checksum != expected_checksum {
        return Err(TransportError::ChecksumMismatch {
            expected: expected_checksum,
            actual: actual_checksum,
        });
    }

    serde_json::from_slice(payload).map_err(|e| TransportError::SerializationError(e.to_string()))
}
