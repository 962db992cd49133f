//! Frame Protocol
//!
//! Every envelope travels as one length-prefixed JSON frame guarded by a
//! CRC32 of the payload.
//!
//! ```text
//! +----------------+----------------+---------------------------+
//! | Length (4)     | CRC32 (4)      | JSON payload (Length)     |
//! | big-endian u32 | big-endian u32 | RpcEnvelope               |
//! +----------------+----------------+---------------------------+
//! ```
//!
//! The length is checked against [`MAX_FRAME_SIZE`] before any payload is
//! buffered, so a corrupt header cannot make a peer allocate unbounded
//! memory.

use serde::{de::DeserializeOwned, Serialize};

use super::TransportError;

/// Largest payload accepted in either direction (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Header: 4 bytes length + 4 bytes checksum
const HEADER_LEN: usize = 8;

/// Consumed prefix size above which the decoder compacts its buffer
const COMPACT_THRESHOLD: usize = 8 * 1024;

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(word)
}

/// Serialize `msg` into a complete frame
///
/// # Errors
///
/// `TransportError::SerializationError` if the message cannot be encoded
/// or the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;

    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
            TransportError::SerializationError(format!(
                "frame too large: {} bytes (max: {MAX_FRAME_SIZE})",
                payload.len()
            ))
        })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental decoder for a byte stream of frames
///
/// Feed it whatever the socket returns with [`push`](Self::push) and drain
/// complete messages with [`next_frame`](Self::next_frame).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    consumed: usize,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, data: &[u8]) {
        if self.consumed >= COMPACT_THRESHOLD && self.consumed * 2 >= self.buf.len() {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Decode the next complete frame, if one is buffered
    ///
    /// Returns `Ok(None)` when more bytes are needed. A checksum or JSON
    /// failure is returned as an error; the stream is not resynchronised
    /// afterwards, so callers drop the connection.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let rest = &self.buf[self.consumed..];
        if rest.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = read_u32(rest) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::SerializationError(format!(
                "frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if rest.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let expected = read_u32(&rest[4..]);
        let payload = &rest[HEADER_LEN..HEADER_LEN + len];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let msg = serde_json::from_slice(payload)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        self.consumed += HEADER_LEN + len;
        Ok(Some(msg))
    }
}
