//! Frame encoding and decoding for peer links.
//!
//! Every frame is a fixed 6-byte header followed by the payload:
//!
//! ```text
//! +------------------+----------------------+-------------------+
//! | Frame type       | Payload length       | Payload           |
//! | 2 bytes (BE16)   | 4 bytes (BE32)       | length bytes      |
//! +------------------+----------------------+-------------------+
//! ```
//!
//! There is no version byte; the type space is closed.

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::TransportResult;
use crate::core::{
    FRAME_HEADER_SIZE, FRAME_TYPE_ACK, FRAME_TYPE_CLOSE, FRAME_TYPE_DATA, FRAME_TYPE_KEEPALIVE,
    FRAME_TYPE_NACK,
};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameType {
    /// Application data.
    Data = FRAME_TYPE_DATA,
    /// Liveness probe.
    KeepAlive = FRAME_TYPE_KEEPALIVE,
    /// Positive acknowledgment.
    Ack = FRAME_TYPE_ACK,
    /// Negative acknowledgment.
    Nack = FRAME_TYPE_NACK,
    /// Graceful close.
    Close = FRAME_TYPE_CLOSE,
}

impl FrameType {
    /// Parse a frame type from its wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            FRAME_TYPE_DATA => Some(Self::Data),
            FRAME_TYPE_KEEPALIVE => Some(Self::KeepAlive),
            FRAME_TYPE_ACK => Some(Self::Ack),
            FRAME_TYPE_NACK => Some(Self::Nack),
            FRAME_TYPE_CLOSE => Some(Self::Close),
            _ => None,
        }
    }

    /// Wire value of this frame type.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::KeepAlive => "KEEPALIVE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type.
    pub frame_type: FrameType,
    /// Declared payload length.
    pub length: u32,
}

impl FrameHeader {
    /// Serialize the header (6 bytes).
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.frame_type.as_u16().to_be_bytes());
        buf[2..6].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse a header and check the declared length against `max_frame_size`.
    ///
    /// The length is checked before the type so that an oversized frame is
    /// always reported as such.
    pub fn from_bytes(bytes: &[u8], max_frame_size: usize) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let raw_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let length = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        if length as u64 > max_frame_size as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: length as usize,
                max: max_frame_size,
            });
        }

        let frame_type = FrameType::from_u16(raw_type).ok_or(FrameError::UnknownType(raw_type))?;
        Ok(Self { frame_type, length })
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Create a data frame.
    pub fn data(payload: Vec<u8>) -> Self {
        Self::new(FrameType::Data, payload)
    }

    /// Create an empty keepalive frame.
    pub fn keepalive() -> Self {
        Self::new(FrameType::KeepAlive, Vec::new())
    }

    /// Size of this frame on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.frame_type, &self.payload)
    }
}

/// Errors in frame parsing and size enforcement.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Declared or supplied payload exceeds the configured maximum.
    #[error("frame payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Frame type outside the known set.
    #[error("unknown frame type: 0x{0:04x}")]
    UnknownType(u16),

    /// Not enough bytes for a header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },
}

/// Encode a frame: header followed by payload.
///
/// The caller enforces the maximum frame size; a payload longer than
/// `u32::MAX` cannot be represented and is a programming error upstream.
pub fn encode(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader {
        frame_type,
        length: payload.len() as u32,
    };
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Read exactly one frame from `reader`.
///
/// Reads the 6 header bytes, rejects a declared length above
/// `max_frame_size` before touching the payload, then reads exactly
/// `length` payload bytes. Never returns a partial frame.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> TransportResult<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::from_bytes(&header_buf, max_frame_size)?;

    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Frame::new(header.frame_type, payload))
}
