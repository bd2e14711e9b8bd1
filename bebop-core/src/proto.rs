//! Protocol definitions for the Bebop network link.
//!
//! This module defines the wire frame exchanged with the device on both UDP
//! sockets. Unlike most network protocols, every multi-byte field is
//! little-endian.
//!
//! # Frame Format
//!
//! Every frame carries:
//! - Type (1 byte): Frame type (data, data requiring an ack, ack, low latency)
//! - Channel ID (1 byte): Logical buffer the frame belongs to
//! - Sequence number (1 byte): Per-channel counter, wraps 255 -> 0
//! - Total length (4 bytes): Header plus payload length
//! - Payload (variable)
//!
//! Total header size: 7 bytes + variable payload. A single datagram may carry
//! several frames back-to-back; see [`split_datagram`].

pub mod stream;

use std::fmt;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 7;

/// Largest payload the u32 length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize - HEADER_SIZE;

/// Number of channel ids managed by the device network stack.
///
/// Acknowledgments for channel `c` travel on `c + MAX_CHANNEL_ID / 2`.
pub const MAX_CHANNEL_ID: u16 = 256;

/// Well-known channel (buffer) identifiers
pub mod channel {
    /// Device -> controller keepalive ping
    pub const PING: u8 = 0;
    /// Controller -> device echo of a ping
    pub const PONG: u8 = 1;
    /// Controller -> device commands without acknowledgment
    pub const COMMAND_NONACK: u8 = 10;
    /// Controller -> device commands requiring acknowledgment
    pub const COMMAND_ACK: u8 = 11;
    /// Controller -> device emergency commands
    pub const COMMAND_EMERGENCY: u8 = 12;
    /// Controller -> device video fragment acknowledgments
    pub const VIDEO_ACK: u8 = 13;
    /// Device -> controller video fragments
    pub const VIDEO_DATA: u8 = 125;
    /// Device -> controller events
    pub const EVENT: u8 = 126;
    /// Device -> controller navigation data
    pub const NAVDATA: u8 = 127;
}

/// Channel on which the acknowledgment for `channel_id` must be sent.
pub fn ack_channel_for(channel_id: u8) -> u8 {
    ((u16::from(channel_id) + MAX_CHANNEL_ID / 2) % MAX_CHANNEL_ID) as u8
}

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Uninitialized = 0,
    /// Acknowledgment of a `DataWithAck` frame
    Ack = 1,
    /// Plain data, no delivery confirmation
    Data = 2,
    /// Low-latency data (video fragments)
    DataLowLatency = 3,
    /// Data requiring delivery confirmation
    DataWithAck = 4,
}

impl FrameType {
    /// Raw wire value
    pub fn raw(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Uninitialized),
            1 => Ok(Self::Ack),
            2 => Ok(Self::Data),
            3 => Ok(Self::DataLowLatency),
            4 => Ok(Self::DataWithAck),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ack => "ack",
            Self::Data => "data",
            Self::DataLowLatency => "low-latency",
            Self::DataWithAck => "data-with-ack",
        };
        f.write_str(name)
    }
}

/// Complete frame with header fields and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFrame {
    /// Frame type
    pub frame_type: FrameType,
    /// Channel (buffer) identifier
    pub channel_id: u8,
    /// Per-channel sequence number
    pub seq: u8,
    /// Frame payload
    pub payload: Vec<u8>,
}

impl NetworkFrame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, channel_id: u8, seq: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            channel_id,
            seq,
            payload,
        }
    }

    /// Create an outbound frame whose sequence number is assigned when it
    /// is written
    pub fn unsequenced(frame_type: FrameType, channel_id: u8, payload: Vec<u8>) -> Self {
        Self::new(frame_type, channel_id, 0, payload)
    }

    /// Total size of the encoded frame in bytes
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(&self.payload, self.frame_type, self.channel_id, self.seq)
    }

    /// Decode the frame at the start of `buf`.
    ///
    /// Bytes past the declared length are ignored; use [`split_datagram`] to
    /// walk every frame in a datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = decode_prefix(buf)?;
        Ok(frame)
    }
}

/// Encode a frame: type, channel, seq, little-endian total length, payload.
pub fn encode(
    payload: &[u8],
    frame_type: FrameType,
    channel_id: u8,
    seq: u8,
) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let total = (HEADER_SIZE + payload.len()) as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(frame_type.raw());
    buf.push(channel_id);
    buf.push(seq);
    buf.extend_from_slice(&total.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one frame and return it with the number of bytes it occupied.
fn decode_prefix(buf: &[u8]) -> Result<(NetworkFrame, usize), ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Err(ProtocolError::InvalidLength {
            expected: HEADER_SIZE,
            actual: buf.len(),
        });
    }

    let declared = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]) as usize;
    if declared < HEADER_SIZE {
        return Err(ProtocolError::InvalidLength {
            expected: HEADER_SIZE,
            actual: declared,
        });
    }
    if declared > buf.len() {
        return Err(ProtocolError::Truncated {
            declared,
            actual: buf.len(),
        });
    }

    let frame_type = FrameType::try_from(buf[0])?;
    let frame = NetworkFrame {
        frame_type,
        channel_id: buf[1],
        seq: buf[2],
        payload: buf[HEADER_SIZE..declared].to_vec(),
    };
    Ok((frame, declared))
}

/// Iterate every frame packed into one datagram.
///
/// Iteration ends after the first malformed frame, which is yielded as an
/// error, since the remaining bytes can no longer be delimited.
pub fn split_datagram(buf: &[u8]) -> FrameIter<'_> {
    FrameIter { rest: buf }
}

/// Iterator over the frames of a datagram
pub struct FrameIter<'a> {
    rest: &'a [u8],
}

impl Iterator for FrameIter<'_> {
    type Item = Result<NetworkFrame, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match decode_prefix(self.rest) {
            Ok((frame, used)) => {
                self.rest = &self.rest[used..];
                Some(Ok(frame))
            }
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            }
        }
    }
}

/// Protocol-related errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Truncated frame: declared {declared} bytes, buffer holds {actual}")]
    Truncated { declared: usize, actual: usize },

    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}
