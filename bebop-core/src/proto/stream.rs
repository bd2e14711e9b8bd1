//! Video stream sub-protocol carried inside low-latency frames.
//!
//! Fragment payload (5-byte sub-header + data):
//! - Frame number (2 bytes, LE)
//! - Frame flags (1 byte): bit 0 marks a key frame
//! - Fragment index (1 byte)
//! - Fragments per frame (1 byte)
//!
//! Ack payload (18 bytes): frame number (u16 LE), high bitmap (u64 LE),
//! low bitmap (u64 LE).

use super::ProtocolError;

/// Size of the fragment sub-header in bytes
pub const FRAGMENT_HEADER_SIZE: usize = 5;

/// Frame flag bit marking a key frame (iframe)
pub const FLAG_KEY_FRAME: u8 = 0b0000_0001;

/// Number of fragment indices the ack bitmap can describe
pub const ACK_BITMAP_BITS: usize = 128;

/// One datagram's worth of a video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment {
    pub frame_number: u16,
    pub frame_flags: u8,
    pub fragment_index: u8,
    pub fragments_per_frame: u8,
    pub payload: Vec<u8>,
}

impl StreamFragment {
    /// Whether the frame this fragment belongs to is a key frame
    pub fn is_key_frame(&self) -> bool {
        self.frame_flags & FLAG_KEY_FRAME != 0
    }

    /// Encode fragment to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.frame_number.to_le_bytes());
        buf.push(self.frame_flags);
        buf.push(self.fragment_index);
        buf.push(self.fragments_per_frame);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode fragment from a low-latency frame payload
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAGMENT_HEADER_SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: FRAGMENT_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        Ok(Self {
            frame_number: u16::from_le_bytes([buf[0], buf[1]]),
            frame_flags: buf[2],
            fragment_index: buf[3],
            fragments_per_frame: buf[4],
            payload: buf[FRAGMENT_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Cumulative per-fragment receipt bitmap for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckPacket {
    pub frame_number: u16,
    /// Fragments 64..128
    pub high_bits: u64,
    /// Fragments 0..64
    pub low_bits: u64,
}

impl AckPacket {
    /// Size of the encoded ack in bytes
    pub const SIZE: usize = 18;

    /// Empty bitmap for `frame_number`
    pub fn new(frame_number: u16) -> Self {
        Self {
            frame_number,
            high_bits: 0,
            low_bits: 0,
        }
    }

    /// Mark fragment `index` as received.
    ///
    /// Returns false when the index is beyond what the bitmap can carry.
    pub fn set_fragment(&mut self, index: u8) -> bool {
        let index = usize::from(index);
        if index < 64 {
            self.low_bits |= 1u64 << index;
            true
        } else if index < ACK_BITMAP_BITS {
            self.high_bits |= 1u64 << (index - 64);
            true
        } else {
            false
        }
    }

    /// Whether fragment `index` is marked
    pub fn is_set(&self, index: u8) -> bool {
        let index = usize::from(index);
        if index < 64 {
            self.low_bits & (1u64 << index) != 0
        } else if index < ACK_BITMAP_BITS {
            self.high_bits & (1u64 << (index - 64)) != 0
        } else {
            false
        }
    }

    /// Encode ack to bytes
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.frame_number.to_le_bytes());
        buf[2..10].copy_from_slice(&self.high_bits.to_le_bytes());
        buf[10..18].copy_from_slice(&self.low_bits.to_le_bytes());
        buf
    }

    /// Decode ack from bytes
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            return Err(ProtocolError::InvalidLength {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let mut high = [0u8; 8];
        high.copy_from_slice(&buf[2..10]);
        let mut low = [0u8; 8];
        low.copy_from_slice(&buf[10..18]);

        Ok(Self {
            frame_number: u16::from_le_bytes([buf[0], buf[1]]),
            high_bits: u64::from_le_bytes(high),
            low_bits: u64::from_le_bytes(low),
        })
    }
}
