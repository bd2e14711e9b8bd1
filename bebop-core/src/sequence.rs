//! Per-channel sequence numbers.
//!
//! Every channel has its own 8-bit sequence space. The transport writer
//! numbers frames as it dequeues them, so the order on the wire is the
//! order of the numbers. The counters are atomics, so the allocator can be
//! shared between tasks without a lock.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::proto::{self, NetworkFrame, ProtocolError};

/// Number of distinct channel ids
const CHANNEL_COUNT: usize = 256;

/// Allocator of per-channel sequence numbers
pub struct SequenceAllocator {
    counters: Box<[AtomicU8; CHANNEL_COUNT]>,
}

impl SequenceAllocator {
    /// Create an allocator with every channel at zero
    pub fn new() -> Self {
        Self {
            counters: Box::new(std::array::from_fn(|_| AtomicU8::new(0))),
        }
    }

    /// Pre-increment the counter of `channel_id` and return the new value.
    ///
    /// The first call for a channel returns 1; 255 is followed by 0.
    pub fn next(&self, channel_id: u8) -> u8 {
        self.counters[usize::from(channel_id)]
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// Last value handed out for `channel_id` (0 if never used)
    pub fn current(&self, channel_id: u8) -> u8 {
        self.counters[usize::from(channel_id)].load(Ordering::Relaxed)
    }

    /// Number `frame` on its channel and encode it.
    ///
    /// Any sequence number already in `frame` is ignored.
    pub fn encode(&self, frame: &NetworkFrame) -> Result<Vec<u8>, ProtocolError> {
        proto::encode(
            &frame.payload,
            frame.frame_type,
            frame.channel_id,
            self.next(frame.channel_id),
        )
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::FrameType;
    use std::sync::Arc;

    #[test]
    fn test_fresh_channel_starts_at_one() {
        let seq = SequenceAllocator::new();
        assert_eq!(seq.current(10), 0);
        assert_eq!(seq.next(10), 1);
        assert_eq!(seq.next(10), 2);
        assert_eq!(seq.next(10), 3);
        assert_eq!(seq.current(10), 3);
    }

    #[test]
    fn test_wraparound() {
        let seq = SequenceAllocator::new();
        for expected in 1..=255u8 {
            assert_eq!(seq.next(7), expected);
        }
        assert_eq!(seq.next(7), 0);
        assert_eq!(seq.next(7), 1);
    }

    #[test]
    fn test_channels_are_independent() {
        let seq = SequenceAllocator::new();
        assert_eq!(seq.next(10), 1);
        assert_eq!(seq.next(10), 2);
        assert_eq!(seq.next(13), 1);
        assert_eq!(seq.next(255), 1);
        assert_eq!(seq.next(10), 3);
    }

    #[test]
    fn test_encode_numbers_frame() {
        let seq = SequenceAllocator::new();
        let frame = NetworkFrame::new(FrameType::Data, 1, 200, vec![3]);

        let first = seq.encode(&frame).expect("encode failed");
        let second = seq.encode(&frame).expect("encode failed");
        assert_eq!(first[2], 1);
        assert_eq!(second[2], 2);
        assert_eq!(&first[7..], &[3]);
    }

    #[test]
    fn test_concurrent_allocation() {
        let seq = Arc::new(SequenceAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        seq.next(10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        // 4000 increments modulo 256
        assert_eq!(seq.current(10), (4000 % 256) as u8);
    }
}
