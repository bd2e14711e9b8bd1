//! Video frame reassembly with key-frame resynchronization.
//!
//! Fragments arrive lossy and out of order. They are collected per frame
//! number; a frame is finalized when the first fragment of a different frame
//! arrives. Finalization delivers the frame only if every declared fragment
//! is present and the stream is not waiting for a key frame after a loss.
//!
//! Nothing here ever blocks or fails outward: incomplete frames, frames that
//! follow a loss, and frames the consumer has no room for are dropped and
//! counted.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::proto::stream::{AckPacket, StreamFragment, FLAG_KEY_FRAME};

/// A fully reassembled video frame (one access unit of the elementary stream)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub frame_number: u16,
    pub key_frame: bool,
    pub data: Vec<u8>,
}

/// Reassembly counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub fragments_received: u64,
    pub frames_emitted: u64,
    pub dropped_incomplete: u64,
    pub dropped_malformed: u64,
    pub dropped_waiting_for_iframe: u64,
    pub dropped_backpressure: u64,
}

/// Why a finalized frame was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    /// A declared fragment index never arrived
    Incomplete(u8),
    /// Declared counts disagree, an index is out of range, or zero fragments
    Malformed,
    WaitingForIframe,
    Backpressure,
}

/// The frame currently being collected
#[derive(Debug)]
struct InProgressFrame {
    frame_number: u16,
    flags: u8,
    /// Declared by the fragment that opened the frame
    fragments_per_frame: u8,
    consistent: bool,
    fragments: BTreeMap<u8, Vec<u8>>,
    ack: AckPacket,
}

impl InProgressFrame {
    fn start(fragment: &StreamFragment) -> Self {
        Self {
            frame_number: fragment.frame_number,
            flags: fragment.frame_flags,
            fragments_per_frame: fragment.fragments_per_frame,
            consistent: true,
            fragments: BTreeMap::new(),
            ack: AckPacket::new(fragment.frame_number),
        }
    }

    fn insert(&mut self, fragment: StreamFragment) {
        if fragment.fragments_per_frame != self.fragments_per_frame
            || fragment.fragment_index >= self.fragments_per_frame
        {
            self.consistent = false;
        }
        if !self.ack.set_fragment(fragment.fragment_index) {
            tracing::debug!(
                frame = self.frame_number,
                index = fragment.fragment_index,
                "fragment index beyond ack bitmap"
            );
        }
        self.fragments
            .insert(fragment.fragment_index, fragment.payload);
    }

    fn is_key_frame(&self) -> bool {
        self.flags & FLAG_KEY_FRAME != 0
    }

    /// Concatenate fragments `0..fragments_per_frame` in index order
    fn assemble(&self) -> Result<Vec<u8>, DropReason> {
        if !self.consistent || self.fragments_per_frame == 0 {
            return Err(DropReason::Malformed);
        }

        let mut data = Vec::with_capacity(self.fragments.values().map(Vec::len).sum());
        for index in 0..self.fragments_per_frame {
            match self.fragments.get(&index) {
                Some(payload) => data.extend_from_slice(payload),
                None => return Err(DropReason::Incomplete(index)),
            }
        }
        Ok(data)
    }
}

/// Per-stream reassembly state, reset only when the frame number changes
#[derive(Debug, Default)]
pub struct ReassemblyState {
    current: Option<InProgressFrame>,
    waiting_for_iframe: bool,
}

/// Reassembles video frames and produces per-fragment acknowledgments
pub struct VideoReassembler {
    state: ReassemblyState,
    output: mpsc::Sender<VideoFrame>,
    stats: ReassemblyStats,
}

impl VideoReassembler {
    /// Create a reassembler delivering into `output`.
    ///
    /// Delivery uses `try_send`: when the channel is full the frame is
    /// dropped rather than stalling the inbound path.
    pub fn new(output: mpsc::Sender<VideoFrame>) -> Self {
        Self {
            state: ReassemblyState::default(),
            output,
            stats: ReassemblyStats::default(),
        }
    }

    /// Account for one fragment and return the ack to send back.
    ///
    /// The ack is produced for every fragment, not only at frame boundaries,
    /// so the device gets continuous retransmission feedback.
    pub fn push(&mut self, fragment: StreamFragment) -> AckPacket {
        self.stats.fragments_received += 1;

        let mut current = match self.state.current.take() {
            Some(frame) if frame.frame_number == fragment.frame_number => frame,
            Some(previous) => {
                let expected = previous.frame_number.wrapping_add(1);
                self.finalize(previous);
                if fragment.frame_number != expected {
                    tracing::debug!(
                        expected,
                        got = fragment.frame_number,
                        "video frame lost, waiting for key frame"
                    );
                    self.state.waiting_for_iframe = true;
                }
                InProgressFrame::start(&fragment)
            }
            None => InProgressFrame::start(&fragment),
        };

        current.insert(fragment);
        let ack = current.ack;
        self.state.current = Some(current);
        ack
    }

    /// Decide whether the frame being replaced is delivered
    fn finalize(&mut self, frame: InProgressFrame) {
        let result = if frame.is_key_frame() || !self.state.waiting_for_iframe {
            frame.assemble().and_then(|data| {
                if frame.is_key_frame() {
                    self.state.waiting_for_iframe = false;
                }
                self.deliver(VideoFrame {
                    frame_number: frame.frame_number,
                    key_frame: frame.is_key_frame(),
                    data,
                })
            })
        } else {
            Err(DropReason::WaitingForIframe)
        };

        match result {
            Ok(()) => self.stats.frames_emitted += 1,
            Err(reason) => {
                tracing::debug!(frame = frame.frame_number, ?reason, "video frame dropped");
                match reason {
                    DropReason::Incomplete(_) => self.stats.dropped_incomplete += 1,
                    DropReason::Malformed => self.stats.dropped_malformed += 1,
                    DropReason::WaitingForIframe => self.stats.dropped_waiting_for_iframe += 1,
                    DropReason::Backpressure => self.stats.dropped_backpressure += 1,
                }
            }
        }
    }

    fn deliver(&self, frame: VideoFrame) -> Result<(), DropReason> {
        match self.output.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                Err(DropReason::Backpressure)
            }
        }
    }

    /// Whether delivery is suspended until the next key frame
    pub fn waiting_for_iframe(&self) -> bool {
        self.state.waiting_for_iframe
    }

    /// Frame number currently being collected
    pub fn in_progress_frame(&self) -> Option<u16> {
        self.state.current.as_ref().map(|f| f.frame_number)
    }

    /// Ack bitmap of the frame currently being collected
    pub fn current_ack(&self) -> Option<AckPacket> {
        self.state.current.as_ref().map(|f| f.ack)
    }

    /// Counters since creation
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(frame: u16, key: bool, index: u8, total: u8, data: &[u8]) -> StreamFragment {
        StreamFragment {
            frame_number: frame,
            frame_flags: if key { FLAG_KEY_FRAME } else { 0 },
            fragment_index: index,
            fragments_per_frame: total,
            payload: data.to_vec(),
        }
    }

    fn reassembler(capacity: usize) -> (VideoReassembler, mpsc::Receiver<VideoFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (VideoReassembler::new(tx), rx)
    }

    #[test]
    fn test_in_order_fragments() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(1, true, 0, 2, b"AB"));
        let ack = video.push(fragment(1, true, 1, 2, b"CD"));
        assert_eq!(ack.frame_number, 1);
        assert_eq!(ack.low_bits, 0b11);
        assert_eq!(ack.high_bits, 0);

        // Nothing is delivered until the next frame starts
        assert!(rx.try_recv().is_err());

        video.push(fragment(2, false, 0, 1, b"EF"));
        let frame = rx.try_recv().expect("frame 1 not emitted");
        assert_eq!(frame.frame_number, 1);
        assert!(frame.key_frame);
        assert_eq!(frame.data, b"ABCD");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_out_of_order_fragments() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(1, true, 1, 2, b"CD"));
        let ack = video.push(fragment(1, true, 0, 2, b"AB"));
        assert_eq!(ack.low_bits, 0b11);

        video.push(fragment(2, false, 0, 1, b""));
        let frame = rx.try_recv().expect("frame 1 not emitted");
        assert_eq!(frame.data, b"ABCD");
    }

    #[test]
    fn test_ack_bitmap_matches_received_indices() {
        let (mut video, _rx) = reassembler(8);

        video.push(fragment(3, false, 0, 100, b"a"));
        video.push(fragment(3, false, 5, 100, b"b"));
        let ack = video.push(fragment(3, false, 70, 100, b"c"));

        assert_eq!(ack.low_bits, (1 << 5) | 1);
        assert_eq!(ack.high_bits, 1 << 6);
    }

    #[test]
    fn test_ack_bitmap_resets_per_frame() {
        let (mut video, _rx) = reassembler(8);

        video.push(fragment(1, true, 0, 2, b"a"));
        video.push(fragment(1, true, 1, 2, b"b"));
        let ack = video.push(fragment(2, false, 1, 2, b"c"));

        assert_eq!(ack.frame_number, 2);
        assert_eq!(ack.low_bits, 0b10);
        assert_eq!(video.current_ack(), Some(ack));
    }

    #[test]
    fn test_incomplete_frame_dropped_without_gap() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(1, true, 0, 2, b"AB"));
        video.push(fragment(2, false, 0, 1, b"X"));

        assert!(rx.try_recv().is_err());
        assert!(!video.waiting_for_iframe());
        assert_eq!(video.stats().dropped_incomplete, 1);

        video.push(fragment(3, false, 0, 1, b"Y"));
        assert_eq!(rx.try_recv().expect("frame 2 not emitted").data, b"X");
    }

    #[test]
    fn test_gap_waits_for_key_frame() {
        let (mut video, mut rx) = reassembler(8);

        // Frame 5 complete
        video.push(fragment(5, false, 0, 1, b"five"));
        // Frame 6 loses fragment 1
        video.push(fragment(6, false, 0, 2, b"six"));
        assert_eq!(rx.try_recv().expect("frame 5 not emitted").frame_number, 5);

        // Frame 8 skips 7 entirely
        video.push(fragment(8, false, 0, 1, b"eight"));
        assert!(video.waiting_for_iframe());

        // Frame 9 arrives, frame 8 is complete but not a key frame
        video.push(fragment(9, false, 0, 1, b"nine"));
        assert!(rx.try_recv().is_err());
        assert!(video.waiting_for_iframe());

        // Frame 10 is a key frame
        video.push(fragment(10, true, 0, 2, b"te"));
        video.push(fragment(10, true, 1, 2, b"n"));
        video.push(fragment(11, false, 0, 1, b"eleven"));

        let frame = rx.try_recv().expect("key frame not emitted");
        assert_eq!(frame.frame_number, 10);
        assert_eq!(frame.data, b"ten");
        assert!(!video.waiting_for_iframe());
        assert!(rx.try_recv().is_err());

        let stats = video.stats();
        assert_eq!(stats.frames_emitted, 2);
        assert_eq!(stats.dropped_incomplete, 1);
        assert_eq!(stats.dropped_waiting_for_iframe, 2);
    }

    #[test]
    fn test_partial_frame_then_key_frame() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(5, false, 0, 1, b"5"));
        video.push(fragment(6, false, 0, 2, b"6a"));
        video.push(fragment(7, true, 0, 1, b"7"));
        video.push(fragment(8, false, 0, 1, b"8"));

        let numbers: Vec<u16> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.frame_number)
            .collect();
        assert_eq!(numbers, vec![5, 7]);
        assert!(!video.waiting_for_iframe());
    }

    #[test]
    fn test_incomplete_key_frame_keeps_waiting() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(1, false, 0, 1, b"1"));
        video.push(fragment(3, true, 0, 2, b"3a"));
        assert!(video.waiting_for_iframe());
        video.push(fragment(4, false, 0, 1, b"4"));
        video.push(fragment(5, false, 0, 1, b"5"));

        assert_eq!(rx.try_recv().expect("frame 1").frame_number, 1);
        assert!(rx.try_recv().is_err());
        assert!(video.waiting_for_iframe());
    }

    #[test]
    fn test_frame_number_wraps() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(u16::MAX, true, 0, 1, b"last"));
        video.push(fragment(0, false, 0, 1, b"first"));
        video.push(fragment(1, false, 0, 1, b"next"));

        assert!(!video.waiting_for_iframe());
        assert_eq!(rx.try_recv().expect("65535").frame_number, u16::MAX);
        assert_eq!(rx.try_recv().expect("0").frame_number, 0);
    }

    #[test]
    fn test_malformed_declared_count() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(1, true, 0, 2, b"a"));
        video.push(fragment(1, true, 1, 3, b"b"));
        video.push(fragment(2, false, 0, 0, b""));
        video.push(fragment(3, false, 0, 1, b""));

        assert!(rx.try_recv().is_err());
        assert_eq!(video.stats().dropped_malformed, 2);
    }

    #[test]
    fn test_index_beyond_declared_count() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(1, true, 0, 1, b"a"));
        video.push(fragment(1, true, 1, 1, b"b"));
        video.push(fragment(2, false, 0, 1, b""));

        assert!(rx.try_recv().is_err());
        assert_eq!(video.stats().dropped_malformed, 1);
    }

    #[test]
    fn test_retransmitted_fragment_overwrites() {
        let (mut video, mut rx) = reassembler(8);

        video.push(fragment(1, true, 0, 1, b"old"));
        let ack = video.push(fragment(1, true, 0, 1, b"new"));
        assert_eq!(ack.low_bits, 1);
        video.push(fragment(2, false, 0, 1, b""));

        assert_eq!(rx.try_recv().expect("frame 1").data, b"new");
    }

    #[test]
    fn test_backpressure_drops_frame() {
        let (mut video, mut rx) = reassembler(1);

        video.push(fragment(1, true, 0, 1, b"one"));
        video.push(fragment(2, false, 0, 1, b"two"));
        // Consumer has not read frame 1, so frame 2 has nowhere to go
        video.push(fragment(3, false, 0, 1, b"three"));

        assert_eq!(video.stats().frames_emitted, 1);
        assert_eq!(video.stats().dropped_backpressure, 1);
        assert_eq!(rx.try_recv().expect("frame 1").data, b"one");
        assert!(rx.try_recv().is_err());

        // Room again: the stream carries on without resynchronizing
        video.push(fragment(4, false, 0, 1, b"four"));
        assert_eq!(rx.try_recv().expect("frame 3").data, b"three");
    }

    #[test]
    fn test_key_frame_dropped_on_backpressure_ends_wait() {
        let (mut video, mut rx) = reassembler(1);

        video.push(fragment(1, false, 0, 1, b"one"));
        video.push(fragment(3, true, 0, 1, b"key"));
        assert!(video.waiting_for_iframe());

        // Frame 1 still occupies the only slot, so the complete key frame is dropped
        video.push(fragment(4, false, 0, 1, b"four"));
        assert_eq!(video.stats().dropped_backpressure, 1);
        assert!(!video.waiting_for_iframe());

        assert_eq!(rx.try_recv().expect("frame 1").data, b"one");
        video.push(fragment(5, false, 0, 1, b"five"));
        assert_eq!(rx.try_recv().expect("frame 4").data, b"four");
    }

    #[test]
    fn test_closed_consumer_is_not_an_error() {
        let (mut video, rx) = reassembler(1);
        drop(rx);

        video.push(fragment(1, true, 0, 1, b"one"));
        video.push(fragment(2, false, 0, 1, b"two"));

        assert_eq!(video.stats().dropped_backpressure, 1);
        assert_eq!(video.in_progress_frame(), Some(2));
    }
}
