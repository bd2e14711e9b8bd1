//! Delivery confirmations and keepalive replies.
//!
//! The responder never retries: retransmission is driven by the device
//! re-sending frames it has not seen acknowledged.

use crate::proto::{ack_channel_for, channel, FrameType, NetworkFrame};

/// Builds ack and pong frames for inbound frames.
///
/// Replies are unsequenced; the writer numbers them on their reply channel
/// when they leave the outbound queue.
#[derive(Debug, Default)]
pub struct AckResponder;

impl AckResponder {
    pub fn new() -> Self {
        Self
    }

    /// Acknowledge a `DataWithAck` frame.
    ///
    /// The ack travels on the channel's ack buffer and carries the sequence
    /// number being confirmed.
    pub fn on_ack_required(&self, frame: &NetworkFrame) -> NetworkFrame {
        NetworkFrame::unsequenced(
            FrameType::Ack,
            ack_channel_for(frame.channel_id),
            vec![frame.seq],
        )
    }

    /// Echo a ping back on the pong channel so the device can measure RTT
    pub fn on_ping(&self, frame: &NetworkFrame) -> NetworkFrame {
        NetworkFrame::unsequenced(FrameType::Data, channel::PONG, frame.payload.clone())
    }
}
