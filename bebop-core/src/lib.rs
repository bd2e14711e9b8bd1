//! Core library for the Bebop drone link.
//!
//! This library implements the controller side of the device's UDP
//! protocol: framing, per-channel sequencing, acknowledgments, video
//! fragment reassembly and the piloting heartbeat.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `proto`: Frame codec, channel constants and video stream packets
//! - `sequence`: Per-channel sequence counters
//! - `ack`: Acknowledgments and ping replies
//! - `reassembly`: Video fragment reassembly and key-frame gating
//! - `command`: Piloting state and one-shot command payloads
//! - `control`: Link configuration and health counters
//! - `discovery`: TCP/JSON handshake run before the UDP link starts
//! - `transport`: Sockets, outbound writer, inbound dispatch and heartbeat
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use bebop_core::{discovery, Command, DroneConfig, Transport};
//!
//! let mut config = DroneConfig::default();
//! discovery::discover(&config).await?.apply(&mut config);
//!
//! let (transport, mut streams) = Transport::start(&config).await?;
//! transport.send_command(Command::TakeOff).await?;
//! while let Some(frame) = streams.video.recv().await {
//!     println!("frame {} ({} bytes)", frame.frame_number, frame.data.len());
//! }
//! transport.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod command;
pub mod control;
pub mod discovery;
pub mod proto;
pub mod reassembly;
pub mod sequence;
pub mod transport;

pub use command::{Command, CommandState, PilotingState};
pub use control::{DroneConfig, LinkHealth};
pub use proto::{FrameType, NetworkFrame, ProtocolError};
pub use reassembly::{VideoFrame, VideoReassembler};
pub use transport::{Streams, Transport, TransportError};
