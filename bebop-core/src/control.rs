//! Link configuration and health counters.
//!
//! This module manages:
//! - Device endpoints and ports announced during discovery
//! - Heartbeat timing, queue sizes and socket deadlines
//! - Validation of values the transport cannot run with
//! - Health counters shared by the transport tasks

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::reassembly::ReassemblyStats;

/// Configuration for a connection to the device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    /// Device address
    pub device_addr: String,
    /// Device UDP port receiving commands (controller -> device)
    pub c2d_port: u16,
    /// Local UDP port receiving telemetry and video (device -> controller)
    pub d2c_port: u16,
    /// Local stream port announced during discovery
    pub stream_port: u16,
    /// Local stream control port announced during discovery
    pub stream_control_port: u16,
    /// Device TCP port for the discovery handshake
    pub discovery_port: u16,
    /// Name announced during discovery
    pub controller_name: String,
    /// Bound on the whole discovery exchange
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Delay before the first heartbeat, so the first acknowledgments can flow
    #[serde(with = "humantime_serde")]
    pub heartbeat_delay: Duration,
    /// Interval between piloting heartbeats
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,
    /// Capacity of the reassembled video frame queue
    pub video_queue: usize,
    /// Capacity of the telemetry frame queue
    pub telemetry_queue: usize,

    /// Idle period after which the reader reports a silent link
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Bound on a single datagram send
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Send the all-states request and a flat trim once the link is up
    pub send_initial_commands: bool,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            device_addr: "192.168.42.1".to_string(),
            c2d_port: 54321,
            d2c_port: 43210,
            stream_port: 55004,
            stream_control_port: 55005,
            discovery_port: 44444,
            controller_name: "bebop-rs".to_string(),
            connect_timeout: Duration::from_secs(5),
            heartbeat_delay: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(25),
            outbound_queue: 256,
            video_queue: 32,
            telemetry_queue: 1024,
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_millis(500),
            send_initial_commands: true,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("device_addr is empty")]
    MissingDeviceAddr,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{0} must have room for at least one entry")]
    ZeroCapacity(&'static str),
}

impl DroneConfig {
    /// Reject values the link cannot run with.
    ///
    /// A zero heartbeat interval cannot drive a timer, and zero deadlines turn
    /// the reader and writer into busy loops. `heartbeat_delay` may be zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_addr.trim().is_empty() {
            return Err(ConfigError::MissingDeviceAddr);
        }

        let durations = [
            ("connect_timeout", self.connect_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
        ];
        if let Some((name, _)) = durations.into_iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroDuration(name));
        }

        let capacities = [
            ("outbound_queue", self.outbound_queue),
            ("video_queue", self.video_queue),
            ("telemetry_queue", self.telemetry_queue),
        ];
        if let Some((name, _)) = capacities.into_iter().find(|(_, c)| *c == 0) {
            return Err(ConfigError::ZeroCapacity(name));
        }

        Ok(())
    }
}

/// Snapshot of link health
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkHealth {
    /// Datagrams written to the device
    pub datagrams_sent: u64,
    /// Datagrams read from the device
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Inbound frames that failed to decode
    pub malformed_frames: u64,
    /// Datagrams dropped after exhausting write retries
    pub write_failures: u64,
    /// Read deadlines that expired without a datagram
    pub read_timeouts: u64,
    /// Outbound frames dropped because the queue was full
    pub outbound_dropped: u64,
    /// Telemetry frames dropped because the consumer was not keeping up
    pub telemetry_dropped: u64,
    /// Video reassembly counters
    pub video: ReassemblyStats,
}

/// Lock-free counters updated by the transport tasks
#[derive(Debug, Default)]
pub(crate) struct HealthCounters {
    pub datagrams_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub write_failures: AtomicU64,
    pub read_timeouts: AtomicU64,
    pub outbound_dropped: AtomicU64,
    pub telemetry_dropped: AtomicU64,
}

impl HealthCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, video: ReassemblyStats) -> LinkHealth {
        LinkHealth {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
            outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
            telemetry_dropped: self.telemetry_dropped.load(Ordering::Relaxed),
            video,
        }
    }
}
