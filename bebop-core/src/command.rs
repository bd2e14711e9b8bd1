//! Piloting state and command payloads.
//!
//! The piloting command (PCMD) is not sent when a setter is called. Setters
//! only update the shared [`CommandState`]; the transport heartbeat
//! serializes a snapshot of it on every tick.
//!
//! Command payload layout:
//! - Project (1 byte)
//! - Class (1 byte)
//! - Command id (2 bytes, LE)
//! - Arguments (variable, LE)

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::proto::channel;

/// Largest magnitude accepted by the directional setters
pub const MAX_MAGNITUDE: i32 = 100;

const PROJECT_COMMON: u8 = 0;
const PROJECT_ARDRONE3: u8 = 1;

const COMMON_CLASS_COMMON: u8 = 4;
const COMMON_CMD_ALL_STATES: u16 = 0;

const CLASS_PILOTING: u8 = 0;
const CLASS_MEDIA_RECORD: u8 = 7;
const CLASS_SPEED_SETTINGS: u8 = 11;
const CLASS_MEDIA_STREAMING: u8 = 21;

const PILOTING_CMD_FLAT_TRIM: u16 = 0;
const PILOTING_CMD_TAKE_OFF: u16 = 1;
const PILOTING_CMD_PCMD: u16 = 2;
const PILOTING_CMD_LANDING: u16 = 3;
const PILOTING_CMD_EMERGENCY: u16 = 4;

const MEDIA_RECORD_CMD_VIDEO: u16 = 1;
const SPEED_SETTINGS_CMD_HULL_PROTECTION: u16 = 2;
const SPEED_SETTINGS_CMD_OUTDOOR: u16 = 3;
const MEDIA_STREAMING_CMD_VIDEO_ENABLE: u16 = 0;
const MEDIA_STREAMING_CMD_VIDEO_STREAM_MODE: u16 = 1;

/// Snapshot of the directional control values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PilotingState {
    /// Activates roll/pitch movement
    pub flag: bool,
    pub roll: i8,
    pub pitch: i8,
    pub yaw: i8,
    pub gaz: i8,
}

impl PilotingState {
    /// PCMD payload: flag, roll, pitch, yaw, gaz, then the unused heading (psi)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = header(PROJECT_ARDRONE3, CLASS_PILOTING, PILOTING_CMD_PCMD);
        buf.push(u8::from(self.flag));
        buf.push(self.roll as u8);
        buf.push(self.pitch as u8);
        buf.push(self.yaw as u8);
        buf.push(self.gaz as u8);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }
}

/// Clamp a magnitude to `[0, MAX_MAGNITUDE]`
fn clamp_magnitude(value: i32) -> i8 {
    value.clamp(0, MAX_MAGNITUDE) as i8
}

/// Shared, synchronized piloting state.
///
/// Written by caller threads through the directional setters and read by the
/// heartbeat task.
#[derive(Debug, Default)]
pub struct CommandState {
    inner: Mutex<PilotingState>,
}

impl CommandState {
    /// Create a state with every axis at rest
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PilotingState> {
        // The state is plain data, a panicking writer cannot leave it torn.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, apply: impl FnOnce(&mut PilotingState)) {
        let mut state = self.lock();
        state.flag = true;
        apply(&mut state);
    }

    /// Current values
    pub fn snapshot(&self) -> PilotingState {
        *self.lock()
    }

    /// Climb at `val` percent
    pub fn up(&self, val: i32) {
        self.update(|s| s.gaz = clamp_magnitude(val));
    }

    /// Descend at `val` percent
    pub fn down(&self, val: i32) {
        self.update(|s| s.gaz = -clamp_magnitude(val));
    }

    /// Pitch forward at `val` percent
    pub fn forward(&self, val: i32) {
        self.update(|s| s.pitch = clamp_magnitude(val));
    }

    /// Pitch backward at `val` percent
    pub fn backward(&self, val: i32) {
        self.update(|s| s.pitch = -clamp_magnitude(val));
    }

    /// Roll right at `val` percent
    pub fn right(&self, val: i32) {
        self.update(|s| s.roll = clamp_magnitude(val));
    }

    /// Roll left at `val` percent
    pub fn left(&self, val: i32) {
        self.update(|s| s.roll = -clamp_magnitude(val));
    }

    /// Rotate clockwise at `val` percent
    pub fn clockwise(&self, val: i32) {
        self.update(|s| s.yaw = clamp_magnitude(val));
    }

    /// Rotate counter-clockwise at `val` percent
    pub fn counter_clockwise(&self, val: i32) {
        self.update(|s| s.yaw = -clamp_magnitude(val));
    }

    /// Reset every axis and the flag
    pub fn stop(&self) {
        *self.lock() = PilotingState::default();
    }
}

/// Video recording state argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Start,
    Stop,
}

/// One-shot device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask the device to send all of its states
    AllStates,
    FlatTrim,
    TakeOff,
    Landing,
    /// Cut the motors immediately
    Emergency,
    VideoRecord(RecordState),
    HullProtection(bool),
    Outdoor(bool),
    VideoEnable(bool),
    VideoStreamMode(i8),
}

impl Command {
    /// Channel the command must be sent on
    pub fn channel(&self) -> u8 {
        match self {
            Self::Emergency => channel::COMMAND_EMERGENCY,
            _ => channel::COMMAND_NONACK,
        }
    }

    /// Serialize the command payload
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::AllStates => header(PROJECT_COMMON, COMMON_CLASS_COMMON, COMMON_CMD_ALL_STATES),
            Self::FlatTrim => header(PROJECT_ARDRONE3, CLASS_PILOTING, PILOTING_CMD_FLAT_TRIM),
            Self::TakeOff => header(PROJECT_ARDRONE3, CLASS_PILOTING, PILOTING_CMD_TAKE_OFF),
            Self::Landing => header(PROJECT_ARDRONE3, CLASS_PILOTING, PILOTING_CMD_LANDING),
            Self::Emergency => header(PROJECT_ARDRONE3, CLASS_PILOTING, PILOTING_CMD_EMERGENCY),
            Self::VideoRecord(state) => {
                let mut buf = header(PROJECT_ARDRONE3, CLASS_MEDIA_RECORD, MEDIA_RECORD_CMD_VIDEO);
                let raw: u32 = match state {
                    RecordState::Stop => 0,
                    RecordState::Start => 1,
                };
                buf.extend_from_slice(&raw.to_le_bytes());
                // Mass storage id
                buf.push(0);
                buf
            }
            Self::HullProtection(on) => with_u8(
                header(
                    PROJECT_ARDRONE3,
                    CLASS_SPEED_SETTINGS,
                    SPEED_SETTINGS_CMD_HULL_PROTECTION,
                ),
                u8::from(on),
            ),
            Self::Outdoor(on) => with_u8(
                header(PROJECT_ARDRONE3, CLASS_SPEED_SETTINGS, SPEED_SETTINGS_CMD_OUTDOOR),
                u8::from(on),
            ),
            Self::VideoEnable(on) => with_u8(
                header(
                    PROJECT_ARDRONE3,
                    CLASS_MEDIA_STREAMING,
                    MEDIA_STREAMING_CMD_VIDEO_ENABLE,
                ),
                u8::from(on),
            ),
            Self::VideoStreamMode(mode) => with_u8(
                header(
                    PROJECT_ARDRONE3,
                    CLASS_MEDIA_STREAMING,
                    MEDIA_STREAMING_CMD_VIDEO_STREAM_MODE,
                ),
                mode as u8,
            ),
        }
    }
}

fn header(project: u8, class: u8, command: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(project);
    buf.push(class);
    buf.extend_from_slice(&command.to_le_bytes());
    buf
}

fn with_u8(mut buf: Vec<u8>, arg: u8) -> Vec<u8> {
    buf.push(arg);
    buf
}
