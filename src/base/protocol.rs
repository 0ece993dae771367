// Wire protocol of the differential-drive base controller
//
// Telemetry frame (controller -> host), 8 bytes, big-endian u16 fields:
//   [0xFF, 0xFE, left_hi, left_lo, right_hi, right_lo, volt_hi, volt_lo]
// Command frame (host -> controller), 6 bytes:
//   [0xFF, 0xFE, left_mag, left_dir, right_mag, right_dir]
//
// Motion and battery payloads share one frame with no type discriminator,
// so every valid frame is decoded as carrying both.

use std::f64::consts::PI;
use std::io::{self, Read};

use tracing::trace;

use super::kinematics::WheelState;

/// Frame header bytes
pub const HEADER: [u8; 2] = [0xFF, 0xFE];

/// Telemetry frame length
pub const FRAME_LEN: usize = 8;

/// Command frame length
pub const COMMAND_LEN: usize = 6;

/// Raw speed value reported for a stationary wheel
const SPEED_OFFSET: f64 = 500.0;

/// Encoder counts per wheel revolution
const COUNTS_PER_REVOLUTION: f64 = 1560.0;

/// Speed samples per second (one tick = counts per 10 ms window)
const SAMPLES_PER_SECOND: f64 = 100.0;

/// Largest magnitude a command byte can carry
pub const MAX_COMMAND_MAGNITUDE: u8 = u8::MAX;

/// Errors when interpreting raw bytes as a telemetry frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame must be 8 bytes, got {0}")]
    Length(usize),

    #[error("Invalid header: {0:02X?}")]
    Header([u8; 2]),
}

/// A validated 8-byte telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    fn field(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.0[offset], self.0[offset + 1]])
    }

    /// Raw left wheel speed field (bytes 2-3)
    pub fn left_speed_raw(&self) -> u16 {
        self.field(2)
    }

    /// Raw right wheel speed field (bytes 4-5)
    pub fn right_speed_raw(&self) -> u16 {
        self.field(4)
    }

    /// Raw battery field (bytes 6-7), hundredths of a volt
    pub fn voltage_raw(&self) -> u16 {
        self.field(6)
    }
}

impl TryFrom<&[u8]> for Frame {
    type Error = FrameError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; FRAME_LEN] = bytes
            .try_into()
            .map_err(|_| FrameError::Length(bytes.len()))?;
        if bytes[..2] != HEADER {
            return Err(FrameError::Header([bytes[0], bytes[1]]));
        }
        Ok(Self(bytes))
    }
}

/// Recovers aligned frames from an unaligned byte stream
///
/// Keeps a window of up to 8 bytes. A full window with a valid header is
/// emitted as a frame; otherwise exactly one byte is dropped from the front
/// and the window is refilled, so alignment is recovered one position at a
/// time.
#[derive(Debug, Default)]
pub struct FrameSynchronizer {
    window: [u8; FRAME_LEN],
    filled: usize,
    discarded: u64,
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes dropped while searching for a header
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Read what the source has and return a frame if one became aligned.
    ///
    /// Timeouts, short reads and end-of-stream all mean "no data yet" and
    /// return `Ok(None)`; bytes already read stay in the window.
    pub fn poll<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<Option<Frame>> {
        let read = match source.read(&mut self.window[self.filled..]) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                0
            }
            Err(e) => return Err(e),
        };
        self.filled += read;
        Ok(self.check_window())
    }

    fn check_window(&mut self) -> Option<Frame> {
        if self.filled < FRAME_LEN {
            return None;
        }
        match Frame::try_from(&self.window[..]) {
            Ok(frame) => {
                self.filled = 0;
                Some(frame)
            }
            Err(_) => {
                trace!("Resync: dropping 0x{:02X}", self.window[0]);
                self.window.rotate_left(1);
                self.filled = FRAME_LEN - 1;
                self.discarded += 1;
                None
            }
        }
    }
}

/// Convert a signed speed in encoder ticks to wheel angular velocity (rad/s)
pub fn ticks_to_rad_per_sec(ticks: f64) -> f64 {
    ticks * SAMPLES_PER_SECOND / COUNTS_PER_REVOLUTION * 2.0 * PI
}

/// Convert wheel angular velocity (rad/s) to encoder ticks, truncated toward zero
pub fn rad_per_sec_to_ticks(omega: f64) -> i64 {
    // `as` saturates on overflow and maps NaN to 0
    (omega / (2.0 * PI) * COUNTS_PER_REVOLUTION / SAMPLES_PER_SECOND) as i64
}

/// Decode both wheel angular velocities from a frame
pub fn decode_wheel_state(frame: &Frame) -> WheelState {
    let omega = |raw: u16| ticks_to_rad_per_sec(raw as f64 - SPEED_OFFSET);
    WheelState {
        left: omega(frame.left_speed_raw()),
        right: omega(frame.right_speed_raw()),
    }
}

/// Decode battery voltage (volts) from a frame
pub fn decode_voltage(frame: &Frame) -> f64 {
    frame.voltage_raw() as f64 / 100.0
}

/// Wheel rotation direction flag on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Reverse = 0,
    #[default]
    Forward = 1,
}

/// Saturated, hardware-ready wheel command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WheelCommand {
    pub left_magnitude: u8,
    pub left_direction: Direction,
    pub right_magnitude: u8,
    pub right_direction: Direction,
}

impl WheelCommand {
    /// Build a command from target wheel angular velocities (rad/s)
    pub fn from_wheel_state(target: WheelState) -> Self {
        let (left_magnitude, left_direction) = split_ticks(rad_per_sec_to_ticks(target.left));
        let (right_magnitude, right_direction) = split_ticks(rad_per_sec_to_ticks(target.right));
        Self {
            left_magnitude,
            left_direction,
            right_magnitude,
            right_direction,
        }
    }

    pub fn to_bytes(&self) -> [u8; COMMAND_LEN] {
        [
            HEADER[0],
            HEADER[1],
            self.left_magnitude,
            self.left_direction as u8,
            self.right_magnitude,
            self.right_direction as u8,
        ]
    }
}

/// Split a signed tick count into a clamped magnitude and direction
fn split_ticks(ticks: i64) -> (u8, Direction) {
    let direction = if ticks >= 0 {
        Direction::Forward
    } else {
        Direction::Reverse
    };
    let magnitude = ticks.unsigned_abs().min(MAX_COMMAND_MAGNITUDE as u64) as u8;
    (magnitude, direction)
}
