//! Binary command/telemetry codec for the device wire protocol.
//!
//! Outbound frames:
//! ```text
//! motor: [ 0x08 ][ 0x00 ][ 0x81 ][ port ][ 0x11 ][ 0x51 ][ 0x00 ][ signed_power ]
//! light: [ 0x05 ][ 0x06 ][ 0x04 ][ 0x01 ][ color_index ]
//! ```
//! Inbound notification frames carry a leading type byte that selects the
//! telemetry field; the value lives in the third byte. The vendor format was
//! never conclusively confirmed, so this one canonical layout must be
//! validated against real hardware before being treated as ground truth.
//!
//! Pure functions only: no I/O, no state.

use bytes::Bytes;
use thiserror::Error;

/// Motor opcode byte in outbound frames.
const MOTOR_OPCODE: u8 = 0x81;
/// Light command class byte.
const LIGHT_CLASS: u8 = 0x06;
/// Port the RGB light sits on.
const LIGHT_PORT: u8 = 0x04;

/// A motor output port on the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MotorPort {
    A,
    B,
}

impl MotorPort {
    /// Wire identifier for this port.
    pub fn index(self) -> u8 {
        match self {
            MotorPort::A => 0x00,
            MotorPort::B => 0x01,
        }
    }
}

/// The fixed symbolic color set supported by the hub light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightColor {
    #[default]
    Off,
    White,
    Red,
    Green,
    Blue,
    Yellow,
    Purple,
    Cyan,
}

impl LightColor {
    /// Wire index for this color.
    pub fn index(self) -> u8 {
        match self {
            LightColor::Off => 0x00,
            LightColor::White => 0x01,
            LightColor::Red => 0x02,
            LightColor::Green => 0x03,
            LightColor::Blue => 0x04,
            LightColor::Yellow => 0x05,
            LightColor::Purple => 0x06,
            LightColor::Cyan => 0x07,
        }
    }
}

/// Tilt reading reported by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TiltDirection {
    #[default]
    None,
    Forward,
    Backward,
    Left,
    Right,
}

/// What a command frame does, kept alongside the raw bytes for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Motor { port: MotorPort, power: i32 },
    Light { color: LightColor },
}

/// An immutable binary payload representing one actuator directive.
///
/// Only constructed through [`CommandFrame::motor`] and
/// [`CommandFrame::light`], so every frame on the wire comes from validated
/// (clamped) parameters.
#[derive(Debug, Clone)]
pub struct CommandFrame {
    bytes: Bytes,
    kind: FrameKind,
}

impl CommandFrame {
    /// Build a set-motor-power frame. `power` is clamped to `[-100, 100]`
    /// and scaled to the signed seven-bit wire range.
    pub fn motor(port: MotorPort, power: i32) -> Self {
        let clamped = power.clamp(-100, 100);
        let signed = (f64::from(clamped) * 127.0 / 100.0).round() as i8;
        let bytes = Bytes::from(vec![
            0x08,
            0x00,
            MOTOR_OPCODE,
            port.index(),
            0x11,
            0x51,
            0x00,
            signed as u8,
        ]);
        Self {
            bytes,
            kind: FrameKind::Motor {
                port,
                power: clamped,
            },
        }
    }

    /// Build a set-light-color frame.
    pub fn light(color: LightColor) -> Self {
        let bytes = Bytes::from(vec![0x05, LIGHT_CLASS, LIGHT_PORT, 0x01, color.index()]);
        Self {
            bytes,
            kind: FrameKind::Light { color },
        }
    }

    /// Raw frame bytes as written to the output channel.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cheap handle to the frame bytes.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }
}

/// One decoded field update from a notification frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryUpdate {
    Motion(i32),
    Tilt(TiltDirection),
    LightLevel(u8),
    Battery(u8),
    Button(bool),
}

/// Errors from decoding inbound notification frames.
///
/// These never reach callers of the core: the notification router logs them
/// and drops the frame.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("notification frame too short: {0} bytes")]
    Truncated(usize),

    #[error("unknown notification type byte {0:#04x}")]
    UnknownType(u8),
}

/// Decode a notification frame into a telemetry field update.
///
/// Layout: `[ type ][ channel ][ value ]`. Frames shorter than 3 bytes or
/// with an unrecognized type byte are rejected; the caller drops them.
pub fn decode_notification(frame: &[u8]) -> Result<TelemetryUpdate, CodecError> {
    if frame.len() < 3 {
        return Err(CodecError::Truncated(frame.len()));
    }
    let value = frame[2];
    match frame[0] {
        0x01 => Ok(TelemetryUpdate::Motion(i32::from(value as i8))),
        0x02 => Ok(TelemetryUpdate::Tilt(decode_tilt(value))),
        0x03 => Ok(TelemetryUpdate::LightLevel(value.min(100))),
        0x04 => Ok(TelemetryUpdate::Battery(value.min(100))),
        0x05 => Ok(TelemetryUpdate::Button(value != 0)),
        other => Err(CodecError::UnknownType(other)),
    }
}

fn decode_tilt(value: u8) -> TiltDirection {
    match value {
        0x01 => TiltDirection::Forward,
        0x02 => TiltDirection::Backward,
        0x03 => TiltDirection::Left,
        0x04 => TiltDirection::Right,
        // 0x00 and anything the hub reports outside the known set
        _ => TiltDirection::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motor_frame_layout() {
        let frame = CommandFrame::motor(MotorPort::A, 80);
        // 80% of 127 = 101.6, rounds to 102
        assert_eq!(
            frame.as_bytes(),
            &[0x08, 0x00, 0x81, 0x00, 0x11, 0x51, 0x00, 102]
        );

        let frame = CommandFrame::motor(MotorPort::B, -100);
        assert_eq!(frame.as_bytes()[3], 0x01);
        assert_eq!(frame.as_bytes()[7], (-127i8) as u8);
    }

    #[test]
    fn motor_power_is_clamped_not_rejected() {
        let over = CommandFrame::motor(MotorPort::A, 250);
        let full = CommandFrame::motor(MotorPort::A, 100);
        assert_eq!(over.as_bytes(), full.as_bytes());

        let under = CommandFrame::motor(MotorPort::B, -999);
        let reverse = CommandFrame::motor(MotorPort::B, -100);
        assert_eq!(under.as_bytes(), reverse.as_bytes());

        assert_eq!(
            over.kind(),
            FrameKind::Motor {
                port: MotorPort::A,
                power: 100
            }
        );
    }

    #[test]
    fn zero_power_encodes_to_zero_byte() {
        let frame = CommandFrame::motor(MotorPort::A, 0);
        assert_eq!(frame.as_bytes()[7], 0x00);
    }

    #[test]
    fn light_frame_layout() {
        let frame = CommandFrame::light(LightColor::Green);
        assert_eq!(frame.as_bytes(), &[0x05, 0x06, 0x04, 0x01, 0x03]);

        let off = CommandFrame::light(LightColor::Off);
        assert_eq!(off.as_bytes()[4], 0x00);
    }

    #[test]
    fn decode_motion_is_signed() {
        let update = decode_notification(&[0x01, 0x00, 0xFF]).unwrap();
        assert_eq!(update, TelemetryUpdate::Motion(-1));

        let update = decode_notification(&[0x01, 0x00, 0x20]).unwrap();
        assert_eq!(update, TelemetryUpdate::Motion(32));
    }

    #[test]
    fn decode_tilt_directions() {
        for (byte, expected) in [
            (0x00, TiltDirection::None),
            (0x01, TiltDirection::Forward),
            (0x02, TiltDirection::Backward),
            (0x03, TiltDirection::Left),
            (0x04, TiltDirection::Right),
            (0x7F, TiltDirection::None),
        ] {
            let update = decode_notification(&[0x02, 0x00, byte]).unwrap();
            assert_eq!(update, TelemetryUpdate::Tilt(expected));
        }
    }

    #[test]
    fn decode_percent_fields_clamp_to_100() {
        assert_eq!(
            decode_notification(&[0x03, 0x00, 0xC8]).unwrap(),
            TelemetryUpdate::LightLevel(100)
        );
        assert_eq!(
            decode_notification(&[0x04, 0x00, 0x37]).unwrap(),
            TelemetryUpdate::Battery(0x37)
        );
    }

    #[test]
    fn decode_button() {
        assert_eq!(
            decode_notification(&[0x05, 0x00, 0x01]).unwrap(),
            TelemetryUpdate::Button(true)
        );
        assert_eq!(
            decode_notification(&[0x05, 0x00, 0x00]).unwrap(),
            TelemetryUpdate::Button(false)
        );
    }

    #[test]
    fn truncated_and_unknown_frames_are_rejected() {
        assert!(matches!(
            decode_notification(&[0x01, 0x00]),
            Err(CodecError::Truncated(2))
        ));
        assert!(matches!(
            decode_notification(&[]),
            Err(CodecError::Truncated(0))
        ));
        assert!(matches!(
            decode_notification(&[0x09, 0x00, 0x01]),
            Err(CodecError::UnknownType(0x09))
        ));
    }
}
