//! GATT UUIDs, message tags, and the byte-level wire codec for the eyeDrops
//! sensor (an RFduino board running the blink-detection firmware).
//!
//! # Frame layout
//!
//! Every message is one tag byte followed by a payload whose length is fixed
//! by the tag:
//!
//! ```text
//! byte 0     : tag
//! bytes 1..  : payload (0 bytes, a 4-byte little-endian f32, or
//!              a 1-byte length + that many bytes for Debug)
//! ```
//!
//! Host → device messages are [`OutgoingMessage`]; device → host messages are
//! [`IncomingMessage`]. The two directions share tag values but not meanings.
//!
//! # The 0x10 collision
//!
//! Outgoing tag `0x10` is both the first calibration parameter
//! ([`ParameterSlot::NegativeThreshold`]) and [`OutgoingMessage::RequestBatteryLevel`].
//! The firmware tells them apart by its own mode: while it is receiving a
//! profile the byte is a parameter, otherwise a battery request. Changing
//! either tag would break compatibility with deployed firmware, so the
//! ambiguity is kept and made explicit through [`TagContext`].

use uuid::Uuid;

use crate::error::DecodeError;
use crate::types::{ParameterSlot, PARAMETER_COUNT};

// ── Service ──────────────────────────────────────────────────────────────────

/// Primary GATT service advertised by the RFduino.
///
/// Used as the scan filter when looking for sensors.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00002220_0000_1000_8000_00805f9b34fb);

// ── Characteristics ───────────────────────────────────────────────────────────

/// Device → host notifications (blinks, calibration samples, battery, …).
pub const RECEIVE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002221_0000_1000_8000_00805f9b34fb);

/// Host → device writes (one [`OutgoingMessage`] per write).
pub const SEND_CHARACTERISTIC: Uuid = Uuid::from_u128(0x00002222_0000_1000_8000_00805f9b34fb);

/// Writing any value here asks the RFduino to drop the link.
pub const DISCONNECT_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002223_0000_1000_8000_00805f9b34fb);

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Host → device tag values.
pub mod out_tag {
    pub const NORMAL_MODE: u8 = 0x00;
    pub const START_CALIBRATION: u8 = 0x01;
    pub const STOP_CALIBRATION: u8 = 0x02;
    pub const SET_PARAMETERS: u8 = 0x03;
    /// First calibration parameter; slot `n` uses `CAL_PARAM_BASE + n`.
    pub const CAL_PARAM_BASE: u8 = 0x10;
    /// Same byte as `CAL_PARAM_BASE`; see the module docs.
    pub const REQUEST_BATTERY_LEVEL: u8 = 0x10;
    pub const START_DEBUG: u8 = 0x0E;
    pub const STOP_DEBUG: u8 = 0x0F;
    /// Acknowledges a device reset.
    pub const RESET: u8 = 0xFF;
}

/// Device → host tag values.
pub mod in_tag {
    pub const ALIVE: u8 = 0x00;
    pub const BLINK_DETECTED: u8 = 0x01;
    pub const CALIBRATION_DATA: u8 = 0x02;
    pub const PARAMETERS_ACK: u8 = 0x03;
    pub const BATTERY_LEVEL: u8 = 0x10;
    pub const DEBUG: u8 = 0x0F;
    pub const ERROR_EXCEPTION: u8 = 0xEE;
    pub const RESET_NOTICE: u8 = 0xFF;
}

/// Size of an `f32` payload on the wire.
const F32_LEN: usize = 4;

/// Wire tag of a calibration parameter slot.
pub fn parameter_tag(slot: ParameterSlot) -> u8 {
    out_tag::CAL_PARAM_BASE + slot.index() as u8
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Host → device message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutgoingMessage {
    /// Enter normal (blink detection) operation. Answered by `Alive`.
    NormalMode,
    StartCalibration,
    StopCalibration,
    /// Sent after the ten parameters; answered by `ParametersAck`.
    SetParameters,
    CalibrationParameter(ParameterSlot, f32),
    RequestBatteryLevel,
    StartDebug,
    StopDebug,
    /// Acknowledges [`IncomingMessage::ResetNotice`].
    Reset,
}

/// Device → host message.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Alive,
    BlinkDetected,
    CalibrationData(f32),
    ParametersAck,
    /// Charge in percent.
    BatteryLevel(f32),
    Debug(Vec<u8>),
    ErrorException,
    /// The device rebooted (also sent on every fresh connect) and has lost
    /// its parameters.
    ResetNotice,
}

/// How the receiver interprets an outgoing `0x10` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagContext {
    /// The device is receiving a profile: `0x10` is the first parameter.
    ProfileTransfer,
    /// Normal command handling: `0x10` requests the battery level.
    Command,
}

impl OutgoingMessage {
    /// The leading tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            OutgoingMessage::NormalMode => out_tag::NORMAL_MODE,
            OutgoingMessage::StartCalibration => out_tag::START_CALIBRATION,
            OutgoingMessage::StopCalibration => out_tag::STOP_CALIBRATION,
            OutgoingMessage::SetParameters => out_tag::SET_PARAMETERS,
            OutgoingMessage::CalibrationParameter(slot, _) => parameter_tag(*slot),
            OutgoingMessage::RequestBatteryLevel => out_tag::REQUEST_BATTERY_LEVEL,
            OutgoingMessage::StartDebug => out_tag::START_DEBUG,
            OutgoingMessage::StopDebug => out_tag::STOP_DEBUG,
            OutgoingMessage::Reset => out_tag::RESET,
        }
    }

    /// The context a receiver must be in to read this message back.
    pub fn context(&self) -> TagContext {
        match self {
            OutgoingMessage::CalibrationParameter(..) => TagContext::ProfileTransfer,
            _ => TagContext::Command,
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag());
        if let OutgoingMessage::CalibrationParameter(_, value) = self {
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Encode one outgoing message.
///
/// # Example
///
/// ```
/// # use eyedrops_rs::protocol::{encode, OutgoingMessage};
/// assert_eq!(encode(&OutgoingMessage::StartCalibration), vec![0x01]);
/// ```
pub fn encode(msg: &OutgoingMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + F32_LEN);
    msg.encode_into(&mut buf);
    buf
}

/// Total frame length (tag included) that `tag` needs given the bytes seen
/// so far, or `None` when the tag is unknown. Debug frames need their length
/// byte before the full size is known.
fn incoming_frame_len(tag: u8, buf: &[u8]) -> Option<usize> {
    let len = match tag {
        in_tag::ALIVE
        | in_tag::BLINK_DETECTED
        | in_tag::PARAMETERS_ACK
        | in_tag::ERROR_EXCEPTION
        | in_tag::RESET_NOTICE => 1,
        in_tag::CALIBRATION_DATA | in_tag::BATTERY_LEVEL => 1 + F32_LEN,
        in_tag::DEBUG => match buf.get(1) {
            Some(&n) => 2 + n as usize,
            None => 2,
        },
        _ => return None,
    };
    Some(len)
}

fn read_f32(frame: &[u8]) -> f32 {
    f32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]])
}

/// Decode one incoming message from the front of `cursor`.
///
/// On success the cursor is advanced past exactly the consumed bytes. On
/// error it is left untouched; what to skip is the framing layer's decision
/// (see [`crate::parse::FrameAccumulator`]).
pub fn decode(cursor: &mut &[u8]) -> Result<IncomingMessage, DecodeError> {
    let buf: &[u8] = *cursor;
    let &tag = buf.first().ok_or(DecodeError::Truncated {
        needed: 1,
        available: 0,
    })?;
    let needed = incoming_frame_len(tag, buf).ok_or(DecodeError::UnknownTag(tag))?;
    if buf.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    let frame = &buf[..needed];

    let msg = match tag {
        in_tag::ALIVE => IncomingMessage::Alive,
        in_tag::BLINK_DETECTED => IncomingMessage::BlinkDetected,
        in_tag::CALIBRATION_DATA => IncomingMessage::CalibrationData(read_f32(frame)),
        in_tag::PARAMETERS_ACK => IncomingMessage::ParametersAck,
        in_tag::BATTERY_LEVEL => IncomingMessage::BatteryLevel(read_f32(frame)),
        in_tag::DEBUG => IncomingMessage::Debug(frame[2..].to_vec()),
        in_tag::ERROR_EXCEPTION => IncomingMessage::ErrorException,
        in_tag::RESET_NOTICE => IncomingMessage::ResetNotice,
        _ => return Err(DecodeError::UnknownTag(tag)),
    };
    *cursor = &buf[needed..];
    Ok(msg)
}

impl IncomingMessage {
    /// Device-side encoder, used by the simulated sensor.
    ///
    /// Debug payloads longer than 255 bytes are cut to fit the length byte.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            IncomingMessage::Alive => vec![in_tag::ALIVE],
            IncomingMessage::BlinkDetected => vec![in_tag::BLINK_DETECTED],
            IncomingMessage::CalibrationData(v) => {
                let mut buf = vec![in_tag::CALIBRATION_DATA];
                buf.extend_from_slice(&v.to_le_bytes());
                buf
            }
            IncomingMessage::ParametersAck => vec![in_tag::PARAMETERS_ACK],
            IncomingMessage::BatteryLevel(v) => {
                let mut buf = vec![in_tag::BATTERY_LEVEL];
                buf.extend_from_slice(&v.to_le_bytes());
                buf
            }
            IncomingMessage::Debug(data) => {
                let len = data.len().min(u8::MAX as usize);
                let mut buf = Vec::with_capacity(2 + len);
                buf.push(in_tag::DEBUG);
                buf.push(len as u8);
                buf.extend_from_slice(&data[..len]);
                buf
            }
            IncomingMessage::ErrorException => vec![in_tag::ERROR_EXCEPTION],
            IncomingMessage::ResetNotice => vec![in_tag::RESET_NOTICE],
        }
    }
}

/// Device-side decoder for host → device frames.
///
/// `context` resolves the `0x10` collision. Cursor semantics match
/// [`decode`].
pub fn decode_outgoing(
    cursor: &mut &[u8],
    context: TagContext,
) -> Result<OutgoingMessage, DecodeError> {
    let buf: &[u8] = *cursor;
    let &tag = buf.first().ok_or(DecodeError::Truncated {
        needed: 1,
        available: 0,
    })?;

    let param_range = out_tag::CAL_PARAM_BASE..out_tag::CAL_PARAM_BASE + PARAMETER_COUNT as u8;
    let is_param = param_range.contains(&tag)
        && (tag != out_tag::REQUEST_BATTERY_LEVEL || context == TagContext::ProfileTransfer);

    let (msg, used) = if is_param {
        let needed = 1 + F32_LEN;
        if buf.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: buf.len(),
            });
        }
        let slot = ParameterSlot::from_index((tag - out_tag::CAL_PARAM_BASE) as usize)
            .ok_or(DecodeError::UnknownTag(tag))?;
        (
            OutgoingMessage::CalibrationParameter(slot, read_f32(&buf[..needed])),
            needed,
        )
    } else {
        let msg = match tag {
            out_tag::NORMAL_MODE => OutgoingMessage::NormalMode,
            out_tag::START_CALIBRATION => OutgoingMessage::StartCalibration,
            out_tag::STOP_CALIBRATION => OutgoingMessage::StopCalibration,
            out_tag::SET_PARAMETERS => OutgoingMessage::SetParameters,
            out_tag::REQUEST_BATTERY_LEVEL => OutgoingMessage::RequestBatteryLevel,
            out_tag::START_DEBUG => OutgoingMessage::StartDebug,
            out_tag::STOP_DEBUG => OutgoingMessage::StopDebug,
            out_tag::RESET => OutgoingMessage::Reset,
            _ => return Err(DecodeError::UnknownTag(tag)),
        };
        (msg, 1)
    };
    *cursor = &buf[used..];
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_outgoing() -> Vec<OutgoingMessage> {
        let mut msgs = vec![
            OutgoingMessage::NormalMode,
            OutgoingMessage::StartCalibration,
            OutgoingMessage::StopCalibration,
            OutgoingMessage::SetParameters,
            OutgoingMessage::RequestBatteryLevel,
            OutgoingMessage::StartDebug,
            OutgoingMessage::StopDebug,
            OutgoingMessage::Reset,
        ];
        for (i, slot) in ParameterSlot::ALL.iter().enumerate() {
            msgs.push(OutgoingMessage::CalibrationParameter(*slot, i as f32 * -1.25));
        }
        msgs
    }

    #[test]
    fn outgoing_tags_match_firmware_table() {
        assert_eq!(encode(&OutgoingMessage::NormalMode), [0x00]);
        assert_eq!(encode(&OutgoingMessage::SetParameters), [0x03]);
        assert_eq!(encode(&OutgoingMessage::StartDebug), [0x0E]);
        assert_eq!(encode(&OutgoingMessage::StopDebug), [0x0F]);
        assert_eq!(encode(&OutgoingMessage::Reset), [0xFF]);
        assert_eq!(parameter_tag(ParameterSlot::NegativeThreshold), 0x10);
        assert_eq!(parameter_tag(ParameterSlot::AllowedZeros), 0x19);

        let frame = encode(&OutgoingMessage::CalibrationParameter(
            ParameterSlot::Hysteresis,
            1.5,
        ));
        assert_eq!(frame[0], 0x12);
        assert_eq!(&frame[1..], &1.5f32.to_le_bytes());
    }

    #[test]
    fn outgoing_survives_decode_in_its_context() {
        for msg in all_outgoing() {
            let bytes = encode(&msg);
            let mut cursor = bytes.as_slice();
            let back = decode_outgoing(&mut cursor, msg.context()).unwrap();
            assert_eq!(back, msg);
            assert!(cursor.is_empty(), "{msg:?} left bytes behind");
        }
    }

    /// Tag 0x10 is shared by the battery request and the first parameter;
    /// only the receiver's context tells them apart.
    #[test]
    fn tag_0x10_is_resolved_by_context() {
        assert_eq!(
            encode(&OutgoingMessage::RequestBatteryLevel)[0],
            parameter_tag(ParameterSlot::NegativeThreshold)
        );

        let param = encode(&OutgoingMessage::CalibrationParameter(
            ParameterSlot::NegativeThreshold,
            -3.0,
        ));
        let mut cursor = param.as_slice();
        assert_eq!(
            decode_outgoing(&mut cursor, TagContext::Command).unwrap(),
            OutgoingMessage::RequestBatteryLevel
        );
        // The float payload is now misread as further frames.
        assert_eq!(cursor.len(), 4);

        let mut cursor: &[u8] = &[0x10];
        assert_eq!(
            decode_outgoing(&mut cursor, TagContext::ProfileTransfer),
            Err(DecodeError::Truncated {
                needed: 5,
                available: 1
            })
        );
    }

    #[test]
    fn incoming_decodes_each_kind() {
        let cases = vec![
            IncomingMessage::Alive,
            IncomingMessage::BlinkDetected,
            IncomingMessage::CalibrationData(512.25),
            IncomingMessage::ParametersAck,
            IncomingMessage::BatteryLevel(87.5),
            IncomingMessage::Debug(vec![1, 2, 3]),
            IncomingMessage::ErrorException,
            IncomingMessage::ResetNotice,
        ];
        for msg in cases {
            let bytes = msg.encode();
            let mut cursor = bytes.as_slice();
            assert_eq!(decode(&mut cursor).unwrap(), msg);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn incoming_tags_match_firmware_table() {
        assert_eq!(IncomingMessage::BatteryLevel(0.0).encode()[0], 0x10);
        assert_eq!(IncomingMessage::ErrorException.encode(), [0xEE]);
        assert_eq!(IncomingMessage::Debug(vec![9]).encode(), [0x0F, 1, 9]);
    }

    #[test]
    fn short_buffers_are_truncated_not_panics() {
        for tag in [in_tag::CALIBRATION_DATA, in_tag::BATTERY_LEVEL] {
            for len in 1..5 {
                let mut bytes = vec![tag];
                bytes.resize(len, 0xAB);
                let mut cursor = bytes.as_slice();
                assert_eq!(
                    decode(&mut cursor),
                    Err(DecodeError::Truncated {
                        needed: 5,
                        available: len
                    })
                );
                assert_eq!(cursor.len(), len, "cursor must not move on error");
            }
        }

        let mut cursor: &[u8] = &[in_tag::DEBUG];
        assert!(matches!(decode(&mut cursor), Err(DecodeError::Truncated { .. })));
        let mut cursor: &[u8] = &[in_tag::DEBUG, 4, 1, 2];
        assert_eq!(
            decode(&mut cursor),
            Err(DecodeError::Truncated {
                needed: 6,
                available: 4
            })
        );

        let mut empty: &[u8] = &[];
        assert_eq!(
            decode(&mut empty),
            Err(DecodeError::Truncated {
                needed: 1,
                available: 0
            })
        );
    }

    #[test]
    fn unknown_tag_is_reported() {
        let mut cursor: &[u8] = &[0x42, 0x01];
        assert_eq!(decode(&mut cursor), Err(DecodeError::UnknownTag(0x42)));
        assert_eq!(cursor.len(), 2);
    }

    #[test]
    fn cursor_walks_over_back_to_back_frames() {
        let mut bytes = IncomingMessage::BlinkDetected.encode();
        bytes.extend(IncomingMessage::CalibrationData(-2.0).encode());
        bytes.extend(IncomingMessage::ParametersAck.encode());

        let mut cursor = bytes.as_slice();
        assert_eq!(decode(&mut cursor).unwrap(), IncomingMessage::BlinkDetected);
        assert_eq!(
            decode(&mut cursor).unwrap(),
            IncomingMessage::CalibrationData(-2.0)
        );
        assert_eq!(decode(&mut cursor).unwrap(), IncomingMessage::ParametersAck);
        assert!(cursor.is_empty());
    }

    #[test]
    fn long_debug_payload_is_capped() {
        let bytes = IncomingMessage::Debug(vec![7; 300]).encode();
        assert_eq!(bytes.len(), 2 + 255);
        assert_eq!(bytes[1], 255);
    }
}
