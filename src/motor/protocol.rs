// RobStride AT-framed CAN protocol
//
// The USB-CAN adapter wraps every extended CAN frame as a fixed 17-byte record:
// ["AT", id (4 bytes BE, (can_id << 3) | 0b100), DLC = 8, data (8 bytes), "\r\n"]
//
// This module is the only place where setpoints are converted to and from
// their wire representation.

use std::f32::consts::PI;

/// Length of every frame on the wire, request or reply
pub const FRAME_LEN: usize = 17;

const HEADER: [u8; 2] = *b"AT";
const TAIL: [u8; 2] = *b"\r\n";
const DLC: u8 = 0x08;
const EXTENDED_MARKER: u32 = 0b100;

/// Host id reported in the low byte of a device-id reply
const DEVICE_ID_REPLY_HOST: u8 = 0xFE;

// Feedback scaling ranges (RS-series defaults)
const POSITION_RANGE: f32 = 4.0 * PI; // rad
const VELOCITY_RANGE: f32 = 44.0; // rad/s
const TORQUE_RANGE: f32 = 17.0; // N*m

/// Communication type, bits 28..24 of the 29-bit CAN id
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommType {
    GetDeviceId = 0x00,
    Feedback = 0x02,
    Enable = 0x03,
    Disable = 0x04,
    ReadParam = 0x11,
    WriteParam = 0x12,
}

impl CommType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::GetDeviceId),
            0x02 => Some(Self::Feedback),
            0x03 => Some(Self::Enable),
            0x04 => Some(Self::Disable),
            0x11 => Some(Self::ReadParam),
            0x12 => Some(Self::WriteParam),
            _ => None,
        }
    }

    /// Type of the frame a motor answers a request of this type with
    pub fn reply_type(self) -> Self {
        match self {
            Self::GetDeviceId => Self::GetDeviceId,
            Self::ReadParam => Self::ReadParam,
            _ => Self::Feedback,
        }
    }
}

/// Parameter table indices
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterIndex {
    RunMode = 0x7005,
    IqRef = 0x7006,  // current setpoint (A)
    SpdRef = 0x700A, // velocity setpoint (rad/s)
    LocRef = 0x7016, // position setpoint (rad)
    LimitSpd = 0x7017,
    LimitCur = 0x7018,
    AccRad = 0x7022,
    VelMax = 0x7024,
    AccSet = 0x7025,
}

impl ParameterIndex {
    pub const ALL: [ParameterIndex; 9] = [
        Self::RunMode,
        Self::IqRef,
        Self::SpdRef,
        Self::LocRef,
        Self::LimitSpd,
        Self::LimitCur,
        Self::AccRad,
        Self::VelMax,
        Self::AccSet,
    ];

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|index| *index as u16 == value)
    }

    /// Setpoint registers are written cyclically and never acknowledged
    pub fn is_setpoint(self) -> bool {
        matches!(self, Self::IqRef | Self::SpdRef | Self::LocRef)
    }
}

/// Run mode as stored in the `RunMode` parameter
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Operation = 0,
    ProfilePosition = 1,
    Velocity = 2,
    Current = 3,
    Csp = 5,
}

impl RunMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Operation),
            1 => Some(Self::ProfilePosition),
            2 => Some(Self::Velocity),
            3 => Some(Self::Current),
            5 => Some(Self::Csp),
            _ => None,
        }
    }
}

/// Motor status, bits 23..22 of a feedback reply id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorStatus {
    Reset,
    Calibration,
    Run,
    Unknown(u8),
}

impl MotorStatus {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Reset,
            1 => Self::Calibration,
            2 => Self::Run,
            other => Self::Unknown(other),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Reset => 0,
            Self::Calibration => 1,
            Self::Run => 2,
            Self::Unknown(bits) => bits & 0b11,
        }
    }
}

/// Value carried by a parameter write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Mode(RunMode),
    Float(f32),
}

/// A command addressed to one motor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorCommand {
    GetDeviceId,
    Enable,
    Disable,
    ReadParam(ParameterIndex),
    WriteParam(ParameterIndex, ParamValue),
}

impl MotorCommand {
    pub fn comm_type(&self) -> CommType {
        match self {
            Self::GetDeviceId => CommType::GetDeviceId,
            Self::Enable => CommType::Enable,
            Self::Disable => CommType::Disable,
            Self::ReadParam(_) => CommType::ReadParam,
            Self::WriteParam(..) => CommType::WriteParam,
        }
    }

    /// Acknowledgment policy: everything except setpoint writes waits for a reply
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::WriteParam(index, _) if index.is_setpoint())
    }

    fn payload(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        match *self {
            Self::GetDeviceId | Self::Enable | Self::Disable => {}
            Self::ReadParam(index) => {
                data[0..2].copy_from_slice(&(index as u16).to_le_bytes());
            }
            Self::WriteParam(index, value) => {
                data[0..2].copy_from_slice(&(index as u16).to_le_bytes());
                let raw = match value {
                    ParamValue::Mode(mode) => (mode as u32).to_le_bytes(),
                    ParamValue::Float(v) => v.to_le_bytes(),
                };
                data[4..8].copy_from_slice(&raw);
            }
        }
        data
    }
}

/// Decoded status feedback (comm type 2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorFeedback {
    pub status: MotorStatus,
    pub faults: u8,
    /// rad
    pub position: f32,
    /// rad/s
    pub velocity: f32,
    /// N*m
    pub torque: f32,
    /// degrees Celsius
    pub temperature: f32,
}

/// A decoded reply
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotorResponse {
    DeviceId { mcu_uid: u64 },
    Feedback(MotorFeedback),
    Parameter { index: u16, value: [u8; 4] },
}

impl MotorResponse {
    /// Parameter value interpreted as `f32`
    pub fn param_f32(&self) -> Option<f32> {
        match self {
            Self::Parameter { value, .. } => Some(f32::from_le_bytes(*value)),
            _ => None,
        }
    }

    /// Parameter value interpreted as a run mode byte
    pub fn param_u8(&self) -> Option<u8> {
        match self {
            Self::Parameter { value, .. } => Some(value[0]),
            _ => None,
        }
    }
}

/// Error types for frame decoding
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("Reply came from motor {actual}, expected motor {expected}")]
    UnexpectedDeviceId { expected: u8, actual: u8 },
}

fn malformed(reason: impl Into<String>) -> DecodeError {
    DecodeError::MalformedFrame {
        reason: reason.into(),
    }
}

/// One encoded frame, ready to be written to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    /// Build a frame from a 29-bit CAN id and 8 data bytes
    pub fn from_parts(can_id: u32, data: [u8; 8]) -> Self {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0..2].copy_from_slice(&HEADER);
        let encoded_id = ((can_id & 0x1FFF_FFFF) << 3) | EXTENDED_MARKER;
        bytes[2..6].copy_from_slice(&encoded_id.to_be_bytes());
        bytes[6] = DLC;
        bytes[7..15].copy_from_slice(&data);
        bytes[15..17].copy_from_slice(&TAIL);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn can_id(&self) -> u32 {
        u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]]) >> 3
    }

    /// Motor id a request frame is addressed to
    pub fn device_id(&self) -> u8 {
        (self.can_id() & 0xFF) as u8
    }

    pub fn comm_type(&self) -> Option<CommType> {
        CommType::from_u8(((self.can_id() >> 24) & 0x1F) as u8)
    }

    pub fn data(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data.copy_from_slice(&self.0[7..15]);
        data
    }
}

/// Validated frame envelope: 29-bit id and payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub can_id: u32,
    pub data: [u8; 8],
}

impl RawFrame {
    /// Check the envelope of a 17-byte record
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != FRAME_LEN {
            return Err(malformed(format!(
                "expected {} bytes, got {}",
                FRAME_LEN,
                bytes.len()
            )));
        }
        if bytes[0..2] != HEADER {
            return Err(malformed(format!("invalid header: {:02X?}", &bytes[0..2])));
        }
        if bytes[15..17] != TAIL {
            return Err(malformed(format!("invalid tail: {:02X?}", &bytes[15..17])));
        }
        if bytes[6] != DLC {
            return Err(malformed(format!("invalid data length code: {}", bytes[6])));
        }
        let encoded_id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        if encoded_id & 0b111 != EXTENDED_MARKER {
            return Err(malformed(format!(
                "missing extended-frame marker in id 0x{:08X}",
                encoded_id
            )));
        }

        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[7..15]);
        Ok(Self {
            can_id: encoded_id >> 3,
            data,
        })
    }

    pub fn comm_type(&self) -> u8 {
        ((self.can_id >> 24) & 0x1F) as u8
    }

    /// Motor id a reply frame was sent by
    pub fn source_id(&self) -> u8 {
        ((self.can_id >> 8) & 0xFF) as u8
    }
}

/// Encode a command for `device_id`, sent from `host_id`
pub fn encode(host_id: u8, device_id: u8, command: &MotorCommand) -> Frame {
    let can_id =
        ((command.comm_type() as u32) << 24) | ((host_id as u32) << 8) | device_id as u32;
    Frame::from_parts(can_id, command.payload())
}

/// Decode a request frame back into (host id, device id, command)
pub fn decode_request(bytes: &[u8]) -> Result<(u8, u8, MotorCommand), DecodeError> {
    let raw = RawFrame::parse(bytes)?;
    let host_id = ((raw.can_id >> 8) & 0xFF) as u8;
    let device_id = (raw.can_id & 0xFF) as u8;

    let command = match CommType::from_u8(raw.comm_type()) {
        Some(CommType::GetDeviceId) => MotorCommand::GetDeviceId,
        Some(CommType::Enable) => MotorCommand::Enable,
        Some(CommType::Disable) => MotorCommand::Disable,
        Some(CommType::ReadParam) => MotorCommand::ReadParam(parameter_index(&raw.data)?),
        Some(CommType::WriteParam) => {
            let index = parameter_index(&raw.data)?;
            let value = [raw.data[4], raw.data[5], raw.data[6], raw.data[7]];
            let value = if index == ParameterIndex::RunMode {
                let mode = u32::from_le_bytes(value);
                let mode = u8::try_from(mode)
                    .ok()
                    .and_then(RunMode::from_u8)
                    .ok_or_else(|| malformed(format!("unknown run mode {}", mode)))?;
                ParamValue::Mode(mode)
            } else {
                ParamValue::Float(f32::from_le_bytes(value))
            };
            MotorCommand::WriteParam(index, value)
        }
        Some(CommType::Feedback) | None => {
            return Err(malformed(format!(
                "unexpected request type 0x{:02X}",
                raw.comm_type()
            )));
        }
    };

    Ok((host_id, device_id, command))
}

fn parameter_index(data: &[u8; 8]) -> Result<ParameterIndex, DecodeError> {
    let index = u16::from_le_bytes([data[0], data[1]]);
    ParameterIndex::from_u16(index)
        .ok_or_else(|| malformed(format!("unknown parameter index 0x{:04X}", index)))
}

/// Decode a reply that should come from `expected_id`
pub fn decode(bytes: &[u8], expected_id: u8) -> Result<MotorResponse, DecodeError> {
    let raw = RawFrame::parse(bytes)?;

    let actual = raw.source_id();
    if actual != expected_id {
        return Err(DecodeError::UnexpectedDeviceId {
            expected: expected_id,
            actual,
        });
    }

    match CommType::from_u8(raw.comm_type()) {
        Some(CommType::GetDeviceId) => Ok(MotorResponse::DeviceId {
            mcu_uid: u64::from_be_bytes(raw.data),
        }),
        Some(CommType::Feedback) => {
            let field = |i: usize| u16::from_be_bytes([raw.data[i], raw.data[i + 1]]);
            Ok(MotorResponse::Feedback(MotorFeedback {
                status: MotorStatus::from_bits((raw.can_id >> 22) as u8),
                faults: ((raw.can_id >> 16) & 0x3F) as u8,
                position: uint_to_float(field(0), POSITION_RANGE),
                velocity: uint_to_float(field(2), VELOCITY_RANGE),
                torque: uint_to_float(field(4), TORQUE_RANGE),
                temperature: field(6) as f32 / 10.0,
            }))
        }
        Some(CommType::ReadParam) => Ok(MotorResponse::Parameter {
            index: u16::from_le_bytes([raw.data[0], raw.data[1]]),
            value: [raw.data[4], raw.data[5], raw.data[6], raw.data[7]],
        }),
        _ => Err(malformed(format!(
            "unexpected reply type 0x{:02X}",
            raw.comm_type()
        ))),
    }
}

/// Encode a reply as sent by `device_id` to `host_id`
pub fn encode_response(host_id: u8, device_id: u8, response: &MotorResponse) -> Frame {
    let base = ((device_id as u32) << 8) | host_id as u32;
    match *response {
        MotorResponse::DeviceId { mcu_uid } => {
            let can_id = ((device_id as u32) << 8) | DEVICE_ID_REPLY_HOST as u32;
            Frame::from_parts(can_id, mcu_uid.to_be_bytes())
        }
        MotorResponse::Feedback(feedback) => {
            let can_id = ((CommType::Feedback as u32) << 24)
                | ((feedback.status.bits() as u32) << 22)
                | (((feedback.faults & 0x3F) as u32) << 16)
                | base;
            let mut data = [0u8; 8];
            data[0..2].copy_from_slice(&float_to_uint(feedback.position, POSITION_RANGE).to_be_bytes());
            data[2..4].copy_from_slice(&float_to_uint(feedback.velocity, VELOCITY_RANGE).to_be_bytes());
            data[4..6].copy_from_slice(&float_to_uint(feedback.torque, TORQUE_RANGE).to_be_bytes());
            let temperature = (feedback.temperature * 10.0).round().clamp(0.0, u16::MAX as f32) as u16;
            data[6..8].copy_from_slice(&temperature.to_be_bytes());
            Frame::from_parts(can_id, data)
        }
        MotorResponse::Parameter { index, value } => {
            let can_id = ((CommType::ReadParam as u32) << 24) | base;
            let mut data = [0u8; 8];
            data[0..2].copy_from_slice(&index.to_le_bytes());
            data[4..8].copy_from_slice(&value);
            Frame::from_parts(can_id, data)
        }
    }
}

/// Map a value in [-range, range] onto the full u16 span
fn float_to_uint(value: f32, range: f32) -> u16 {
    let span = 2.0 * range;
    let clamped = value.clamp(-range, range);
    (((clamped + range) / span) * u16::MAX as f32).round() as u16
}

fn uint_to_float(raw: u16, range: f32) -> f32 {
    raw as f32 / u16::MAX as f32 * 2.0 * range - range
}
