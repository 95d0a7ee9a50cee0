// Motor control module for RobStride actuators behind a USB-CAN adapter
//
// Provides:
// - AT-framed CAN protocol encoding/decoding
// - Per-device lifecycle state and its transition rules
// - A bus channel serializing exchanges on one serial link
// - The controller API tying them together

mod bus;
mod controller;
mod error;
pub mod protocol;
pub mod state;

pub use bus::BusChannel;
pub use controller::{Controller, Session, ShutdownReport};
pub use error::{MotorError, Result};
pub use protocol::{DecodeError, MotorFeedback, MotorStatus, ParameterIndex};
pub use state::{
    CspLimits, Device, DeviceLimits, DeviceState, Limits, Mode, PpLimits, Rejection,
    SetpointKind, VelocityLimits,
};
