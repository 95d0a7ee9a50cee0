// Per-device configuration and lifecycle state
//
// Lifecycle: Uninitialized -> (set_mode) -> mode configured -> (enable) -> enabled
// All transitions go through `transition`, a pure function checked before any
// bytes reach the bus.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::protocol::RunMode;

/// Control law active on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Uninitialized,
    Csp,
    ProfilePosition,
    Velocity,
    Current,
}

impl Mode {
    /// Wire value for a configurable mode
    pub fn run_mode(self) -> Option<RunMode> {
        match self {
            Self::Uninitialized => None,
            Self::Csp => Some(RunMode::Csp),
            Self::ProfilePosition => Some(RunMode::ProfilePosition),
            Self::Velocity => Some(RunMode::Velocity),
            Self::Current => Some(RunMode::Current),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Csp => "CSP",
            Self::ProfilePosition => "profile position",
            Self::Velocity => "velocity",
            Self::Current => "current",
        };
        f.write_str(name)
    }
}

/// CSP mode limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CspLimits {
    /// rad/s
    pub speed_limit: f32,
    /// A
    pub current_limit: f32,
}

/// Profile position mode limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PpLimits {
    /// rad/s
    pub vel_max: f32,
    /// rad/s^2
    pub acc: f32,
    /// A
    pub current_limit: f32,
}

/// Velocity mode limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityLimits {
    /// A
    pub current_limit: f32,
    /// rad/s^2
    pub accel: f32,
}

/// A limit set, meaningful only under its matching mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Limits {
    Csp(CspLimits),
    ProfilePosition(PpLimits),
    Velocity(VelocityLimits),
}

impl Limits {
    pub fn mode(&self) -> Mode {
        match self {
            Self::Csp(_) => Mode::Csp,
            Self::ProfilePosition(_) => Mode::ProfilePosition,
            Self::Velocity(_) => Mode::Velocity,
        }
    }
}

/// Limits configured for a device, one optional set per mode
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceLimits {
    #[serde(default)]
    pub csp: Option<CspLimits>,
    #[serde(default)]
    pub pp: Option<PpLimits>,
    #[serde(default)]
    pub velocity: Option<VelocityLimits>,
}

impl DeviceLimits {
    pub fn for_mode(&self, mode: Mode) -> Option<Limits> {
        match mode {
            Mode::Csp => self.csp.map(Limits::Csp),
            Mode::ProfilePosition => self.pp.map(Limits::ProfilePosition),
            Mode::Velocity => self.velocity.map(Limits::Velocity),
            Mode::Uninitialized | Mode::Current => None,
        }
    }
}

/// Identity and static configuration of one motor on a bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: u8,
    /// Position reference correction (rad), added to every position target
    #[serde(default)]
    pub offset: f32,
    #[serde(default)]
    pub limits: DeviceLimits,
}

impl Device {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            offset: 0.0,
            limits: DeviceLimits::default(),
        }
    }

    pub fn with_offset(mut self, offset: f32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Kind of setpoint carried by a target command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointKind {
    Position,
    Velocity,
    Current,
}

impl SetpointKind {
    fn accepts(self, mode: Mode) -> bool {
        match self {
            Self::Position => matches!(mode, Mode::Csp | Mode::ProfilePosition),
            Self::Velocity => mode == Mode::Velocity,
            Self::Current => mode == Mode::Current,
        }
    }
}

impl fmt::Display for SetpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Position => "position",
            Self::Velocity => "velocity",
            Self::Current => "current",
        };
        f.write_str(name)
    }
}

/// State-changing operations, as seen by the transition table
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Enable,
    Disable,
    SetMode(Mode),
    ApplyLimits(Limits),
    SetTarget(SetpointKind),
}

/// Why a transition was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("no control mode configured")]
    ModeUninitialized,

    #[error("cannot change mode while enabled")]
    ModeChangeWhileEnabled,

    #[error("cannot switch to the uninitialized mode")]
    UninitializedTarget,

    #[error("{limits} limits do not apply in {current} mode")]
    LimitsModeMismatch { limits: Mode, current: Mode },

    #[error("motor is not enabled")]
    NotEnabled,

    #[error("{setpoint} target is not valid in {current} mode")]
    SetpointModeMismatch { setpoint: SetpointKind, current: Mode },
}

/// Mutable runtime state of one device, owned by its controller
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceState {
    pub mode: Mode,
    pub enabled: bool,
    pub applied_limits: Option<Limits>,
}

impl DeviceState {
    /// Check a transition and return the state it would produce
    pub fn transition(&self, op: Transition) -> Result<DeviceState, Rejection> {
        let mut next = *self;
        match op {
            Transition::Enable => {
                if self.mode == Mode::Uninitialized {
                    return Err(Rejection::ModeUninitialized);
                }
                next.enabled = true;
            }
            Transition::Disable => {
                next.enabled = false;
            }
            Transition::SetMode(mode) => {
                if self.enabled {
                    return Err(Rejection::ModeChangeWhileEnabled);
                }
                if mode == Mode::Uninitialized {
                    return Err(Rejection::UninitializedTarget);
                }
                next.mode = mode;
                next.applied_limits = None;
            }
            Transition::ApplyLimits(limits) => {
                if limits.mode() != self.mode {
                    return Err(Rejection::LimitsModeMismatch {
                        limits: limits.mode(),
                        current: self.mode,
                    });
                }
                next.applied_limits = Some(limits);
            }
            Transition::SetTarget(setpoint) => {
                if !self.enabled {
                    return Err(Rejection::NotEnabled);
                }
                if !setpoint.accepts(self.mode) {
                    return Err(Rejection::SetpointModeMismatch {
                        setpoint,
                        current: self.mode,
                    });
                }
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csp_limits() -> Limits {
        Limits::Csp(CspLimits {
            speed_limit: 1.0,
            current_limit: 5.0,
        })
    }

    fn configured(mode: Mode) -> DeviceState {
        DeviceState::default()
            .transition(Transition::SetMode(mode))
            .unwrap()
    }

    #[test]
    fn test_enable_requires_mode() {
        assert_eq!(
            DeviceState::default().transition(Transition::Enable),
            Err(Rejection::ModeUninitialized)
        );
        let enabled = configured(Mode::Current)
            .transition(Transition::Enable)
            .unwrap();
        assert!(enabled.enabled);
    }

    #[test]
    fn test_mode_change_while_enabled() {
        let enabled = configured(Mode::Csp).transition(Transition::Enable).unwrap();
        assert_eq!(
            enabled.transition(Transition::SetMode(Mode::Velocity)),
            Err(Rejection::ModeChangeWhileEnabled)
        );
    }

    #[test]
    fn test_set_mode_clears_limits() {
        let limited = configured(Mode::Csp)
            .transition(Transition::ApplyLimits(csp_limits()))
            .unwrap();
        assert_eq!(limited.applied_limits, Some(csp_limits()));

        let switched = limited
            .transition(Transition::SetMode(Mode::Velocity))
            .unwrap();
        assert_eq!(switched.mode, Mode::Velocity);
        assert_eq!(switched.applied_limits, None);
    }

    #[test]
    fn test_limits_need_matching_mode() {
        let pp = Limits::ProfilePosition(PpLimits {
            vel_max: 2.0,
            acc: 4.0,
            current_limit: 3.0,
        });
        assert_eq!(
            configured(Mode::Csp).transition(Transition::ApplyLimits(pp)),
            Err(Rejection::LimitsModeMismatch {
                limits: Mode::ProfilePosition,
                current: Mode::Csp
            })
        );
        assert!(
            configured(Mode::ProfilePosition)
                .transition(Transition::ApplyLimits(pp))
                .is_ok()
        );
    }

    #[test]
    fn test_setpoint_mode_matching() {
        let csp = configured(Mode::Csp).transition(Transition::Enable).unwrap();
        assert!(csp.transition(Transition::SetTarget(SetpointKind::Position)).is_ok());
        assert_eq!(
            csp.transition(Transition::SetTarget(SetpointKind::Velocity)),
            Err(Rejection::SetpointModeMismatch {
                setpoint: SetpointKind::Velocity,
                current: Mode::Csp
            })
        );

        let pp = configured(Mode::ProfilePosition)
            .transition(Transition::Enable)
            .unwrap();
        assert!(pp.transition(Transition::SetTarget(SetpointKind::Position)).is_ok());
        assert!(pp.transition(Transition::SetTarget(SetpointKind::Current)).is_err());
    }

    #[test]
    fn test_setpoint_requires_enabled() {
        assert_eq!(
            configured(Mode::Velocity).transition(Transition::SetTarget(SetpointKind::Velocity)),
            Err(Rejection::NotEnabled)
        );
    }

    #[test]
    fn test_disable_always_legal() {
        let state = DeviceState::default();
        assert_eq!(state.transition(Transition::Disable), Ok(state));

        let enabled = configured(Mode::Velocity)
            .transition(Transition::Enable)
            .unwrap();
        let disabled = enabled.transition(Transition::Disable).unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.mode, Mode::Velocity);
    }

    #[test]
    fn test_device_limits_lookup() {
        let limits = DeviceLimits {
            velocity: Some(VelocityLimits {
                current_limit: 2.0,
                accel: 10.0,
            }),
            ..Default::default()
        };
        assert!(matches!(limits.for_mode(Mode::Velocity), Some(Limits::Velocity(_))));
        assert_eq!(limits.for_mode(Mode::Csp), None);
        assert_eq!(limits.for_mode(Mode::Current), None);
    }

    #[test]
    fn test_device_from_json() {
        let device: Device = serde_json::from_str(
            r#"{"id": 4, "offset": 0.5, "limits": {"csp": {"speed_limit": 1.0, "current_limit": 4.0}}}"#,
        )
        .unwrap();
        assert_eq!(device.id, 4);
        assert_eq!(device.offset, 0.5);
        assert!(device.limits.csp.is_some());
        assert!(device.limits.pp.is_none());
    }
}
