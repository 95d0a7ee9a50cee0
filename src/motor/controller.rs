// Controller: command API for every motor on one bus
//
// Each call runs the same pipeline: connection check -> state transition check
// -> encode -> bus exchange -> decode -> state update. A device's state lock is
// held for the whole pipeline and the new state is written only after the
// exchange succeeds, so a failed or cancelled call leaves the state untouched.
//
// Once `disconnect` starts, every new command is refused with `NotConnected`;
// commands already waiting on a device lock check again once they hold it.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::bus::BusChannel;
use super::error::{MotorError, Result};
use super::protocol::{
    self, DecodeError, MotorCommand, MotorFeedback, MotorResponse, MotorStatus, ParamValue,
    ParameterIndex,
};
use super::state::{Device, DeviceState, Limits, Mode, Rejection, SetpointKind, Transition};
use crate::config::ControllerConfig;
use crate::transport::{SerialTransport, Transport};

/// Relative tolerance for parameter read-back
const READBACK_TOLERANCE: f32 = 1e-6;

struct DeviceSlot {
    device: Device,
    state: Mutex<DeviceState>,
}

/// Outcome of an orderly shutdown
///
/// Shutdown always completes; failures along the way are collected here.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Per-device failures while zeroing setpoints or disabling
    pub failures: Vec<(u8, MotorError)>,
    /// Failure closing the port
    pub close_error: Option<MotorError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.close_error.is_none()
    }
}

/// Motors sharing one serial adapter
pub struct Controller<T: Transport> {
    config: ControllerConfig,
    bus: BusChannel<T>,
    devices: BTreeMap<u8, DeviceSlot>,
    closing: AtomicBool,
}

impl Controller<SerialTransport> {
    /// Controller talking to a real serial port
    pub fn serial(config: ControllerConfig) -> Self {
        Self::new(config, SerialTransport::new())
    }
}

impl<T: Transport> Controller<T> {
    pub fn new(config: ControllerConfig, transport: T) -> Self {
        let bus = BusChannel::new(transport, config.port.clone(), config.baudrate);
        let devices = config
            .devices
            .iter()
            .map(|device| {
                let slot = DeviceSlot {
                    device: device.clone(),
                    state: Mutex::new(DeviceState::default()),
                };
                (device.id, slot)
            })
            .collect();
        Self {
            config,
            bus,
            devices,
            closing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Open and not shutting down
    pub fn is_connected(&self) -> bool {
        self.bus.is_open() && !self.closing.load(Ordering::Acquire)
    }

    pub fn device_ids(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    pub fn device(&self, id: u8) -> Option<&Device> {
        self.devices.get(&id).map(|slot| &slot.device)
    }

    /// Snapshot of a device's state
    pub async fn device_state(&self, id: u8) -> Result<DeviceState> {
        Ok(*self.slot(id)?.state.lock().await)
    }

    /// Connect and wrap the controller in a guard that disconnects on drop
    pub async fn into_session(self) -> Result<Session<T>> {
        self.connect().await?;
        Ok(Session {
            controller: Arc::new(self),
            closed: false,
        })
    }

    // === Lifecycle ===

    /// Open the port and, if configured, check every motor answers
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to motors {:?} on {}", self.device_ids(), self.bus.port());
        self.bus.open().await?;

        for slot in self.devices.values() {
            *slot.state.lock().await = DeviceState::default();
        }

        if self.config.verify_on_connect {
            for &id in self.devices.keys() {
                match self.ping(id).await {
                    Ok(uid) => info!("Motor {} responding (MCU id {:016X})", id, uid),
                    Err(e) => {
                        error!("Motor {} not responding: {}", id, e);
                        if let Err(close_err) = self.bus.close().await {
                            warn!("Failed to close {}: {}", self.bus.port(), close_err);
                        }
                        return Err(e);
                    }
                }
            }
        }

        info!("All motors on {} connected", self.bus.port());
        Ok(())
    }

    /// Zero active setpoints, disable every motor and close the port
    ///
    /// Disable failures are collected rather than returned; the port is closed
    /// and every device is marked disabled regardless.
    pub async fn disconnect(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if !self.bus.is_open() || self.closing.swap(true, Ordering::AcqRel) {
            return report;
        }
        info!("Shutting down motors on {}", self.bus.port());

        let mut zeroed = false;
        for (&id, slot) in &self.devices {
            let state = slot.state.lock().await;
            if !state.enabled {
                continue;
            }
            let index = match state.mode {
                Mode::Velocity => ParameterIndex::SpdRef,
                Mode::Current => ParameterIndex::IqRef,
                _ => continue,
            };
            zeroed = true;
            let command = MotorCommand::WriteParam(index, ParamValue::Float(0.0));
            if let Err(e) = self.exchange(id, &command).await {
                warn!("Failed to zero motor {}: {}", id, e);
                report.failures.push((id, e));
            }
        }
        if zeroed {
            tokio::time::sleep(self.config.settle()).await;
        }

        for (&id, slot) in &self.devices {
            let mut state = slot.state.lock().await;
            if let Err(e) = self.request(id, &MotorCommand::Disable).await {
                warn!("Failed to disable motor {}: {}", id, e);
                report.failures.push((id, e));
            }
            state.enabled = false;
        }

        if let Err(e) = self.bus.close().await {
            error!("Failed to close {}: {}", self.bus.port(), e);
            report.close_error = Some(e);
        }
        self.closing.store(false, Ordering::Release);
        report
    }

    // === Diagnostics ===

    /// Ask a motor for its MCU unique id
    pub async fn ping(&self, id: u8) -> Result<u64> {
        self.ensure_connected()?;
        self.slot(id)?;
        match self.request(id, &MotorCommand::GetDeviceId).await? {
            MotorResponse::DeviceId { mcu_uid } => Ok(mcu_uid),
            other => Err(unexpected_reply(id, "device id", &other)),
        }
    }

    /// Read a parameter as `f32` (run mode reads as its wire value)
    pub async fn read_parameter(&self, id: u8, index: ParameterIndex) -> Result<f32> {
        self.ensure_connected()?;
        self.slot(id)?;
        let response = self.request(id, &MotorCommand::ReadParam(index)).await?;
        let value = if index == ParameterIndex::RunMode {
            response.param_u8().map(f32::from)
        } else {
            response.param_f32()
        };
        value.ok_or_else(|| unexpected_reply(id, "parameter", &response))
    }

    // === Enable / disable ===

    /// Enable a motor; it must already have a mode
    pub async fn enable(&self, id: u8) -> Result<MotorFeedback> {
        let (_, mut state) = self.lock_state(id).await?;
        let next = check(id, &state, Transition::Enable)?;

        info!("Enabling motor {}", id);
        let feedback = self.request_feedback(id, &MotorCommand::Enable).await?;
        if feedback.status != MotorStatus::Run {
            return Err(MotorError::Rejected {
                id,
                reason: format!("enable answered with status {:?}", feedback.status),
            });
        }

        *state = next;
        info!("Motor {} enabled in {} mode", id, state.mode);
        Ok(feedback)
    }

    /// Disable a motor
    pub async fn disable(&self, id: u8) -> Result<MotorFeedback> {
        let (_, mut state) = self.lock_state(id).await?;
        let next = check(id, &state, Transition::Disable)?;

        info!("Disabling motor {}", id);
        let feedback = self.request_feedback(id, &MotorCommand::Disable).await?;
        *state = next;
        Ok(feedback)
    }

    // === Mode selection ===

    pub async fn set_mode_csp(&self, id: u8) -> Result<()> {
        self.set_mode(id, Mode::Csp).await
    }

    pub async fn set_mode_pp(&self, id: u8) -> Result<()> {
        self.set_mode(id, Mode::ProfilePosition).await
    }

    pub async fn set_mode_velocity(&self, id: u8) -> Result<()> {
        self.set_mode(id, Mode::Velocity).await
    }

    pub async fn set_mode_current(&self, id: u8) -> Result<()> {
        self.set_mode(id, Mode::Current).await
    }

    async fn set_mode(&self, id: u8, mode: Mode) -> Result<()> {
        let (_, mut state) = self.lock_state(id).await?;
        let next = check(id, &state, Transition::SetMode(mode))?;
        let run_mode = mode.run_mode().ok_or(MotorError::InvalidTransition {
            id,
            reason: Rejection::UninitializedTarget,
        })?;

        info!("Setting motor {} to {} mode", id, mode);
        let write = MotorCommand::WriteParam(ParameterIndex::RunMode, ParamValue::Mode(run_mode));
        self.request_feedback(id, &write).await?;

        tokio::time::sleep(self.config.settle()).await;
        let response = self
            .request(id, &MotorCommand::ReadParam(ParameterIndex::RunMode))
            .await?;
        let reported = response
            .param_u8()
            .ok_or_else(|| unexpected_reply(id, "parameter", &response))?;
        if reported != run_mode as u8 {
            return Err(MotorError::Rejected {
                id,
                reason: format!(
                    "run mode reads back as {}, expected {}",
                    reported, run_mode as u8
                ),
            });
        }

        *state = next;
        info!("Motor {} now in {} mode", id, mode);
        Ok(())
    }

    // === Limits ===

    pub async fn apply_csp_limits(&self, id: u8) -> Result<()> {
        self.apply_limits(id, Mode::Csp).await
    }

    pub async fn apply_pp_limits(&self, id: u8) -> Result<()> {
        self.apply_limits(id, Mode::ProfilePosition).await
    }

    pub async fn apply_velocity_limits(&self, id: u8) -> Result<()> {
        self.apply_limits(id, Mode::Velocity).await
    }

    async fn apply_limits(&self, id: u8, mode: Mode) -> Result<()> {
        let (slot, mut state) = self.lock_state(id).await?;

        let Some(limits) = slot.device.limits.for_mode(mode) else {
            if state.mode != mode {
                return Err(MotorError::InvalidTransition {
                    id,
                    reason: Rejection::LimitsModeMismatch {
                        limits: mode,
                        current: state.mode,
                    },
                });
            }
            warn!("No {} limits configured for motor {}", mode, id);
            return Ok(());
        };
        let next = check(id, &state, Transition::ApplyLimits(limits))?;

        for (index, value) in limit_fields(&limits) {
            info!("Setting {:?} to {} for motor {}", index, value, id);
            self.write_verified(id, index, value).await?;
        }

        *state = next;
        Ok(())
    }

    // === Setpoints (not acknowledged) ===

    /// Position target in radians; the device offset is added before sending
    pub async fn set_target_position(&self, id: u8, radians: f32) -> Result<()> {
        self.set_target(id, SetpointKind::Position, radians).await
    }

    /// Velocity target in rad/s
    pub async fn set_target_velocity(&self, id: u8, rad_per_s: f32) -> Result<()> {
        self.set_target(id, SetpointKind::Velocity, rad_per_s).await
    }

    /// Current target in amperes
    pub async fn set_target_current(&self, id: u8, amperes: f32) -> Result<()> {
        self.set_target(id, SetpointKind::Current, amperes).await
    }

    async fn set_target(&self, id: u8, kind: SetpointKind, value: f32) -> Result<()> {
        let (slot, state) = self.lock_state(id).await?;
        check(id, &state, Transition::SetTarget(kind))?;

        let (index, value) = match kind {
            SetpointKind::Position => (ParameterIndex::LocRef, value + slot.device.offset),
            SetpointKind::Velocity => (ParameterIndex::SpdRef, value),
            SetpointKind::Current => (ParameterIndex::IqRef, value),
        };
        debug!("Motor {} {} target {}", id, kind, value);
        self.exchange(id, &MotorCommand::WriteParam(index, ParamValue::Float(value)))
            .await?;
        Ok(())
    }

    // === Internals ===

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MotorError::NotConnected)
        }
    }

    /// Lock a device's state, refusing if the bus is closed or shutting down
    async fn lock_state(&self, id: u8) -> Result<(&DeviceSlot, MutexGuard<'_, DeviceState>)> {
        self.ensure_connected()?;
        let slot = self.slot(id)?;
        let state = slot.state.lock().await;
        self.ensure_connected()?;
        Ok((slot, state))
    }

    fn slot(&self, id: u8) -> Result<&DeviceSlot> {
        self.devices.get(&id).ok_or(MotorError::UnknownDevice(id))
    }

    fn response_timeout(&self) -> Duration {
        self.config.response_timeout()
    }

    async fn exchange(&self, id: u8, command: &MotorCommand) -> Result<Option<MotorResponse>> {
        let frame = protocol::encode(self.config.host_id, id, command);
        self.bus
            .send(&frame, command.expects_response(), self.response_timeout())
            .await
    }

    async fn request(&self, id: u8, command: &MotorCommand) -> Result<MotorResponse> {
        self.exchange(id, command)
            .await?
            .ok_or_else(|| MotorError::Rejected {
                id,
                reason: format!("{:?} is not acknowledged", command),
            })
    }

    async fn request_feedback(&self, id: u8, command: &MotorCommand) -> Result<MotorFeedback> {
        match self.request(id, command).await? {
            MotorResponse::Feedback(feedback) => Ok(feedback),
            other => Err(unexpected_reply(id, "feedback", &other)),
        }
    }

    /// Write a float parameter, let it settle, then read it back
    async fn write_verified(&self, id: u8, index: ParameterIndex, value: f32) -> Result<()> {
        self.request_feedback(id, &MotorCommand::WriteParam(index, ParamValue::Float(value)))
            .await?;

        tokio::time::sleep(self.config.settle()).await;
        let response = self.request(id, &MotorCommand::ReadParam(index)).await?;
        let reported = response
            .param_f32()
            .ok_or_else(|| unexpected_reply(id, "parameter", &response))?;
        if !is_close(reported, value) {
            return Err(MotorError::Rejected {
                id,
                reason: format!("{:?} reads back as {}, expected {}", index, reported, value),
            });
        }
        Ok(())
    }
}

fn check(id: u8, state: &DeviceState, op: Transition) -> Result<DeviceState> {
    state
        .transition(op)
        .map_err(|reason| MotorError::InvalidTransition { id, reason })
}

fn unexpected_reply(id: u8, wanted: &str, got: &MotorResponse) -> MotorError {
    MotorError::Protocol(DecodeError::MalformedFrame {
        reason: format!("motor {} sent {:?}, expected a {} reply", id, got, wanted),
    })
}

fn is_close(a: f32, b: f32) -> bool {
    (a - b).abs() <= READBACK_TOLERANCE * a.abs().max(b.abs())
}

/// Parameter writes for a limit set, in the order they are applied
fn limit_fields(limits: &Limits) -> Vec<(ParameterIndex, f32)> {
    match *limits {
        Limits::Csp(l) => vec![
            (ParameterIndex::LimitSpd, l.speed_limit),
            (ParameterIndex::LimitCur, l.current_limit),
        ],
        Limits::ProfilePosition(l) => vec![
            (ParameterIndex::VelMax, l.vel_max),
            (ParameterIndex::AccSet, l.acc),
            (ParameterIndex::LimitCur, l.current_limit),
        ],
        Limits::Velocity(l) => vec![
            (ParameterIndex::LimitCur, l.current_limit),
            (ParameterIndex::AccRad, l.accel),
        ],
    }
}

/// A connected controller that shuts down when it goes out of scope
///
/// Call [`Session::close`] for an orderly shutdown with a report. If the
/// session is dropped instead (early return, error, cancelled task), the
/// shutdown is spawned on the current tokio runtime.
pub struct Session<T: Transport> {
    controller: Arc<Controller<T>>,
    closed: bool,
}

impl<T: Transport> Session<T> {
    /// Shared handle for driving the bus from several tasks
    pub fn controller(&self) -> Arc<Controller<T>> {
        self.controller.clone()
    }

    pub async fn close(mut self) -> ShutdownReport {
        self.closed = true;
        self.controller.disconnect().await
    }
}

impl<T: Transport> Deref for Session<T> {
    type Target = Controller<T>;

    fn deref(&self) -> &Self::Target {
        &self.controller
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.closed || !self.controller.is_connected() {
            return;
        }
        let controller = self.controller.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Session on {} dropped while connected, shutting down", controller.bus.port());
                handle.spawn(async move {
                    let report = controller.disconnect().await;
                    if !report.is_clean() {
                        warn!("Shutdown finished with errors: {:?}", report);
                    }
                });
            }
            Err(_) => warn!("No runtime to shut down motors; port closes with the transport"),
        }
    }
}
