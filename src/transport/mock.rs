// Simulated RobStride bus
//
// Answers every request the way a motor behind the USB-CAN adapter would,
// tracks run mode, parameters and enable state per motor, and records every
// byte written so tests can inspect what went out on the wire.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::Transport;
use crate::motor::protocol::{
    self, FRAME_LEN, MotorCommand, MotorFeedback, MotorResponse, MotorStatus, ParamValue,
    ParameterIndex, RunMode,
};

/// One simulated motor
#[derive(Debug, Clone, PartialEq)]
pub struct SimMotor {
    pub run_mode: RunMode,
    pub enabled: bool,
    pub params: HashMap<ParameterIndex, f32>,
    pub mcu_uid: u64,
    /// Never answers
    pub silent: bool,
    /// Answers enable requests with a non-running status
    pub refuse_enable: bool,
    /// Ignores run mode writes
    pub sticky_run_mode: bool,
    /// Streams feedback whenever the link is otherwise idle
    pub chatty: bool,
}

impl SimMotor {
    fn new(id: u8) -> Self {
        Self {
            run_mode: RunMode::Operation,
            enabled: false,
            params: HashMap::new(),
            mcu_uid: 0x5253_0000_0000_0000 | id as u64,
            silent: false,
            refuse_enable: false,
            sticky_run_mode: false,
            chatty: false,
        }
    }

    fn param(&self, index: ParameterIndex) -> f32 {
        self.params.get(&index).copied().unwrap_or(0.0)
    }

    fn feedback(&self, status: MotorStatus) -> MotorResponse {
        MotorResponse::Feedback(MotorFeedback {
            status,
            faults: 0,
            position: self.param(ParameterIndex::LocRef),
            velocity: self.param(ParameterIndex::SpdRef),
            torque: 0.0,
            temperature: 25.0,
        })
    }

    fn status(&self) -> MotorStatus {
        if self.enabled {
            MotorStatus::Run
        } else {
            MotorStatus::Reset
        }
    }

    fn handle(&mut self, command: MotorCommand) -> MotorResponse {
        match command {
            MotorCommand::GetDeviceId => MotorResponse::DeviceId {
                mcu_uid: self.mcu_uid,
            },
            MotorCommand::Enable => {
                if self.refuse_enable {
                    self.feedback(MotorStatus::Calibration)
                } else {
                    self.enabled = true;
                    self.feedback(MotorStatus::Run)
                }
            }
            MotorCommand::Disable => {
                self.enabled = false;
                self.feedback(MotorStatus::Reset)
            }
            MotorCommand::ReadParam(index) => {
                let value = if index == ParameterIndex::RunMode {
                    (self.run_mode as u32).to_le_bytes()
                } else {
                    self.param(index).to_le_bytes()
                };
                MotorResponse::Parameter {
                    index: index as u16,
                    value,
                }
            }
            MotorCommand::WriteParam(_, ParamValue::Mode(mode)) => {
                if !self.sticky_run_mode {
                    self.run_mode = mode;
                }
                self.feedback(self.status())
            }
            MotorCommand::WriteParam(index, ParamValue::Float(value)) => {
                self.params.insert(index, value);
                self.feedback(self.status())
            }
        }
    }
}

#[derive(Debug, Default)]
struct BusState {
    open: bool,
    port: Option<String>,
    baudrate: u32,
    open_count: usize,
    close_count: usize,
    fail_open: bool,
    written: Vec<u8>,
    request: Vec<u8>,
    rx: VecDeque<u8>,
    last_host: u8,
    motors: BTreeMap<u8, SimMotor>,
}

impl BusState {
    fn accept_byte(&mut self, byte: u8) {
        self.written.push(byte);
        self.request.push(byte);

        // Resync on the "AT" header
        while !self.request.is_empty() && self.request[0] != b'A' {
            self.request.remove(0);
        }
        if self.request.len() < FRAME_LEN {
            return;
        }

        let bytes: Vec<u8> = self.request.drain(..FRAME_LEN).collect();
        let (host_id, device_id, command) = match protocol::decode_request(&bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Simulated bus dropped request: {}", e);
                return;
            }
        };

        self.last_host = host_id;
        let Some(motor) = self.motors.get_mut(&device_id) else {
            return;
        };
        if motor.silent {
            return;
        }
        let response = motor.handle(command);
        let reply = protocol::encode_response(host_id, device_id, &response);
        self.rx.extend(reply.as_bytes());
    }

    /// Queue one unsolicited feedback frame per chatty motor
    fn chatter(&mut self) {
        let host_id = self.last_host;
        for (&id, motor) in &self.motors {
            if motor.chatty && !motor.silent {
                let reply = protocol::encode_response(host_id, id, &motor.feedback(motor.status()));
                self.rx.extend(reply.as_bytes());
            }
        }
    }
}

/// Shared handle to a simulated bus; clone it to inspect the bus from tests
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with one simulated motor per id
    pub fn with_motors(ids: &[u8]) -> Self {
        let bus = Self::new();
        for &id in ids {
            bus.add_motor(id);
        }
        bus
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_motor(&self, id: u8) {
        self.state().motors.insert(id, SimMotor::new(id));
    }

    /// A transport bound to this bus
    pub fn transport(&self) -> MockTransport {
        MockTransport { bus: self.clone() }
    }

    pub fn motor(&self, id: u8) -> Option<SimMotor> {
        self.state().motors.get(&id).cloned()
    }

    pub fn set_silent(&self, id: u8, silent: bool) {
        if let Some(motor) = self.state().motors.get_mut(&id) {
            motor.silent = silent;
        }
    }

    pub fn set_refuse_enable(&self, id: u8, refuse: bool) {
        if let Some(motor) = self.state().motors.get_mut(&id) {
            motor.refuse_enable = refuse;
        }
    }

    pub fn set_sticky_run_mode(&self, id: u8, sticky: bool) {
        if let Some(motor) = self.state().motors.get_mut(&id) {
            motor.sticky_run_mode = sticky;
        }
    }

    pub fn set_chatty(&self, id: u8, chatty: bool) {
        if let Some(motor) = self.state().motors.get_mut(&id) {
            motor.chatty = chatty;
        }
    }

    /// Make the next `open` calls fail
    pub fn set_fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    /// Queue raw bytes as if they arrived from the bus
    pub fn inject(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes);
        self.notify.notify_waiters();
    }

    /// Every byte written since the bus was created
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Written bytes split into frames, decoded as requests
    pub fn requests(&self) -> Vec<(u8, MotorCommand)> {
        self.written()
            .chunks(FRAME_LEN)
            .filter_map(|chunk| protocol::decode_request(chunk).ok())
            .map(|(_, id, command)| (id, command))
            .collect()
    }

    pub fn clear_written(&self) {
        self.state().written.clear();
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn port(&self) -> Option<(String, u32)> {
        let state = self.state();
        state.port.clone().map(|port| (port, state.baudrate))
    }

    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    pub fn close_count(&self) -> usize {
        self.state().close_count
    }
}

/// Transport end of a [`MockBus`]
#[derive(Debug)]
pub struct MockTransport {
    bus: MockBus,
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "simulated port is not open")
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, port: &str, baudrate: u32) -> io::Result<()> {
        let mut state = self.bus.state();
        if state.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such port {}", port),
            ));
        }
        state.open = true;
        state.port = Some(port.to_string());
        state.baudrate = baudrate;
        state.open_count += 1;
        state.rx.clear();
        state.request.clear();
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        // Byte at a time with a yield in between, so a second writer would
        // interleave if the caller did not serialize access
        for &byte in bytes {
            {
                let mut state = self.bus.state();
                if !state.open {
                    return Err(not_open());
                }
                state.accept_byte(byte);
            }
            tokio::task::yield_now().await;
        }
        self.bus.notify.notify_waiters();
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.bus.notify.notified();
            {
                let mut state = self.bus.state();
                if !state.open {
                    return Err(not_open());
                }
                if state.rx.is_empty() {
                    state.chatter();
                }
                if !state.rx.is_empty() {
                    let n = buf.len().min(state.rx.len());
                    for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no data from simulated bus",
                ));
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut state = self.bus.state();
        state.open = false;
        state.close_count += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.bus.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sim_answers_device_id() {
        let bus = MockBus::with_motors(&[7]);
        let mut transport = bus.transport();
        transport.open("sim", 921_600).await.unwrap();

        let frame = protocol::encode(253, 7, &MotorCommand::GetDeviceId);
        transport.write(frame.as_bytes()).await.unwrap();

        let mut buf = [0u8; 32];
        let n = transport
            .read(&mut buf, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(n, FRAME_LEN);
        let response = protocol::decode(&buf[..n], 7).unwrap();
        assert_eq!(
            response,
            MotorResponse::DeviceId {
                mcu_uid: bus.motor(7).unwrap().mcu_uid
            }
        );
    }

    #[tokio::test]
    async fn test_sim_silent_motor_times_out() {
        let bus = MockBus::with_motors(&[1]);
        bus.set_silent(1, true);
        let mut transport = bus.transport();
        transport.open("sim", 921_600).await.unwrap();

        let frame = protocol::encode(253, 1, &MotorCommand::Enable);
        transport.write(frame.as_bytes()).await.unwrap();

        let mut buf = [0u8; 32];
        let err = transport
            .read(&mut buf, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(!bus.motor(1).unwrap().enabled);
    }

    #[tokio::test]
    async fn test_chatty_motor_never_goes_quiet() {
        let bus = MockBus::with_motors(&[2]);
        bus.set_chatty(2, true);
        let mut transport = bus.transport();
        transport.open("sim", 921_600).await.unwrap();

        let mut buf = [0u8; FRAME_LEN];
        for _ in 0..3 {
            let n = transport
                .read(&mut buf, Duration::from_millis(1))
                .await
                .unwrap();
            assert_eq!(n, FRAME_LEN);
            assert!(matches!(
                protocol::decode(&buf, 2),
                Ok(MotorResponse::Feedback(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_write_requires_open() {
        let bus = MockBus::with_motors(&[1]);
        let mut transport = bus.transport();
        let err = transport.write(b"AT").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
