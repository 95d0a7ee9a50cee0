// Bus channel: one exchange at a time on a shared serial link
//
// The transport sits behind a fair (FIFO) async mutex. Every exchange holds the
// gate from the first drained byte to the decoded reply, so requests to
// different motors on the same adapter can never interleave. Dropping the
// `send` future releases the gate.
//
// Motors also answer writes the controller does not wait for, so a reply can
// still land after the drain. Frames from the addressed motor whose type does
// not match the request are skipped.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{MotorError, Result};
use super::protocol::{self, CommType, FRAME_LEN, Frame, MotorResponse, RawFrame};
use crate::config::{DRAIN_BUDGET, DRAIN_WINDOW, POLL_INTERVAL};
use crate::transport::Transport;

const HEADER: &[u8] = b"AT";

/// Exclusive owner of one transport
pub struct BusChannel<T: Transport> {
    port: String,
    baudrate: u32,
    gate: Mutex<T>,
    open: AtomicBool,
}

impl<T: Transport> BusChannel<T> {
    pub fn new(transport: T, port: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
            gate: Mutex::new(transport),
            open: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Open the underlying transport
    pub async fn open(&self) -> Result<()> {
        let mut transport = self.gate.lock().await;
        if transport.is_open() {
            return Err(MotorError::AlreadyConnected);
        }

        transport
            .open(&self.port, self.baudrate)
            .await
            .map_err(|source| MotorError::Connection {
                port: self.port.clone(),
                source,
            })?;
        self.open.store(true, Ordering::Release);
        info!("Bus {} open at {} baud", self.port, self.baudrate);
        Ok(())
    }

    /// Close the underlying transport; the channel counts as closed even if this fails
    pub async fn close(&self) -> Result<()> {
        let mut transport = self.gate.lock().await;
        self.open.store(false, Ordering::Release);
        if !transport.is_open() {
            return Ok(());
        }

        transport
            .close()
            .await
            .map_err(|source| MotorError::Connection {
                port: self.port.clone(),
                source,
            })?;
        info!("Bus {} closed", self.port);
        Ok(())
    }

    /// Write `frame` and, if `expects_response`, wait up to `timeout` for the reply
    pub async fn send(
        &self,
        frame: &Frame,
        expects_response: bool,
        timeout: Duration,
    ) -> Result<Option<MotorResponse>> {
        let mut transport = self.gate.lock().await;
        if !transport.is_open() {
            return Err(MotorError::NotConnected);
        }

        let id = frame.device_id();
        drain(&mut *transport).await?;

        transport.write(frame.as_bytes()).await?;
        debug!("Sent frame to motor {}: {:02X?}", id, frame.as_bytes());

        if !expects_response {
            return Ok(None);
        }

        let expected = frame.comm_type().map(CommType::reply_type);
        let reply = read_frame(&mut *transport, id, expected, timeout).await?;
        debug!("Received frame from motor {}: {:02X?}", id, reply);
        Ok(Some(protocol::decode(&reply, id)?))
    }
}

/// Discard whatever is already waiting on the link, for at most `DRAIN_BUDGET`
async fn drain<T: Transport>(transport: &mut T) -> Result<()> {
    let deadline = Instant::now() + DRAIN_BUDGET;
    let mut scratch = [0u8; 64];
    let mut discarded = 0usize;
    loop {
        if Instant::now() >= deadline {
            warn!(
                "Link still busy after discarding {} bytes, writing anyway",
                discarded
            );
            break;
        }
        match transport.read(&mut scratch, DRAIN_WINDOW).await {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(MotorError::Io(e)),
        }
    }
    if discarded > 0 {
        debug!("Discarded {} stale bytes before write", discarded);
    }
    Ok(())
}

/// Read until a reply of the `expected` type is buffered or the deadline passes
///
/// Frames from motor `id` of any other type are dropped. Anything else is
/// returned as-is and left for the decoder to reject.
async fn read_frame<T: Transport>(
    transport: &mut T,
    id: u8,
    expected: Option<CommType>,
    timeout: Duration,
) -> Result<[u8; FRAME_LEN]> {
    let deadline = Instant::now() + timeout;
    let mut buffer = Vec::with_capacity(FRAME_LEN * 2);
    let mut chunk = [0u8; 64];

    loop {
        align_to_header(&mut buffer);
        if buffer.len() >= FRAME_LEN {
            let mut frame = [0u8; FRAME_LEN];
            frame.copy_from_slice(&buffer[..FRAME_LEN]);
            buffer.drain(..FRAME_LEN);
            if is_other_reply(&frame, id, expected) {
                debug!("Ignoring out-of-turn frame from motor {}: {:02X?}", id, frame);
                continue;
            }
            return Ok(frame);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MotorError::Timeout { id });
        }

        match transport.read(&mut chunk, remaining).await {
            Ok(0) => tokio::time::sleep(POLL_INTERVAL.min(remaining)).await,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(MotorError::Timeout { id });
            }
            Err(e) => return Err(MotorError::Io(e)),
        }
    }
}

/// A well-formed frame from motor `id` that does not answer the current request
fn is_other_reply(frame: &[u8], id: u8, expected: Option<CommType>) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    match RawFrame::parse(frame) {
        Ok(raw) => raw.source_id() == id && raw.comm_type() != expected as u8,
        Err(_) => false,
    }
}

/// Drop leading bytes until the buffer starts with a frame header
fn align_to_header(buffer: &mut Vec<u8>) {
    if buffer.starts_with(HEADER) {
        return;
    }
    let skip = match buffer.windows(HEADER.len()).position(|w| w == HEADER) {
        Some(pos) => pos,
        // Keep a trailing 'A' that may be the first half of a header
        None if buffer.last() == Some(&HEADER[0]) => buffer.len() - 1,
        None => buffer.len(),
    };
    if skip > 0 {
        warn!("Skipping {} bytes of line noise", skip);
        buffer.drain(..skip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::protocol::{MotorCommand, ParamValue, ParameterIndex, encode};
    use crate::transport::MockBus;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn feedback() -> MotorResponse {
        MotorResponse::Feedback(protocol::MotorFeedback {
            status: protocol::MotorStatus::Run,
            faults: 0,
            position: 0.0,
            velocity: 0.0,
            torque: 0.0,
            temperature: 25.0,
        })
    }

    async fn open_channel(bus: &MockBus) -> BusChannel<crate::transport::MockTransport> {
        let channel = BusChannel::new(bus.transport(), "sim0", 921_600);
        channel.open().await.unwrap();
        channel
    }

    #[test]
    fn test_align_to_header() {
        let mut buffer = b"xxATyy".to_vec();
        align_to_header(&mut buffer);
        assert_eq!(buffer, b"ATyy");

        let mut buffer = b"zzA".to_vec();
        align_to_header(&mut buffer);
        assert_eq!(buffer, b"A");

        let mut buffer = b"zzz".to_vec();
        align_to_header(&mut buffer);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let bus = MockBus::with_motors(&[1]);
        let channel = BusChannel::new(bus.transport(), "sim0", 921_600);
        let frame = encode(253, 1, &MotorCommand::Enable);
        let err = channel.send(&frame, true, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, MotorError::NotConnected));
    }

    #[tokio::test]
    async fn test_double_open_is_error() {
        let bus = MockBus::with_motors(&[1]);
        let channel = open_channel(&bus).await;
        assert!(matches!(
            channel.open().await,
            Err(MotorError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_open_failure_maps_to_connection_error() {
        let bus = MockBus::new();
        bus.set_fail_open(true);
        let channel = BusChannel::new(bus.transport(), "missing", 921_600);
        let err = channel.open().await.unwrap_err();
        assert!(matches!(err, MotorError::Connection { ref port, .. } if port == "missing"));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let bus = MockBus::with_motors(&[3]);
        let channel = open_channel(&bus).await;
        let frame = encode(253, 3, &MotorCommand::GetDeviceId);
        let response = channel.send(&frame, true, TIMEOUT).await.unwrap();
        assert_eq!(
            response,
            Some(MotorResponse::DeviceId {
                mcu_uid: bus.motor(3).unwrap().mcu_uid
            })
        );
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let bus = MockBus::with_motors(&[3]);
        bus.set_silent(3, true);
        let channel = open_channel(&bus).await;
        let frame = encode(253, 3, &MotorCommand::Enable);
        let err = channel
            .send(&frame, true, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MotorError::Timeout { id: 3 }));
    }

    #[tokio::test]
    async fn test_stray_reply_is_rejected() {
        let bus = MockBus::with_motors(&[1, 2]);
        bus.set_silent(1, true);
        let channel = open_channel(&bus).await;

        // Motor 1 stays quiet; a reply from motor 2 shows up mid-exchange
        let stray = protocol::encode_response(253, 2, &MotorResponse::DeviceId { mcu_uid: 9 });
        let frame = encode(253, 1, &MotorCommand::GetDeviceId);
        let injector = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                bus.inject(stray.as_bytes());
            })
        };
        let err = channel.send(&frame, true, TIMEOUT).await.unwrap_err();
        injector.await.unwrap();
        assert!(matches!(
            err,
            MotorError::Protocol(protocol::DecodeError::UnexpectedDeviceId {
                expected: 1,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_stale_input_is_drained() {
        let bus = MockBus::with_motors(&[5]);
        let channel = open_channel(&bus).await;

        // Setpoint writes are not acknowledged, so their replies stay queued
        let setpoint = encode(
            253,
            5,
            &MotorCommand::WriteParam(ParameterIndex::SpdRef, ParamValue::Float(1.0)),
        );
        assert_eq!(channel.send(&setpoint, false, TIMEOUT).await.unwrap(), None);
        bus.inject(b"noise");

        let read = encode(253, 5, &MotorCommand::ReadParam(ParameterIndex::SpdRef));
        let response = channel.send(&read, true, TIMEOUT).await.unwrap().unwrap();
        assert_eq!(response.param_f32(), Some(1.0));
    }

    #[tokio::test]
    async fn test_late_reply_of_other_type_is_skipped() {
        let bus = MockBus::with_motors(&[1]);
        bus.set_silent(1, true);
        let channel = open_channel(&bus).await;

        // A feedback frame answering an earlier setpoint arrives after the
        // drain, ahead of the parameter reply
        let late = protocol::encode_response(253, 1, &feedback());
        let reply = protocol::encode_response(
            253,
            1,
            &MotorResponse::Parameter {
                index: ParameterIndex::LimitCur as u16,
                value: 7.5f32.to_le_bytes(),
            },
        );
        let injector = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                bus.inject(late.as_bytes());
                tokio::time::sleep(Duration::from_millis(5)).await;
                bus.inject(reply.as_bytes());
            })
        };

        let read = encode(253, 1, &MotorCommand::ReadParam(ParameterIndex::LimitCur));
        let response = channel.send(&read, true, TIMEOUT).await.unwrap().unwrap();
        injector.await.unwrap();
        assert_eq!(response.param_f32(), Some(7.5));
    }

    #[tokio::test]
    async fn test_only_other_type_replies_time_out() {
        let bus = MockBus::with_motors(&[1]);
        bus.set_silent(1, true);
        let channel = open_channel(&bus).await;

        let late = protocol::encode_response(253, 1, &MotorResponse::DeviceId { mcu_uid: 1 });
        let injector = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                bus.inject(late.as_bytes());
            })
        };

        let frame = encode(253, 1, &MotorCommand::Enable);
        let err = channel
            .send(&frame, true, Duration::from_millis(50))
            .await
            .unwrap_err();
        injector.await.unwrap();
        assert!(matches!(err, MotorError::Timeout { id: 1 }));
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_chatty_motor() {
        let bus = MockBus::with_motors(&[4]);
        bus.set_chatty(4, true);
        let channel = open_channel(&bus).await;

        let read = encode(253, 4, &MotorCommand::ReadParam(ParameterIndex::VelMax));
        let response = tokio::time::timeout(
            Duration::from_millis(500),
            channel.send(&read, true, TIMEOUT),
        )
        .await
        .expect("drain never finished")
        .unwrap()
        .unwrap();
        assert!(matches!(response, MotorResponse::Parameter { .. }));
        assert_eq!(
            bus.requests(),
            vec![(4, MotorCommand::ReadParam(ParameterIndex::VelMax))]
        );
    }

    #[test]
    fn test_is_other_reply() {
        let frame = protocol::encode_response(253, 1, &feedback());
        let feedback = frame.as_bytes();
        assert!(is_other_reply(feedback, 1, Some(CommType::ReadParam)));
        assert!(!is_other_reply(feedback, 1, Some(CommType::Feedback)));
        // Other motors are left for the decoder to reject
        assert!(!is_other_reply(feedback, 2, Some(CommType::ReadParam)));
        assert!(!is_other_reply(b"not a frame at all", 1, Some(CommType::ReadParam)));
        assert!(!is_other_reply(feedback, 1, None));
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let bus = MockBus::with_motors(&[1, 2]);
        let channel = Arc::new(open_channel(&bus).await);
        let first = encode(
            253,
            1,
            &MotorCommand::WriteParam(ParameterIndex::IqRef, ParamValue::Float(0.5)),
        );
        let second = encode(
            253,
            2,
            &MotorCommand::WriteParam(ParameterIndex::IqRef, ParamValue::Float(-0.5)),
        );

        let a = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(&first, false, TIMEOUT).await })
        };
        let b = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(&second, false, TIMEOUT).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let written = bus.written();
        let one_then_two = [first.as_bytes(), second.as_bytes()].concat();
        let two_then_one = [second.as_bytes(), first.as_bytes()].concat();
        assert!(written == one_then_two || written == two_then_one);
    }

    #[tokio::test]
    async fn test_cancelled_send_releases_gate() {
        let bus = MockBus::with_motors(&[1, 2]);
        bus.set_silent(1, true);
        let channel = Arc::new(open_channel(&bus).await);

        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let frame = encode(253, 1, &MotorCommand::Enable);
                channel.send(&frame, true, Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        let frame = encode(253, 2, &MotorCommand::GetDeviceId);
        let response = tokio::time::timeout(
            Duration::from_millis(100),
            channel.send(&frame, true, TIMEOUT),
        )
        .await
        .expect("gate still held after cancellation")
        .unwrap();
        assert!(matches!(response, Some(MotorResponse::DeviceId { .. })));
    }
}
