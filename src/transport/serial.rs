// Serial port transport backed by the `serialport` crate
//
// serialport is blocking, so every call runs on tokio's blocking pool and the
// async caller only suspends. Reads block for at most `READ_SLICE` at a time;
// a cancelled read therefore holds the port for one slice, not for the whole
// response timeout.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Transport;

/// Default read timeout applied when the port is opened
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Longest a single blocking read may hold the port
pub const READ_SLICE: Duration = Duration::from_millis(10);

// Slices `close` waits for an in-flight read to hand the port back
const CLOSE_ATTEMPTS: u32 = 10;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Serial port connection to the USB-CAN adapter
#[derive(Default)]
pub struct SerialTransport {
    port: Option<SharedPort>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a port that is already open
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self {
            port: Some(Arc::new(Mutex::new(port))),
        }
    }

    fn handle(&self) -> io::Result<SharedPort> {
        self.port
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is not open"))
    }
}

fn lock(port: &SharedPort) -> io::Result<MutexGuard<'_, Box<dyn SerialPort>>> {
    port.lock()
        .map_err(|_| io::Error::other("serial port lock poisoned"))
}

/// Blocking timeout for the next read, given what is left of the caller's
fn read_slice(remaining: Duration) -> Duration {
    remaining.min(READ_SLICE)
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "no data from serial port")
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self, port: &str, baudrate: u32) -> io::Result<()> {
        let name = port.to_string();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(name, baudrate)
                .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
                .open()
        })
        .await
        .map_err(io::Error::other)??;

        debug!("Serial port {} open at {} baud", port, baudrate);
        self.port = Some(Arc::new(Mutex::new(opened)));
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.handle()?;
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = lock(&port)?;
            port.write_all(&bytes)?;
            port.flush()
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let max = buf.len();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let port = self.handle()?;
            let slice = read_slice(remaining);
            let data = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
                let mut port = lock(&port)?;
                port.set_timeout(slice)?;
                let mut chunk = vec![0u8; max];
                let n = port.read(&mut chunk)?;
                chunk.truncate(n);
                Ok(chunk)
            })
            .await
            .map_err(io::Error::other)?;

            match data {
                Ok(data) if data.is_empty() => continue,
                Ok(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    return Ok(data.len());
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        let Some(mut port) = self.port.take() else {
            return Ok(());
        };

        // Dropping the last handle closes the device; a read cancelled
        // mid-slice still holds one until its blocking call returns
        for _ in 0..CLOSE_ATTEMPTS {
            match Arc::try_unwrap(port) {
                Ok(last) => {
                    drop(last);
                    return Ok(());
                }
                Err(shared) => {
                    port = shared;
                    tokio::time::sleep(READ_SLICE).await;
                }
            }
        }
        warn!("Serial port still busy, it closes when the pending read returns");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
