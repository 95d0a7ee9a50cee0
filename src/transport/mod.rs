// Byte-stream transports for the USB-CAN adapter
//
// Provides:
// - The `Transport` trait consumed by the bus channel
// - A `serialport`-backed implementation for real hardware
// - An in-process simulated bus for tests and dry runs

pub mod mock;
mod serial;

use std::io;
use std::time::Duration;

use async_trait::async_trait;

pub use mock::{MockBus, MockTransport, SimMotor};
pub use serial::SerialTransport;

/// Duplex byte stream to the adapter
///
/// `read` returns an error of kind `TimedOut` when nothing arrives within
/// `timeout`.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(&mut self, port: &str, baudrate: u32) -> io::Result<()>;

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    async fn close(&mut self) -> io::Result<()>;

    fn is_open(&self) -> bool;
}
