//! Byte transport abstraction.
//!
//! The protocol layer never touches a serial driver directly. Host and
//! bootloader both talk to a [`Port`], which offers the two operations the
//! protocol needs: write a run of bytes, and read exactly N bytes before a
//! deadline.
//!
//! ```text
//! +------------------+     +------------------+
//! |     Uploader     |     |    Bootloader    |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |   Port Trait     |     |   Port Trait     |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! | Native SerialPort|     |    MemoryPort    |
//! |   (serialport)   |     |   (in-process)   |
//! +------------------+     +------------------+
//! ```

pub mod memory;
#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::error::{Result, TransportError};

pub use memory::MemoryPort;
#[cfg(feature = "native")]
pub use native::NativePort;

/// Serial port configuration.
///
/// The link always runs 8N1 without flow control.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Driver-level read timeout; one poll of a [`ReadPolicy`] loop.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(20),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the driver timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How long a receive may wait, and how often an empty line is re-polled.
///
/// A read that returns no bytes is retried every `poll_interval` until
/// `timeout` has elapsed; then the read fails with a timeout. Nothing ever
/// waits without bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Deadline for the whole read.
    pub timeout: Duration,
    /// Pause between polls of an empty line.
    pub poll_interval: Duration,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(1),
        }
    }
}

impl ReadPolicy {
    /// Policy with the given deadline and the default poll interval.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Serial link as seen by the protocol.
pub trait Port: Read + Write + Send {
    /// Port name/path, for messages.
    fn name(&self) -> &str;

    /// Drop anything waiting in the receive and transmit buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_bytes(&mut self, buf: &[u8]) -> std::result::Result<(), TransportError> {
        Write::write_all(self, buf).map_err(|e| match e.kind() {
            ErrorKind::WriteZero | ErrorKind::BrokenPipe | ErrorKind::NotConnected => {
                TransportError::Closed
            },
            _ => TransportError::Io(e),
        })?;
        Write::flush(self)?;
        Ok(())
    }

    /// Fill `buf` completely, or fail with [`TransportError::Timeout`] once
    /// `policy.timeout` has elapsed.
    fn read_bytes(
        &mut self,
        buf: &mut [u8],
        policy: &ReadPolicy,
    ) -> std::result::Result<(), TransportError> {
        read_until(
            self,
            buf,
            Instant::now() + policy.timeout,
            policy.poll_interval,
        )
    }
}

/// Fill `buf` from `reader` before `deadline`.
///
/// Empty reads, driver timeouts and `WouldBlock` are retried every
/// `poll_interval` until the deadline.
pub fn read_until<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Instant,
    poll_interval: Duration,
) -> std::result::Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(n) if n > 0 => {
                filled += n;
                continue;
            },
            Ok(_) => {},
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            trace!("Read timed out with {filled}/{} bytes", buf.len());
            return Err(TransportError::Timeout);
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
    Ok(())
}

/// Read and drop bytes until nothing has arrived for `quiet`, or until
/// `deadline`. Returns the number of bytes dropped.
///
/// Used to get back in step after a broken frame, so its leftover payload is
/// not scanned for start-of-frame bytes.
pub fn drain_until_quiet<R: Read + ?Sized>(
    reader: &mut R,
    quiet: Duration,
    deadline: Instant,
    poll_interval: Duration,
) -> std::result::Result<usize, TransportError> {
    let mut scratch = [0u8; 64];
    let mut dropped = 0;
    let mut last_byte = Instant::now();
    loop {
        match reader.read(&mut scratch) {
            Ok(n) if n > 0 => {
                dropped += n;
                last_byte = Instant::now();
                if last_byte >= deadline {
                    return Ok(dropped);
                }
                continue;
            },
            Ok(_) => {},
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }

        let now = Instant::now();
        if now >= deadline || now.duration_since(last_byte) >= quiet {
            return Ok(dropped);
        }
        thread::sleep(poll_interval.min(quiet));
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product string (if available).
    pub product: Option<String>,
}
