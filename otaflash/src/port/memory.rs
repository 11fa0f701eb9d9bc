//! In-process serial link.
//!
//! [`MemoryPort::pair`] returns two connected endpoints: bytes written to one
//! are read from the other. Reads never block; an empty line reports
//! `TimedOut`, like a serial driver whose timeout expired, and the
//! [`ReadPolicy`](super::ReadPolicy) loop above decides how long to keep
//! polling. Endpoints are `Send`, so host and bootloader can run on separate
//! threads.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::port::Port;

type Wire = Arc<Mutex<VecDeque<u8>>>;

/// One end of an in-memory serial link.
#[derive(Debug)]
pub struct MemoryPort {
    name: String,
    rx: Wire,
    tx: Wire,
}

impl MemoryPort {
    /// Create two connected endpoints (`host`, `device`).
    pub fn pair() -> (Self, Self) {
        let a: Wire = Arc::default();
        let b: Wire = Arc::default();
        let host = Self {
            name: "memory:host".into(),
            rx: Arc::clone(&a),
            tx: Arc::clone(&b),
        };
        let device = Self {
            name: "memory:device".into(),
            rx: b,
            tx: a,
        };
        (host, device)
    }

    /// Number of bytes waiting to be read on this end.
    pub fn pending(&self) -> usize {
        lock(&self.rx).len()
    }
}

fn lock(wire: &Wire) -> MutexGuard<'_, VecDeque<u8>> {
    // A panicking peer thread must not wedge the other end.
    wire.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Read for MemoryPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = lock(&self.rx);
        if rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(rx.len());
        for (dst, src) in buf.iter_mut().zip(rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemoryPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.tx).extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear_buffers(&mut self) -> Result<()> {
        lock(&self.rx).clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::ReadPolicy;
    use std::time::Duration;

    #[test]
    fn test_pair_is_crossed() {
        let (mut host, mut device) = MemoryPort::pair();
        host.write_bytes(b"ping").unwrap();
        device.write_bytes(b"pong").unwrap();

        let policy = ReadPolicy::with_timeout(Duration::from_millis(10));
        let mut buf = [0u8; 4];
        device.read_bytes(&mut buf, &policy).unwrap();
        assert_eq!(&buf, b"ping");
        host.read_bytes(&mut buf, &policy).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_clear_buffers_drops_pending_input() {
        let (mut host, mut device) = MemoryPort::pair();
        device.write_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(host.pending(), 3);
        host.clear_buffers().unwrap();
        assert_eq!(host.pending(), 0);
    }

    #[test]
    fn test_empty_read_reports_timed_out() {
        let (mut host, _device) = MemoryPort::pair();
        let mut buf = [0u8; 1];
        let err = host.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
