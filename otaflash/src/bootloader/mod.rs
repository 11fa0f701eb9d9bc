//! Device side of the OTA transfer.
//!
//! [`Bootloader`] ties a [`Port`] to the [`TransferStateMachine`]: it takes
//! one frame off the line, applies it, and answers with exactly one Response
//! frame. The flash driver is reached through [`FlashMemory`].

pub mod flash;
pub mod machine;

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result, TransportError};
use crate::port::{Port, ReadPolicy, drain_until_quiet};
use crate::protocol::{Frame, FrameReader, ProtocolLimits, Status, write_frame};

pub use flash::{APP_FLASH_BASE, APP_FLASH_SIZE, FlashMemory, FlashRegion, FlashWriter, MemoryFlash};
pub use machine::{Event, State, TransferSession, TransferStateMachine};

/// Bootloader settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderConfig {
    /// Frame and image size limits.
    pub limits: ProtocolLimits,
    /// Deadline for each incoming frame.
    pub read: ReadPolicy,
    /// Region the image is written into.
    pub region: FlashRegion,
    /// Give up [`Bootloader::serve`] after this many consecutive silent polls.
    /// An open session is dropped when this happens.
    pub max_idle_polls: Option<u32>,
    /// After a broken frame, input is discarded until the line has been
    /// quiet this long.
    pub resync_quiet: Duration,
}

impl Default for BootloaderConfig {
    fn default() -> Self {
        Self {
            limits: ProtocolLimits::default(),
            read: ReadPolicy::with_timeout(Duration::from_secs(5)),
            region: FlashRegion::APPLICATION,
            max_idle_polls: None,
            resync_quiet: Duration::from_millis(10),
        }
    }
}

/// One frame in, one response out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    /// Status sent back to the host.
    pub status: Status,
    /// What the accepted frame did; `None` when the frame was rejected.
    pub event: Option<Event>,
}

/// How [`Bootloader::serve`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The image was received and verified.
    Completed {
        /// Image size in bytes.
        size: u32,
        /// Image CRC-32.
        crc: u32,
    },
    /// The host sent `Command::Abort`.
    Aborted,
}

/// Bootloader receive loop.
#[derive(Debug)]
pub struct Bootloader<F> {
    machine: TransferStateMachine<F>,
    reader: FrameReader,
    read: ReadPolicy,
    max_idle_polls: Option<u32>,
    resync_quiet: Duration,
}

impl<F: FlashMemory> Bootloader<F> {
    /// Create a bootloader writing to `flash`.
    pub fn new(flash: F, config: BootloaderConfig) -> Result<Self> {
        config.limits.validate()?;
        if config.region.size == 0 {
            return Err(Error::Config("flash region must be non-empty".into()));
        }

        Ok(Self {
            machine: TransferStateMachine::new(FlashWriter::new(flash, config.region), config.limits),
            reader: FrameReader::new(),
            read: config.read,
            max_idle_polls: config.max_idle_polls,
            resync_quiet: config.resync_quiet,
        })
    }

    /// The transfer state machine.
    pub fn machine(&self) -> &TransferStateMachine<F> {
        &self.machine
    }

    /// Consume the bootloader and return the flash driver.
    pub fn into_flash(self) -> F {
        self.machine.into_writer().into_inner()
    }

    /// Handle at most one frame.
    ///
    /// Returns `None` if the line stayed silent; nothing is sent in that case.
    /// Otherwise exactly one Response frame has been written. A broken frame
    /// is answered once, after the rest of it has been discarded.
    pub fn poll<P: Port + ?Sized>(&mut self, port: &mut P) -> Result<Option<Exchange>> {
        let exchange = match self.reader.poll(port, &self.read) {
            Ok(Some(frame)) => {
                let result = self.machine.handle(&frame);
                if let Err(err) = &result {
                    warn!("Rejected {} frame: {err}", frame.packet_type());
                }
                Exchange {
                    status: TransferStateMachine::<F>::respond(&result),
                    event: result.ok(),
                }
            },
            Ok(None) => return Ok(None),
            Err(err) => {
                let deadline = Instant::now() + self.read.timeout;
                let dropped =
                    drain_until_quiet(port, self.resync_quiet, deadline, self.read.poll_interval)?;
                if dropped > 0 {
                    debug!("Discarded {dropped} bytes after broken frame");
                }
                Exchange {
                    status: self.machine.reject(&err),
                    event: None,
                }
            },
        };

        debug!("Responding {:?} in state {}", exchange.status, self.machine.state());
        write_frame(port, &Frame::Response(exchange.status), Duration::ZERO)?;
        Ok(Some(exchange))
    }

    /// Serve frames until a session completes or is aborted.
    ///
    /// A machine left in [`State::Aborted`] by a previous call is reset first.
    /// Hitting the idle limit drops any open session and fails with
    /// [`TransportError::Timeout`].
    pub fn serve<P: Port + ?Sized>(&mut self, port: &mut P) -> Result<SessionOutcome> {
        if self.machine.state() == State::Aborted {
            self.machine.reset();
        }
        info!("Waiting for OTA session on {}", port.name());

        let mut idle = 0u32;
        loop {
            if crate::is_interrupted_requested() {
                return Err(Error::Interrupted);
            }

            let Some(exchange) = self.poll(port)? else {
                idle += 1;
                if self.max_idle_polls.is_some_and(|max| idle >= max) {
                    if self.machine.state() != State::Idle {
                        let state = self.machine.state();
                        warn!("Host went silent in state {state}, dropping session");
                        self.machine.reset();
                    }
                    return Err(TransportError::Timeout.into());
                }
                continue;
            };
            idle = 0;

            if let Some(Event::SessionCompleted { size, crc }) = exchange.event {
                info!("OTA session complete: {size} bytes, CRC {crc:#010x}");
                return Ok(SessionOutcome::Completed { size, crc });
            }
            if self.machine.state() == State::Aborted {
                return Ok(SessionOutcome::Aborted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MemoryPort;
    use crate::protocol::crc::crc32;
    use crate::protocol::{Command, TransferMetadata};

    const BASE: u32 = 0x4000;

    fn config() -> BootloaderConfig {
        BootloaderConfig {
            limits: ProtocolLimits {
                data_max_size: 4,
                ..ProtocolLimits::default()
            },
            read: ReadPolicy::with_timeout(Duration::from_millis(30)),
            region: FlashRegion {
                base: BASE,
                size: 64,
            },
            max_idle_polls: Some(3),
            resync_quiet: Duration::from_millis(5),
        }
    }

    fn bootloader() -> Bootloader<MemoryFlash> {
        let cfg = config();
        Bootloader::new(MemoryFlash::for_region(cfg.region), cfg).unwrap()
    }

    fn send(port: &mut MemoryPort, frame: &Frame) {
        write_frame(port, frame, Duration::ZERO).unwrap();
    }

    fn responses(port: &mut MemoryPort) -> Vec<Frame> {
        let mut reader = FrameReader::new();
        let policy = ReadPolicy::with_timeout(Duration::from_millis(5));
        std::iter::from_fn(|| reader.poll(port, &policy).unwrap()).collect()
    }

    #[test]
    fn test_rejects_invalid_limits() {
        let mut cfg = config();
        cfg.limits.data_max_size = 0;
        assert!(Bootloader::new(MemoryFlash::for_region(cfg.region), cfg).is_err());
    }

    #[test]
    fn test_silent_idle_line_sends_nothing() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        assert_eq!(boot.poll(&mut device).unwrap(), None);
        assert_eq!(host.pending(), 0);
        assert!(responses(&mut host).is_empty());
    }

    #[test]
    fn test_every_frame_gets_one_response() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();

        send(&mut host, &Frame::Command(Command::Start));
        let ex = boot.poll(&mut device).unwrap().unwrap();
        assert_eq!(ex.status, Status::Ack);
        assert_eq!(ex.event, Some(Event::SessionOpened));

        // Out of order: data before header
        send(&mut host, &Frame::Data(vec![1, 2]));
        let ex = boot.poll(&mut device).unwrap().unwrap();
        assert_eq!(ex.status, Status::Nack);
        assert_eq!(ex.event, None);

        assert_eq!(responses(&mut host), [Frame::ack(), Frame::nack()]);
        assert_eq!(boot.machine().state(), State::AwaitingHeader);
    }

    #[test]
    fn test_corrupt_frame_is_nacked() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();

        let mut bytes = Frame::Command(Command::Start).encode();
        bytes[4] ^= 0xFF;
        host.write_bytes(&bytes).unwrap();

        let ex = boot.poll(&mut device).unwrap().unwrap();
        assert_eq!(ex.status, Status::Nack);
        assert_eq!(boot.machine().state(), State::Idle);
        assert_eq!(responses(&mut host), [Frame::nack()]);
    }

    #[test]
    fn test_silence_mid_session_sends_nothing() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        send(&mut host, &Frame::Command(Command::Start));
        boot.poll(&mut device).unwrap();

        assert_eq!(boot.poll(&mut device).unwrap(), None);
        assert_eq!(boot.machine().state(), State::AwaitingHeader);
        assert_eq!(responses(&mut host), [Frame::ack()]);
    }

    #[test]
    fn test_partial_frame_mid_session_is_nacked_once() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        send(&mut host, &Frame::Command(Command::Start));
        boot.poll(&mut device).unwrap();

        let bytes = Frame::Data(vec![1, 2, 3]).encode();
        host.write_bytes(&bytes[..6]).unwrap();
        let ex = boot.poll(&mut device).unwrap().unwrap();
        assert_eq!(ex.status, Status::Nack);
        assert_eq!(boot.poll(&mut device).unwrap(), None);
        assert_eq!(responses(&mut host), [Frame::ack(), Frame::nack()]);
    }

    #[test]
    fn test_bad_length_frame_gets_one_response() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        send(&mut host, &Frame::Command(Command::Start));
        boot.poll(&mut device).unwrap();

        // Declared length above the limit; the payload is full of SOF bytes
        let mut bytes = Frame::Data(vec![0xAA; 1000]).encode();
        bytes[3] |= 0x08;
        host.write_bytes(&bytes).unwrap();

        let mut exchanges = Vec::new();
        while let Some(ex) = boot.poll(&mut device).unwrap() {
            exchanges.push(ex);
        }
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].status, Status::Nack);
        assert_eq!(device.pending(), 0);
        assert_eq!(responses(&mut host), [Frame::ack(), Frame::nack()]);

        // Back in step: the next frame is handled normally
        let meta = TransferMetadata {
            total_size: 4,
            total_crc: crc32(&[1, 2, 3, 4]),
        };
        send(&mut host, &Frame::Header(meta));
        let ex = boot.poll(&mut device).unwrap().unwrap();
        assert_eq!(ex.event, Some(Event::HeaderAccepted(meta)));
        assert_eq!(responses(&mut host), [Frame::ack()]);
    }

    #[test]
    fn test_serve_completes_session() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        let image = *b"0123456789";

        send(&mut host, &Frame::Command(Command::Start));
        send(
            &mut host,
            &Frame::Header(TransferMetadata {
                total_size: 10,
                total_crc: crc32(&image),
            }),
        );
        for chunk in image.chunks(4) {
            send(&mut host, &Frame::Data(chunk.to_vec()));
        }
        send(&mut host, &Frame::Command(Command::End));

        let outcome = boot.serve(&mut device).unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Completed {
                size: 10,
                crc: crc32(&image)
            }
        );
        assert_eq!(responses(&mut host), vec![Frame::ack(); 6]);

        let flash = boot.into_flash();
        assert_eq!(flash.slice(BASE, 10).unwrap(), &image);
        assert_eq!(flash.erase_count(), 1);
    }

    #[test]
    fn test_serve_reports_abort() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        send(&mut host, &Frame::Command(Command::Start));
        send(&mut host, &Frame::Command(Command::Abort));

        assert_eq!(boot.serve(&mut device).unwrap(), SessionOutcome::Aborted);
        assert_eq!(responses(&mut host), [Frame::ack(), Frame::nack()]);
        assert_eq!(boot.machine().state(), State::Aborted);
    }

    #[test]
    fn test_serve_drops_session_when_host_goes_silent() {
        let (mut host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        send(&mut host, &Frame::Command(Command::Start));

        let err = boot.serve(&mut device).unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Timeout)));
        assert_eq!(responses(&mut host), [Frame::ack()]);
        assert_eq!(boot.machine().state(), State::Idle);
    }

    #[test]
    fn test_serve_gives_up_after_idle_limit() {
        let (_host, mut device) = MemoryPort::pair();
        let mut boot = bootloader();
        let err = boot.serve(&mut device).unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Timeout)));
    }
}
