//! Device-side transfer state machine.
//!
//! ```text
//!            Start            Header             last Data
//!   Idle ──────────▶ AwaitingHeader ──────▶ ReceivingData ──────────▶ AwaitingEnd
//!    ▲                                        │   ▲                        │
//!    │                                        └───┘ Data                   │
//!    └──────────────────────────── End (image CRC ok) ────────────────────┘
//!
//!   any state except Aborted ── Abort ──▶ Aborted
//! ```
//!
//! Every frame handed to [`TransferStateMachine::handle`] produces exactly one
//! response status. Rejected frames leave the state untouched; only Abort
//! changes state on a NACK.

use std::fmt;

use log::{debug, info, warn};

use crate::bootloader::flash::{FlashMemory, FlashWriter};
use crate::error::{FrameError, ProtocolError};
use crate::protocol::{Command, Frame, ProtocolLimits, Status, TransferMetadata};

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// No session; waiting for `Command::Start`.
    #[default]
    Idle,
    /// Session open; waiting for the header.
    AwaitingHeader,
    /// Receiving Data frames.
    ReceivingData,
    /// Whole image received; waiting for `Command::End`.
    AwaitingEnd,
    /// Session cancelled by the host. Terminal until [`TransferStateMachine::reset`].
    Aborted,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::AwaitingHeader => "AwaitingHeader",
            Self::ReceivingData => "ReceivingData",
            Self::AwaitingEnd => "AwaitingEnd",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Counters for one transfer, from Start until Idle or Abort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSession {
    /// Bytes programmed so far.
    pub received_size: u32,
    /// Image size announced by the header.
    pub total_size: u32,
    /// Image CRC announced by the header.
    pub total_crc: u32,
    /// Whether the region has been erased in this session.
    pub erased: bool,
}

impl TransferSession {
    /// Bytes still expected.
    pub fn remaining(&self) -> u32 {
        self.total_size - self.received_size
    }
}

/// What an accepted frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// `Command::Start` opened a session.
    SessionOpened,
    /// The header was stored.
    HeaderAccepted(TransferMetadata),
    /// A chunk was programmed; more are expected.
    ChunkWritten {
        /// Bytes programmed so far.
        received: u32,
        /// Image size.
        total: u32,
    },
    /// The final chunk was programmed.
    ImageReceived {
        /// Image size.
        total: u32,
    },
    /// `Command::End` verified the image and closed the session.
    SessionCompleted {
        /// Image size.
        size: u32,
        /// Verified image CRC.
        crc: u32,
    },
}

/// The bootloader's transfer state machine.
///
/// Owns the session and the flash writer; nothing else mutates either.
#[derive(Debug)]
pub struct TransferStateMachine<F> {
    state: State,
    session: Option<TransferSession>,
    writer: FlashWriter<F>,
    limits: ProtocolLimits,
}

impl<F: FlashMemory> TransferStateMachine<F> {
    /// Create a machine in [`State::Idle`].
    pub fn new(writer: FlashWriter<F>, limits: ProtocolLimits) -> Self {
        Self {
            state: State::Idle,
            session: None,
            writer,
            limits,
        }
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The open session, if any.
    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    /// The flash writer.
    pub fn writer(&self) -> &FlashWriter<F> {
        &self.writer
    }

    /// Consume the machine and return the flash writer.
    pub fn into_writer(self) -> FlashWriter<F> {
        self.writer
    }

    /// Drop any session and return to [`State::Idle`].
    pub fn reset(&mut self) {
        self.session = None;
        self.state = State::Idle;
    }

    /// Apply one decoded frame.
    pub fn handle(&mut self, frame: &Frame) -> Result<Event, ProtocolError> {
        debug!("State {}: got {} frame", self.state, frame.packet_type());

        match (self.state, frame) {
            (State::Aborted, _) => Err(self.unexpected(frame)),
            (_, Frame::Command(Command::Abort)) => {
                warn!("Transfer aborted in state {}", self.state);
                self.session = None;
                self.state = State::Aborted;
                Err(ProtocolError::Abort)
            },
            (State::Idle, Frame::Command(Command::Start)) => {
                info!("Received OTA START command");
                self.session = Some(TransferSession::default());
                self.state = State::AwaitingHeader;
                Ok(Event::SessionOpened)
            },
            (State::AwaitingHeader, Frame::Header(meta)) => self.accept_header(*meta),
            (State::ReceivingData, Frame::Data(chunk)) => self.accept_chunk(chunk),
            (State::AwaitingEnd, Frame::Command(Command::End)) => self.finish(),
            _ => Err(self.unexpected(frame)),
        }
    }

    /// Account for a frame that could not be decoded. State is unchanged.
    pub fn reject(&self, err: &FrameError) -> Status {
        warn!("Dropping bad frame in state {}: {err}", self.state);
        Status::Nack
    }

    /// Response status for the outcome of [`handle`](Self::handle).
    pub fn respond(result: &Result<Event, ProtocolError>) -> Status {
        match result {
            Ok(_) => Status::Ack,
            Err(_) => Status::Nack,
        }
    }

    fn unexpected(&self, frame: &Frame) -> ProtocolError {
        ProtocolError::UnexpectedFrameForState {
            state: self.state,
            packet: frame.packet_type(),
        }
    }

    fn accept_header(&mut self, meta: TransferMetadata) -> Result<Event, ProtocolError> {
        let limit = self
            .limits
            .max_firmware_size
            .min(self.writer.region().size);
        if meta.total_size == 0 || meta.total_size > limit {
            return Err(ProtocolError::InvalidImageSize {
                size: meta.total_size,
                limit,
            });
        }

        let session = self.session.get_or_insert_with(TransferSession::default);
        session.total_size = meta.total_size;
        session.total_crc = meta.total_crc;
        info!(
            "Received OTA header: {} bytes, CRC {:#010x}",
            meta.total_size, meta.total_crc
        );
        self.state = State::ReceivingData;
        Ok(Event::HeaderAccepted(meta))
    }

    fn accept_chunk(&mut self, chunk: &[u8]) -> Result<Event, ProtocolError> {
        let max = self.limits.data_max_size;
        let len = u32::try_from(chunk.len())
            .ok()
            .filter(|_| chunk.len() <= max)
            .ok_or(ProtocolError::ChunkTooLarge {
                len: chunk.len(),
                max,
            })?;

        let session = self.session.get_or_insert_with(TransferSession::default);
        if len > session.remaining() {
            return Err(ProtocolError::ChunkOverflow {
                len: chunk.len(),
                received: session.received_size,
                total: session.total_size,
            });
        }

        if session.received_size == 0 && !session.erased {
            self.writer.erase()?;
            session.erased = true;
        }
        self.writer.program(session.received_size, chunk)?;
        session.received_size += len;

        debug!("[{}/{}]", session.received_size, session.total_size);
        if session.received_size == session.total_size {
            info!("Received full image ({} bytes)", session.total_size);
            self.state = State::AwaitingEnd;
            Ok(Event::ImageReceived {
                total: session.total_size,
            })
        } else {
            Ok(Event::ChunkWritten {
                received: session.received_size,
                total: session.total_size,
            })
        }
    }

    fn finish(&mut self) -> Result<Event, ProtocolError> {
        let session = self.session.get_or_insert_with(TransferSession::default);
        let (size, expected) = (session.total_size, session.total_crc);

        let actual = self.writer.checksum(size)?;
        if actual != expected {
            return Err(ProtocolError::ImageCrcMismatch { expected, actual });
        }

        info!("Received OTA END command, image verified (CRC {actual:#010x})");
        self.session = None;
        self.state = State::Idle;
        Ok(Event::SessionCompleted {
            size,
            crc: actual,
        })
    }
}
