//! Error types for otaflash.

use std::{fmt, io};
use thiserror::Error;

use crate::bootloader::State;
use crate::protocol::frame::PacketType;

/// Result type for otaflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Link-layer failure while moving bytes over the serial line.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The read deadline expired before the requested bytes arrived.
    #[error("read timed out")]
    Timeout,

    /// The port accepted zero bytes or has been closed.
    #[error("port closed")]
    Closed,
}

/// A frame could not be taken off the wire.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Bad sentinel, packet type, length or payload layout.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The transmitted CRC-32 disagrees with the recomputed one.
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// The frame did not arrive completely before the read deadline.
    #[error("timed out waiting for frame")]
    Timeout,

    /// The port failed while reading.
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for FrameError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            other => Self::Transport(other),
        }
    }
}

/// Errors raised by the flash collaborator.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Access outside the flash device or the application region.
    #[error("flash access out of bounds: {addr:#010x}+{len}")]
    OutOfBounds {
        /// Start address of the access.
        addr: u32,
        /// Length of the access in bytes.
        len: usize,
    },

    /// Programming a location that still holds data from before the erase.
    #[error("flash not erased at {addr:#010x}")]
    NotErased {
        /// Offending address.
        addr: u32,
    },

    /// Driver-level failure reported by the hardware.
    #[error("flash device error: {0}")]
    Device(String),
}

/// A valid frame that the bootloader refuses in its current state.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame kind is not accepted in the current state.
    #[error("unexpected {packet} frame in state {state}")]
    UnexpectedFrameForState {
        /// State the machine was in.
        state: State,
        /// Kind of the rejected frame.
        packet: PacketType,
    },

    /// The host cancelled the session.
    #[error("transfer aborted by host")]
    Abort,

    /// A Data payload longer than the configured chunk limit.
    #[error("chunk of {len} bytes exceeds the {max} byte limit")]
    ChunkTooLarge {
        /// Payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A Data payload that would run past the announced image size.
    #[error("chunk of {len} bytes overflows image ({received}/{total} received)")]
    ChunkOverflow {
        /// Payload length.
        len: usize,
        /// Bytes received so far.
        received: u32,
        /// Announced image size.
        total: u32,
    },

    /// The header announces an empty image or one that does not fit.
    #[error("invalid image size {size} (limit {limit})")]
    InvalidImageSize {
        /// Announced size.
        size: u32,
        /// Largest acceptable size.
        limit: u32,
    },

    /// The programmed image does not match the CRC from the header.
    #[error("image CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ImageCrcMismatch {
        /// CRC announced in the header.
        expected: u32,
        /// CRC of the programmed region.
        actual: u32,
    },

    /// Flash erase, program or read-back failed.
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),
}

/// Step of the host-side upload sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `Command::Start`.
    Start,
    /// The transfer header.
    Header,
    /// The Data frame starting at `offset` into the image.
    Data {
        /// Byte offset of the chunk.
        offset: u32,
    },
    /// `Command::End`.
    End,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Header => f.write_str("header"),
            Self::Data { offset } => write!(f, "data at offset {offset}"),
            Self::End => f.write_str("end"),
        }
    }
}

/// Error type for otaflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Link-layer error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Framing error.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Protocol state error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Flash driver error.
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    /// Invalid firmware image.
    #[error("Invalid image: {0}")]
    Image(String),

    /// The device answered with a NACK.
    #[error("device answered NACK")]
    Nack,

    /// The device answered with something other than a response frame.
    #[error("unexpected {0} frame in reply")]
    UnexpectedResponse(PacketType),

    /// The embedding application requested a stop.
    #[error("interrupted")]
    Interrupted,

    /// A host upload failed during `phase`.
    #[error("{phase} failed")]
    Transfer {
        /// Phase that failed.
        phase: Phase,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Tag this error with the upload phase in which it happened.
    #[must_use]
    pub fn in_phase(self, phase: Phase) -> Self {
        Self::Transfer {
            phase,
            source: Box::new(self),
        }
    }

    /// The underlying error with any phase tags removed.
    pub fn root(&self) -> &Self {
        match self {
            Self::Transfer { source, .. } => source.root(),
            other => other,
        }
    }

    /// Phase of a failed upload, if this error carries one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Transfer { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
