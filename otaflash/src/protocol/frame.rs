//! OTA frame codec.
//!
//! Every message between host and bootloader, in both directions, uses the
//! same frame layout:
//!
//! ```text
//! +------+------+--------+---------------+----------+------+
//! | SOF  | Type | Length |    Payload    |  CRC32   | EOF  |
//! +------+------+--------+---------------+----------+------+
//! | 1    | 1    | 2 (LE) | Length bytes  |  4 (LE)  | 1    |
//! +------+------+--------+---------------+----------+------+
//! | 0xAA | type |  len   |   payload     |   CRC    | 0xBB |
//! +------+------+--------+---------------+----------+------+
//! ```
//!
//! The CRC-32 covers `Type‖Length‖Payload`. Payloads by type:
//!
//! - Command: 1 byte opcode (Start, End, Abort)
//! - Header: `total_size` (u32 LE) followed by `total_crc` (u32 LE)
//! - Data: 1..=[`DATA_MAX_SIZE`] raw firmware bytes
//! - Response: 1 byte status (Ack, Nack)

use std::fmt;
use std::time::Instant;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;

use crate::error::{FrameError, TransportError};
use crate::port::{Port, ReadPolicy, read_until};
use crate::protocol::crc::crc32;

/// Start-of-frame sentinel.
pub const SOF: u8 = 0xAA;

/// End-of-frame sentinel.
pub const EOF: u8 = 0xBB;

/// Largest payload a single frame may carry.
pub const DATA_MAX_SIZE: usize = 1024;

/// Bytes of framing around the payload: SOF, type, length, CRC and EOF.
pub const FRAME_OVERHEAD: usize = 9;

/// Largest complete frame on the wire.
pub const PACKET_MAX_SIZE: usize = DATA_MAX_SIZE + FRAME_OVERHEAD;

/// Size of the Header payload.
pub const HEADER_PAYLOAD_SIZE: usize = 8;

/// Frame type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Control command from the host.
    Command = 0x00,
    /// Firmware chunk.
    Data = 0x01,
    /// Transfer metadata.
    Header = 0x02,
    /// ACK/NACK from the bootloader.
    Response = 0x03,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Command),
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Header),
            0x03 => Ok(Self::Response),
            other => Err(other),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "command",
            Self::Data => "data",
            Self::Header => "header",
            Self::Response => "response",
        };
        f.write_str(name)
    }
}

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Open a transfer session.
    Start = 0x00,
    /// Finish the transfer and verify the image.
    End = 0x01,
    /// Cancel the session.
    Abort = 0x02,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Start),
            0x01 => Ok(Self::End),
            0x02 => Ok(Self::Abort),
            other => Err(other),
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Frame accepted.
    Ack = 0x00,
    /// Frame rejected.
    Nack = 0x01,
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Ack),
            0x01 => Ok(Self::Nack),
            other => Err(other),
        }
    }
}

/// Header payload describing the image about to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransferMetadata {
    /// Firmware size in bytes.
    pub total_size: u32,
    /// CRC-32 of the whole image.
    pub total_crc: u32,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Control command.
    Command(Command),
    /// Transfer metadata.
    Header(TransferMetadata),
    /// Firmware chunk.
    Data(Vec<u8>),
    /// ACK/NACK.
    Response(Status),
}

impl Frame {
    /// Shorthand for an ACK frame.
    pub fn ack() -> Self {
        Self::Response(Status::Ack)
    }

    /// Shorthand for a NACK frame.
    pub fn nack() -> Self {
        Self::Response(Status::Nack)
    }

    /// Type field of this frame.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Command(_) => PacketType::Command,
            Self::Header(_) => PacketType::Header,
            Self::Data(_) => PacketType::Data,
            Self::Response(_) => PacketType::Response,
        }
    }

    /// Length of the type-specific payload.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Command(_) | Self::Response(_) => 1,
            Self::Header(_) => HEADER_PAYLOAD_SIZE,
            Self::Data(data) => data.len(),
        }
    }

    /// Serialize into wire bytes.
    ///
    /// Data frames must not exceed [`DATA_MAX_SIZE`]; chunking is the
    /// caller's job.
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload_len();
        debug_assert!(len <= DATA_MAX_SIZE, "payload of {len} bytes exceeds frame limit");

        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + len);
        buf.push(SOF);
        buf.push(self.packet_type() as u8);
        buf.write_u16::<LittleEndian>(len as u16).unwrap();

        match self {
            Self::Command(cmd) => buf.push(*cmd as u8),
            Self::Header(meta) => {
                buf.write_u32::<LittleEndian>(meta.total_size).unwrap();
                buf.write_u32::<LittleEndian>(meta.total_crc).unwrap();
            },
            Self::Data(data) => buf.extend_from_slice(data),
            Self::Response(status) => buf.push(*status as u8),
        }

        // CRC over type, length and payload (everything after SOF)
        let crc = crc32(&buf[1..]);
        buf.write_u32::<LittleEndian>(crc).unwrap();
        buf.push(EOF);

        buf
    }
}

/// Decode exactly one frame from `bytes`.
///
/// The slice must contain the whole frame and nothing else.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FrameError::Malformed("frame shorter than framing overhead"));
    }
    if bytes[0] != SOF {
        return Err(FrameError::Malformed("bad start-of-frame"));
    }

    let len = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
    if len > DATA_MAX_SIZE {
        return Err(FrameError::Malformed("payload length exceeds maximum"));
    }
    if bytes.len() != len + FRAME_OVERHEAD {
        return Err(FrameError::Malformed("length field disagrees with frame size"));
    }
    if bytes[bytes.len() - 1] != EOF {
        return Err(FrameError::Malformed("bad end-of-frame"));
    }

    let crc_at = 4 + len;
    let expected = u32::from_le_bytes([
        bytes[crc_at],
        bytes[crc_at + 1],
        bytes[crc_at + 2],
        bytes[crc_at + 3],
    ]);
    let actual = crc32(&bytes[1..crc_at]);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let packet_type =
        PacketType::try_from(bytes[1]).map_err(|_| FrameError::Malformed("unknown packet type"))?;
    let payload = &bytes[4..crc_at];

    match packet_type {
        PacketType::Command => match payload {
            [op] => Command::try_from(*op)
                .map(Frame::Command)
                .map_err(|_| FrameError::Malformed("unknown command opcode")),
            _ => Err(FrameError::Malformed("command payload must be one byte")),
        },
        PacketType::Header => {
            if payload.len() != HEADER_PAYLOAD_SIZE {
                return Err(FrameError::Malformed("header payload must be eight bytes"));
            }
            let mut rd = payload;
            let bad = |_| FrameError::Malformed("truncated header payload");
            let total_size = rd.read_u32::<LittleEndian>().map_err(bad)?;
            let total_crc = rd.read_u32::<LittleEndian>().map_err(bad)?;
            Ok(Frame::Header(TransferMetadata {
                total_size,
                total_crc,
            }))
        },
        PacketType::Data => {
            if payload.is_empty() {
                return Err(FrameError::Malformed("empty data payload"));
            }
            Ok(Frame::Data(payload.to_vec()))
        },
        PacketType::Response => match payload {
            [status] => Status::try_from(*status)
                .map(Frame::Response)
                .map_err(|_| FrameError::Malformed("unknown response status")),
            _ => Err(FrameError::Malformed("response payload must be one byte")),
        },
    }
}

/// Reads frames off a port into an owned, frame-sized buffer.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    /// Create a reader with room for one maximum-size frame.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(PACKET_MAX_SIZE),
        }
    }

    /// Read one frame, or `None` if the line stayed silent until the deadline.
    ///
    /// Bytes before the start-of-frame sentinel are discarded. Once anything
    /// has been received, an expired deadline is [`FrameError::Timeout`].
    pub fn poll<P: Port + ?Sized>(
        &mut self,
        port: &mut P,
        policy: &ReadPolicy,
    ) -> Result<Option<Frame>, FrameError> {
        let deadline = Instant::now() + policy.timeout;
        self.buf.clear();

        let mut byte = [0u8; 1];
        let mut skipped = 0usize;
        loop {
            match read_until(port, &mut byte, deadline, policy.poll_interval) {
                Ok(()) => {},
                Err(TransportError::Timeout) if skipped == 0 => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            if byte[0] == SOF {
                break;
            }
            skipped += 1;
            if skipped > PACKET_MAX_SIZE {
                return Err(FrameError::Malformed("no start-of-frame in received bytes"));
            }
        }
        if skipped > 0 {
            trace!("Discarded {skipped} bytes before start-of-frame");
        }
        self.buf.push(SOF);

        let mut head = [0u8; 3];
        read_until(port, &mut head, deadline, policy.poll_interval)?;
        self.buf.extend_from_slice(&head);

        let len = usize::from(u16::from_le_bytes([head[1], head[2]]));
        if len > DATA_MAX_SIZE {
            return Err(FrameError::Malformed("payload length exceeds maximum"));
        }

        // payload + CRC + EOF
        let start = self.buf.len();
        self.buf.resize(start + len + 5, 0);
        read_until(port, &mut self.buf[start..], deadline, policy.poll_interval)?;

        trace!("Received frame: {:02X?}", self.buf);
        decode(&self.buf).map(Some)
    }

    /// Read one frame; silence until the deadline is [`FrameError::Timeout`].
    pub fn read<P: Port + ?Sized>(
        &mut self,
        port: &mut P,
        policy: &ReadPolicy,
    ) -> Result<Frame, FrameError> {
        self.poll(port, policy)?.ok_or(FrameError::Timeout)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one frame with a fresh [`FrameReader`].
pub fn read_frame<P: Port + ?Sized>(
    port: &mut P,
    policy: &ReadPolicy,
) -> Result<Frame, FrameError> {
    FrameReader::new().read(port, policy)
}

/// Like [`read_frame`], but a silent line is `Ok(None)`.
pub fn poll_frame<P: Port + ?Sized>(
    port: &mut P,
    policy: &ReadPolicy,
) -> Result<Option<Frame>, FrameError> {
    FrameReader::new().poll(port, policy)
}

/// Encode `frame` and write it out, pacing bytes by `inter_byte_delay`.
pub fn write_frame<P: Port + ?Sized>(
    port: &mut P,
    frame: &Frame,
    inter_byte_delay: std::time::Duration,
) -> Result<(), TransportError> {
    let bytes = frame.encode();
    trace!("Sending frame: {bytes:02X?}");

    if inter_byte_delay.is_zero() {
        return port.write_bytes(&bytes);
    }
    for byte in bytes.chunks(1) {
        std::thread::sleep(inter_byte_delay);
        port.write_bytes(byte)?;
    }
    Ok(())
}
