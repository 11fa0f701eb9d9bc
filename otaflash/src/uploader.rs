//! Host-side OTA upload driver.
//!
//! Stop-and-wait: every frame is answered by one Response before the next is
//! sent.
//!
//! ```text
//! host                              bootloader
//!  | -- Command(Start) -----------------> |
//!  | <--------------------------- ACK --- |
//!  | -- Header(size, crc) --------------> |
//!  | <--------------------------- ACK --- |
//!  | -- Data(chunk 0) ------------------> |   erase, program
//!  | <--------------------------- ACK --- |
//!  |    ...                               |
//!  | -- Command(End) -------------------> |   verify CRC
//!  | <--------------------------- ACK --- |
//! ```
//!
//! A NACK, a timeout or any other reply ends the upload; there is no retry.
//! Failures carry the [`Phase`] they happened in.

use std::thread;
use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, Phase, Result};
use crate::image::FirmwareImage;
use crate::port::{Port, ReadPolicy};
use crate::protocol::{Command, Frame, FrameReader, ProtocolLimits, Status, write_frame};

/// Upload settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConfig {
    /// Frame and image size limits.
    pub limits: ProtocolLimits,
    /// Deadline for each response.
    pub response: ReadPolicy,
    /// Pause before each byte written.
    pub inter_byte_delay: Duration,
    /// Pause after the header and after every acknowledged Data frame.
    pub inter_frame_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            limits: ProtocolLimits::default(),
            response: ReadPolicy::default(),
            inter_byte_delay: Duration::from_micros(10),
            inter_frame_delay: Duration::from_millis(3),
        }
    }
}

/// Sends a firmware image to a bootloader.
///
/// Generic over the port type `P`, like the rest of the host side.
pub struct Uploader<P: Port> {
    port: P,
    config: UploadConfig,
    reader: FrameReader,
}

impl<P: Port> Uploader<P> {
    /// Create an uploader with default settings.
    pub fn new(port: P) -> Self {
        Self::with_config(port, UploadConfig::default())
    }

    /// Create an uploader with custom settings.
    pub fn with_config(port: P, config: UploadConfig) -> Self {
        Self {
            port,
            config,
            reader: FrameReader::new(),
        }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the uploader and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Upload `image`.
    ///
    /// `progress(sent, total)` is called after every acknowledged chunk.
    pub fn upload<F>(&mut self, image: &FirmwareImage, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let limits = self.config.limits;
        limits.validate()?;
        if image.len() > limits.max_firmware_size as usize {
            return Err(Error::Image(format!(
                "image is {} bytes, limit is {}",
                image.len(),
                limits.max_firmware_size
            )));
        }

        info!(
            "Sending {} byte image (CRC {:#010x}) to {}",
            image.len(),
            image.crc(),
            self.port.name()
        );
        self.port.clear_buffers()?;

        self.exchange(&Frame::Command(Command::Start))
            .map_err(|e| e.in_phase(Phase::Start))?;
        info!("OTA START acknowledged");

        self.exchange(&Frame::Header(image.metadata()))
            .map_err(|e| e.in_phase(Phase::Header))?;
        self.pause();

        let total = image.len();
        for (offset, chunk) in image.chunks(limits.data_max_size) {
            self.exchange(&Frame::Data(chunk.to_vec()))
                .map_err(|e| e.in_phase(Phase::Data { offset }))?;

            let sent = offset as usize + chunk.len();
            debug!("[{sent}/{total}]");
            progress(sent, total);
            self.pause();
        }

        self.exchange(&Frame::Command(Command::End))
            .map_err(|e| e.in_phase(Phase::End))?;
        info!("OTA END acknowledged");
        Ok(())
    }

    /// Send one frame and wait for an ACK.
    fn exchange(&mut self, frame: &Frame) -> Result<()> {
        if crate::is_interrupted_requested() {
            return Err(Error::Interrupted);
        }

        write_frame(&mut self.port, frame, self.config.inter_byte_delay)?;
        match self.reader.read(&mut self.port, &self.config.response)? {
            Frame::Response(Status::Ack) => Ok(()),
            Frame::Response(Status::Nack) => Err(Error::Nack),
            other => Err(Error::UnexpectedResponse(other.packet_type())),
        }
    }

    fn pause(&self) {
        if !self.config.inter_frame_delay.is_zero() {
            thread::sleep(self.config.inter_frame_delay);
        }
    }
}
