//! Firmware image loading.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::crc::crc32;
use crate::protocol::{ProtocolLimits, TransferMetadata};

/// An application image held in memory, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    crc: u32,
}

impl FirmwareImage {
    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P, limits: &ProtocolLimits) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading image from: {}", path.display());

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        Self::from_bytes(data, limits)
    }

    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>, limits: &ProtocolLimits) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Image("image is empty".into()));
        }
        let too_big = || {
            Error::Image(format!(
                "image is {} bytes, limit is {}",
                data.len(),
                limits.max_firmware_size
            ))
        };
        let size = u32::try_from(data.len()).map_err(|_| too_big())?;
        if size > limits.max_firmware_size {
            return Err(too_big());
        }

        let crc = crc32(&data);
        debug!("Image: {size} bytes, CRC {crc:#010x}");
        Ok(Self { data, crc })
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; empty images are rejected on load.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// CRC-32 of the whole image.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Header payload announcing this image.
    #[allow(clippy::cast_possible_truncation)] // size checked against a u32 limit on load
    pub fn metadata(&self) -> TransferMetadata {
        TransferMetadata {
            total_size: self.data.len() as u32,
            total_crc: self.crc,
        }
    }

    /// Consecutive chunks of at most `size` bytes, with their byte offsets.
    #[allow(clippy::cast_possible_truncation)]
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = (u32, &[u8])> {
        self.data
            .chunks(size)
            .enumerate()
            .map(move |(i, chunk)| ((i * size) as u32, chunk))
    }
}
