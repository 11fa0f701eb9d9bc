//! CRC-32 used for frame checksums and whole-image verification.
//!
//! This is the common ISO-HDLC variant (zlib, PNG, Ethernet): reflected
//! polynomial `0x04C11DB7`, init and xorout `0xFFFFFFFF`.

use crc::{CRC_32_ISO_HDLC, Crc, Digest};

/// Shared CRC-32 engine.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

static ENGINE: Crc<u32> = CRC32;

/// Compute the CRC-32 of `data` in one go.
pub fn crc32(data: &[u8]) -> u32 {
    ENGINE.checksum(data)
}

/// Incremental CRC-32 for data that arrives in pieces.
pub struct Crc32 {
    digest: Digest<'static, u32>,
}

impl Crc32 {
    /// Start a new checksum.
    pub fn new() -> Self {
        Self {
            digest: ENGINE.digest(),
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Finish and return the checksum.
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}
