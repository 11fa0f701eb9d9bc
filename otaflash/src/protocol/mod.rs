//! Wire protocol shared by host and bootloader.

pub mod crc;
pub mod frame;

// Re-export common types
pub use frame::{
    Command, DATA_MAX_SIZE, Frame, FrameReader, PacketType, Status, TransferMetadata, decode,
    poll_frame, read_frame, write_frame,
};

use crate::error::{Error, Result};

/// Largest firmware image the application region can hold.
pub const MAX_FIRMWARE_SIZE: u32 = 256 * 1024;

/// Size limits both ends must agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolLimits {
    /// Largest Data payload per frame.
    pub data_max_size: usize,
    /// Largest image accepted for one transfer.
    pub max_firmware_size: u32,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            data_max_size: DATA_MAX_SIZE,
            max_firmware_size: MAX_FIRMWARE_SIZE,
        }
    }
}

impl ProtocolLimits {
    /// Check the limits fit inside the frame format.
    pub fn validate(&self) -> Result<()> {
        if self.data_max_size == 0 || self.data_max_size > DATA_MAX_SIZE {
            return Err(Error::Config(format!(
                "chunk size must be within 1..={DATA_MAX_SIZE}, got {}",
                self.data_max_size
            )));
        }
        if self.max_firmware_size == 0 {
            return Err(Error::Config("maximum firmware size must be non-zero".into()));
        }
        Ok(())
    }
}
