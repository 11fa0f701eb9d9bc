//! # otaflash
//!
//! Over-the-air firmware updates for microcontrollers over a serial line.
//!
//! A host sends an application image to a bootloader with a small framed,
//! stop-and-wait protocol:
//!
//! - CRC-32 protected frames (`Command`, `Header`, `Data`, `Response`)
//! - A device-side transfer state machine that erases the application region
//!   once, programs chunks sequentially and verifies the whole image
//! - A host-side upload driver that reports the phase a transfer failed in
//! - Timeout-bounded reads everywhere; no call blocks forever
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use otaflash::{FirmwareImage, NativePort, ProtocolLimits, SerialConfig, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("app.bin", &ProtocolLimits::default())?;
//!
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115200))?;
//!     let mut uploader = Uploader::new(port);
//!     uploader.upload(&image, |sent, total| {
//!         println!("{sent}/{total}");
//!     })?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod bootloader;
pub mod error;
pub mod host;
pub mod image;
pub mod port;
pub mod protocol;
pub mod uploader;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    bootloader::{
        Bootloader, BootloaderConfig, FlashMemory, FlashRegion, MemoryFlash, SessionOutcome,
        State,
    },
    error::{Error, Phase, Result},
    host::{KNOWN_PORTS, port_path},
    image::FirmwareImage,
    port::{MemoryPort, Port, PortInfo, ReadPolicy, SerialConfig},
    protocol::{Command, Frame, ProtocolLimits, Status, TransferMetadata},
    uploader::{UploadConfig, Uploader},
};
