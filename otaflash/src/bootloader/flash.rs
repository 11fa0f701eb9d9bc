//! Flash sink for the bootloader.
//!
//! The register-level driver is reached only through [`FlashMemory`].
//! [`FlashWriter`] binds a driver to the application region and applies the
//! sequencing the transfer needs: one erase of the whole region, then
//! strictly sequential programming at `base + cursor`. The writer keeps no
//! progress of its own; the cursor always comes from the session.

use std::ops::Range;

use log::{debug, info};

use crate::error::FlashError;
use crate::protocol::crc::Crc32;

/// Start of the application region (sector 5 on the reference board).
pub const APP_FLASH_BASE: u32 = 0x0802_0000;

/// Size of the application region (two 128 KiB sectors).
pub const APP_FLASH_SIZE: u32 = 256 * 1024;

/// Block size used when reading the image back for verification.
const READBACK_BLOCK: usize = 256;

/// Flash driver operations consumed by the bootloader.
pub trait FlashMemory {
    /// Erase every byte in `range` (absolute addresses).
    fn erase_region(&mut self, range: Range<u32>) -> Result<(), FlashError>;

    /// Program `data` starting at absolute address `addr`.
    fn program_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read back `buf.len()` bytes starting at `addr`.
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;
}

impl<F: FlashMemory + ?Sized> FlashMemory for &mut F {
    fn erase_region(&mut self, range: Range<u32>) -> Result<(), FlashError> {
        (**self).erase_region(range)
    }

    fn program_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program_bytes(addr, data)
    }

    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read_bytes(addr, buf)
    }
}

/// Address window the firmware image is written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// First address of the region.
    pub base: u32,
    /// Region size in bytes.
    pub size: u32,
}

impl FlashRegion {
    /// The application region.
    pub const APPLICATION: Self = Self {
        base: APP_FLASH_BASE,
        size: APP_FLASH_SIZE,
    };

    /// Absolute address range covered by the region.
    pub fn range(&self) -> Range<u32> {
        self.base..self.base.saturating_add(self.size)
    }
}

impl Default for FlashRegion {
    fn default() -> Self {
        Self::APPLICATION
    }
}

/// Erase-once, program-sequentially writer over a [`FlashMemory`].
#[derive(Debug)]
pub struct FlashWriter<F> {
    flash: F,
    region: FlashRegion,
}

impl<F: FlashMemory> FlashWriter<F> {
    /// Bind `flash` to `region`.
    pub fn new(flash: F, region: FlashRegion) -> Self {
        Self { flash, region }
    }

    /// Target region.
    pub fn region(&self) -> FlashRegion {
        self.region
    }

    /// Underlying driver.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Consume the writer and return the driver.
    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Erase the whole target region.
    pub fn erase(&mut self) -> Result<(), FlashError> {
        info!(
            "Erasing flash {:#010x}..{:#010x}",
            self.region.base,
            self.region.range().end
        );
        self.flash.erase_region(self.region.range())
    }

    /// Program `data` at `base + cursor`.
    pub fn program(&mut self, cursor: u32, data: &[u8]) -> Result<(), FlashError> {
        let addr = self.region_addr(cursor, data.len())?;
        debug!("Programming {} bytes at {addr:#010x}", data.len());
        self.flash.program_bytes(addr, data)
    }

    /// CRC-32 of the first `len` bytes of the region, read back from flash.
    pub fn checksum(&mut self, len: u32) -> Result<u32, FlashError> {
        let len = len as usize;
        self.region_addr(0, len)?;

        let mut crc = Crc32::new();
        let mut block = [0u8; READBACK_BLOCK];
        let mut offset = 0usize;
        while offset < len {
            let n = READBACK_BLOCK.min(len - offset);
            #[allow(clippy::cast_possible_truncation)] // offset < region size (u32)
            let addr = self.region.base + offset as u32;
            self.flash.read_bytes(addr, &mut block[..n])?;
            crc.update(&block[..n]);
            offset += n;
        }
        Ok(crc.finalize())
    }

    /// Absolute address of `cursor`, checking `len` bytes fit in the region.
    fn region_addr(&self, cursor: u32, len: usize) -> Result<u32, FlashError> {
        let end = u64::from(cursor) + len as u64;
        if end > u64::from(self.region.size) {
            return Err(FlashError::OutOfBounds {
                addr: self.region.base.wrapping_add(cursor),
                len,
            });
        }
        Ok(self.region.base + cursor)
    }
}

/// In-memory NOR flash.
///
/// Erased bytes read `0xFF`; programming can only clear bits, so writing
/// over data that was not erased first is an error, as on real parts.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    base: u32,
    data: Vec<u8>,
    erase_count: usize,
}

impl MemoryFlash {
    /// Blank (erased) flash of `size` bytes mapped at `base`.
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0xFF; size],
            erase_count: 0,
        }
    }

    /// Flash covering exactly `region`.
    pub fn for_region(region: FlashRegion) -> Self {
        Self::new(region.base, region.size as usize)
    }

    /// Flash mapped at `base` holding stale `contents`.
    pub fn with_data(base: u32, contents: &[u8]) -> Self {
        Self {
            base,
            data: contents.to_vec(),
            erase_count: 0,
        }
    }

    /// `len` bytes starting at absolute address `addr`.
    pub fn slice(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let start = addr.checked_sub(self.base)? as usize;
        self.data.get(start..start.checked_add(len)?)
    }

    /// How many times `erase_region` has succeeded.
    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    fn offset(&self, addr: u32, len: usize) -> Result<usize, FlashError> {
        let oob = || FlashError::OutOfBounds { addr, len };
        let start = addr.checked_sub(self.base).ok_or_else(oob)? as usize;
        let end = start.checked_add(len).ok_or_else(oob)?;
        if end > self.data.len() {
            return Err(oob());
        }
        Ok(start)
    }
}

impl FlashMemory for MemoryFlash {
    fn erase_region(&mut self, range: Range<u32>) -> Result<(), FlashError> {
        let len = range.len();
        let start = self.offset(range.start, len)?;
        self.data[start..start + len].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn program_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let start = self.offset(addr, data.len())?;
        let target = &mut self.data[start..start + data.len()];
        if let Some(pos) = target
            .iter()
            .zip(data)
            .position(|(cur, new)| cur & new != *new)
        {
            #[allow(clippy::cast_possible_truncation)] // pos < data.len() <= region
            return Err(FlashError::NotErased {
                addr: addr + pos as u32,
            });
        }
        for (cur, new) in target.iter_mut().zip(data) {
            *cur &= new;
        }
        Ok(())
    }

    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let start = self.offset(addr, buf.len())?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
}
