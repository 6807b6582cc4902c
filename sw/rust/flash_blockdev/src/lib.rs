//! Presents erase-before-write NOR flash as a fixed-block-size storage
//! device. Client reads and writes operate on small blocks; the medium
//! only erases in large, non-uniform sectors and only programs a sector
//! after erasing it. A single-sector write-back cache batches block
//! writes so that many small writes to one sector cost one
//! erase/program cycle.

use flash_core::{FlashControl, HardwareFault, SectorRun};
use thiserror::Error;
use tracing::{debug, trace};

/// Largest sector the cache can hold. Writes landing in bigger
/// sectors are refused with [`DeviceError::SectorTooLarge`].
pub const CACHE_CAPACITY: usize = 0x4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("block {0} is out of range")]
    InvalidBlock(u32),
    #[error("sector of {size} bytes exceeds the {CACHE_CAPACITY}-byte cache")]
    SectorTooLarge { size: u32 },
    #[error("erase of sector {sector} failed")]
    EraseFailed {
        sector: u32,
        #[source]
        source: HardwareFault,
    },
    #[error("program at {address:#010x} failed")]
    ProgramFailed {
        address: u32,
        #[source]
        source: HardwareFault,
    },
}

/// A sector located by [`DeviceLayout::resolve`]: its 0-based
/// device-wide index, start address and size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorDescriptor {
    pub index: u32,
    pub start_address: u32,
    pub size: u32,
}

impl SectorDescriptor {
    fn contains(&self, address: u32) -> bool {
        address >= self.start_address && address < self.start_address + self.size
    }
}

/// Static device geometry: the ordered sector-run table plus the
/// filesystem partition (base address, block size, block count).
#[derive(Clone, Debug)]
pub struct DeviceLayout {
    runs: Vec<SectorRun>,
    partition_base: u32,
    block_size: u32,
    block_count: u32,
}

impl DeviceLayout {
    /// Panics if the table is malformed; the layout is operator
    /// configuration, not runtime input.
    pub fn new(runs: Vec<SectorRun>, partition_base: u32, block_size: u32, block_count: u32) -> Self {
        assert!(!runs.is_empty(), "layout must have at least one run");
        assert!(block_size > 0, "block size must be non-zero");
        for pair in runs.windows(2) {
            assert!(
                pair[0].end_address() <= pair[1].base_address,
                "sector runs must be ordered and non-overlapping"
            );
        }
        for run in &runs {
            assert!(run.sector_count > 0, "empty sector run");
            assert!(
                run.sector_size > 0 && run.sector_size % block_size == 0,
                "sector sizes must be multiples of the block size"
            );
        }
        let device_end = runs[runs.len() - 1].end_address() as u64;
        let layout = Self { runs, partition_base, block_size, block_count };
        assert_eq!(
            layout.resolve(partition_base).start_address,
            partition_base,
            "partition must start on a sector boundary"
        );
        let partition_end = partition_base as u64 + block_size as u64 * block_count as u64;
        assert!(partition_end <= device_end, "partition must fit in mapped flash");
        layout
    }

    /// The STM32F405 internal flash table, with the filesystem
    /// partition in the 16 KiB sectors 1..=3.
    pub fn stm32f405() -> Self {
        Self::new(
            vec![
                SectorRun { base_address: 0x0800_0000, sector_size: 0x04000, sector_count: 4 },
                SectorRun { base_address: 0x0801_0000, sector_size: 0x10000, sector_count: 1 },
                SectorRun { base_address: 0x0802_0000, sector_size: 0x20000, sector_count: 3 },
            ],
            0x0800_4000,
            512,
            96,
        )
    }

    pub fn runs(&self) -> &[SectorRun] {
        &self.runs
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn partition_base(&self) -> u32 {
        self.partition_base
    }

    /// Locate the sector containing `address`. Linear scan over the
    /// run table; runs once per cache miss, not per block. Addresses
    /// outside the table fall back to sector 0 (callers are expected
    /// never to pass one).
    pub fn resolve(&self, address: u32) -> SectorDescriptor {
        if address >= self.runs[0].base_address {
            let mut index = 0;
            for run in &self.runs {
                for j in 0..run.sector_count {
                    let sector_end = run.base_address + (j + 1) * run.sector_size;
                    if address < sector_end {
                        return SectorDescriptor {
                            index,
                            start_address: run.base_address + j * run.sector_size,
                            size: run.sector_size,
                        };
                    }
                    index += 1;
                }
            }
        }
        SectorDescriptor {
            index: 0,
            start_address: self.runs[0].base_address,
            size: self.runs[0].sector_size,
        }
    }

    /// Absolute flash address of a partition block.
    pub fn block_address(&self, block: u32) -> Result<u32, DeviceError> {
        if block < self.block_count {
            Ok(self.partition_base + block * self.block_size)
        } else {
            Err(DeviceError::InvalidBlock(block))
        }
    }

    /// Whole-run bounds check: all of `start_block..start_block+count`
    /// must be in the partition, or none of the request proceeds.
    pub fn check_range(&self, start_block: u32, count: u32) -> Result<(), DeviceError> {
        match start_block.checked_add(count) {
            Some(end) if end <= self.block_count => Ok(()),
            _ => Err(DeviceError::InvalidBlock(start_block)),
        }
    }
}

/// Single-slot write-back cache. At most one sector is resident; its
/// buffered bytes are authoritative and may be newer than flash.
struct SectorCache {
    resident: Option<SectorDescriptor>,
    buf: Box<[u8]>,
}

impl SectorCache {
    fn new() -> Self {
        Self { resident: None, buf: vec![0u8; CACHE_CAPACITY].into_boxed_slice() }
    }
}

/// Scoped flash-controller unlock. Locks again on every exit path,
/// including early returns from failed erase or program.
struct FlashSession<'a, F: FlashControl> {
    flash: &'a mut F,
}

impl<'a, F: FlashControl> FlashSession<'a, F> {
    fn new(flash: &'a mut F) -> Self {
        flash.unlock();
        Self { flash }
    }
}

impl<F: FlashControl> Drop for FlashSession<'_, F> {
    fn drop(&mut self) {
        self.flash.lock();
    }
}

/// Erase then reprogram one whole sector from `data`, under an
/// exclusive controller session. The caller has already decided the
/// sector is dirty.
fn program_sector<F: FlashControl>(
    flash: &mut F,
    sector: &SectorDescriptor,
    data: &[u8],
) -> Result<(), DeviceError> {
    debug!(
        sector = sector.index,
        start = sector.start_address,
        len = data.len(),
        "erasing and reprogramming sector"
    );
    let session = FlashSession::new(flash);
    session
        .flash
        .erase_sector(sector.index)
        .map_err(|source| DeviceError::EraseFailed { sector: sector.index, source })?;
    // The controller may serve stale cached reads of flash contents
    // across an erase unless its caches are cycled here.
    session.flash.invalidate_caches();
    session
        .flash
        .program_bytes(sector.start_address, data)
        .map_err(|source| DeviceError::ProgramFailed { address: sector.start_address, source })?;
    Ok(())
}

/// The block-device facade consumed by the filesystem layer.
pub struct FlashBlockDevice<F: FlashControl> {
    flash: F,
    layout: DeviceLayout,
    cache: SectorCache,
}

impl<F: FlashControl> FlashBlockDevice<F> {
    pub fn new(flash: F, layout: DeviceLayout) -> Self {
        Self { flash, layout, cache: SectorCache::new() }
    }

    /// Idempotent; construction already leaves the cache empty.
    pub fn init(&mut self) {}

    pub fn geometry(&self) -> (u32, u32) {
        (self.layout.block_size, self.layout.block_count)
    }

    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Copy `count` blocks starting at `start_block` into `dest`.
    ///
    /// The whole run is validated before anything is copied; a bad
    /// range leaves `dest` untouched. Blocks inside the resident
    /// sector are served from the cache buffer so that unflushed
    /// writes are visible to readers; everything else comes straight
    /// from flash.
    pub fn read_blocks(&mut self, dest: &mut [u8], start_block: u32, count: u32) -> Result<(), DeviceError> {
        self.layout.check_range(start_block, count)?;
        let bs = self.layout.block_size as usize;
        assert_eq!(dest.len(), bs * count as usize, "dest length must match the block run");
        for i in 0..count {
            let address = self.layout.block_address(start_block + i)?;
            let out = &mut dest[i as usize * bs..(i as usize + 1) * bs];
            match self.cache.resident {
                Some(res) if res.contains(address) => {
                    let off = (address - res.start_address) as usize;
                    out.copy_from_slice(&self.cache.buf[off..off + bs]);
                }
                _ => self.flash.read(address, out),
            }
        }
        Ok(())
    }

    /// Merge `count` blocks from `src` into the cache, sector by
    /// sector. No flash is touched unless the write moves to a
    /// different sector than the one resident, in which case the old
    /// sector is flushed first. The final sector is left resident and
    /// unflushed; call [`flush`](Self::flush) to commit it.
    pub fn write_blocks(&mut self, src: &[u8], start_block: u32, count: u32) -> Result<(), DeviceError> {
        self.layout.check_range(start_block, count)?;
        let bs = self.layout.block_size as usize;
        assert_eq!(src.len(), bs * count as usize, "source length must match the block run");
        let mut block = start_block;
        let mut remaining = count;
        let mut offset = 0usize;
        while remaining > 0 {
            let address = self.layout.block_address(block)?;
            let sector = self.layout.resolve(address);
            // Cap the run at the sector boundary; a merge never
            // crosses it.
            let to_boundary = (sector.size - (address - sector.start_address)) / self.layout.block_size;
            let run = remaining.min(to_boundary);
            self.ensure_resident(&sector)?;
            let in_sector = (address - sector.start_address) as usize;
            let len = run as usize * bs;
            self.cache.buf[in_sector..in_sector + len].copy_from_slice(&src[offset..offset + len]);
            block += run;
            offset += len;
            remaining -= run;
        }
        Ok(())
    }

    /// Commit the resident sector to flash if its buffered contents
    /// differ from what is physically stored. Identical contents cost
    /// zero erase/program operations. The sector stays resident; a
    /// failed flush leaves the buffer intact so the call can be
    /// retried.
    pub fn flush(&mut self) -> Result<(), DeviceError> {
        let Some(sector) = self.cache.resident else {
            return Ok(());
        };
        let size = sector.size as usize;
        let mut current = vec![0u8; size];
        self.flash.read(sector.start_address, &mut current);
        if current[..] == self.cache.buf[..size] {
            trace!(sector = sector.index, "cache matches flash, skipping erase");
            return Ok(());
        }
        program_sector(&mut self.flash, &sector, &self.cache.buf[..size])
    }

    /// Drop residency. By contract only called when no modifications
    /// are pending, i.e. after a successful [`flush`](Self::flush).
    pub fn release_cache(&mut self) {
        self.cache.resident = None;
    }

    fn ensure_resident(&mut self, sector: &SectorDescriptor) -> Result<(), DeviceError> {
        if sector.size as usize > CACHE_CAPACITY {
            return Err(DeviceError::SectorTooLarge { size: sector.size });
        }
        if let Some(res) = self.cache.resident {
            if res.start_address == sector.start_address {
                return Ok(());
            }
            // Commit the outgoing sector before reusing the buffer.
            // The flush path compares against flash first, so evicting
            // a clean sector is free.
            self.flush()?;
        }
        self.flash.read(sector.start_address, &mut self.cache.buf[..sector.size as usize]);
        self.cache.resident = Some(*sector);
        trace!(sector = sector.index, "sector loaded into cache");
        Ok(())
    }
}
