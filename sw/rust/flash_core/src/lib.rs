use thiserror::Error;

/// One contiguous run of uniformly-sized erase sectors.
///
/// A device's layout is an ordered list of runs; sector sizes vary
/// between runs but never within one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorRun {
    pub base_address: u32,
    pub sector_size: u32,
    pub sector_count: u32,
}

impl SectorRun {
    pub fn end_address(&self) -> u32 {
        self.base_address + self.sector_size * self.sector_count
    }
}

/// Failure reported by the flash controller itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HardwareFault {
    #[error("flash controller is locked")]
    ControllerLocked,
    #[error("flash operation timed out")]
    Timeout,
    #[error("programmed data failed verification")]
    Verify,
}

/// The flash-control capability: unlock, erase, program, read.
///
/// Erase and program are only legal between `unlock` and `lock`.
/// Reads are modeled as infallible because NOR flash is memory-mapped
/// and randomly readable at all times outside an active erase, which
/// this single-threaded core never overlaps with a read.
pub trait FlashControl {
    fn unlock(&mut self);
    fn lock(&mut self);

    /// Erase the sector with the given 0-based device-wide index.
    fn erase_sector(&mut self, index: u32) -> Result<(), HardwareFault>;

    /// Program `data` starting at `address`. The target range must
    /// have been erased; programming only clears bits.
    fn program_bytes(&mut self, address: u32, data: &[u8]) -> Result<(), HardwareFault>;

    fn read(&mut self, address: u32, buf: &mut [u8]);

    /// Disable, reset and re-enable the controller's instruction and
    /// data caches. Some controllers serve stale reads across an
    /// erase unless this bracket is applied.
    fn invalidate_caches(&mut self);
}
