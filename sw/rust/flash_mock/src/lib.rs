use flash_core::{FlashControl, HardwareFault, SectorRun};

/// In-memory NOR flash with real erase-before-write semantics:
/// erasing a sector sets it to 0xFF, programming only clears bits.
///
/// Instrumented for tests: counts erases, programs and controller
/// cache invalidations, records the span of every program call, and
/// can be armed to fail the next erase or program once.
pub struct MockFlash {
    layout: Vec<SectorRun>,
    base: u32,
    mem: Vec<u8>,
    unlocked: bool,
    erases: u32,
    invalidations: u32,
    program_spans: Vec<(u32, u32)>,
    fail_erase: bool,
    fail_program: bool,
}

impl MockFlash {
    pub fn new(layout: &[SectorRun]) -> Self {
        assert!(!layout.is_empty(), "layout must have at least one run");
        let base = layout[0].base_address;
        let end = layout[layout.len() - 1].end_address();
        Self {
            layout: layout.to_vec(),
            base,
            mem: vec![0xFF; (end - base) as usize],
            unlocked: false,
            erases: 0,
            invalidations: 0,
            program_spans: Vec::new(),
            fail_erase: false,
            fail_program: false,
        }
    }

    pub fn erase_count(&self) -> u32 {
        self.erases
    }

    pub fn program_count(&self) -> u32 {
        self.program_spans.len() as u32
    }

    /// `(address, len)` of every program call, in order.
    pub fn program_spans(&self) -> &[(u32, u32)] {
        &self.program_spans
    }

    pub fn cache_invalidations(&self) -> u32 {
        self.invalidations
    }

    pub fn is_locked(&self) -> bool {
        !self.unlocked
    }

    /// Arm a single-shot failure for the next erase.
    pub fn fail_next_erase(&mut self) {
        self.fail_erase = true;
    }

    /// Arm a single-shot failure for the next program.
    pub fn fail_next_program(&mut self) {
        self.fail_program = true;
    }

    /// Raw view of a flash range, bypassing the driver path.
    pub fn contents(&self, address: u32, len: u32) -> &[u8] {
        let off = (address - self.base) as usize;
        &self.mem[off..off + len as usize]
    }

    fn sector_range(&self, index: u32) -> (u32, u32) {
        let mut remaining = index;
        for run in &self.layout {
            if remaining < run.sector_count {
                let start = run.base_address + remaining * run.sector_size;
                return (start, run.sector_size);
            }
            remaining -= run.sector_count;
        }
        panic!("sector index {index} outside layout");
    }
}

impl FlashControl for MockFlash {
    fn unlock(&mut self) {
        self.unlocked = true;
    }

    fn lock(&mut self) {
        self.unlocked = false;
    }

    fn erase_sector(&mut self, index: u32) -> Result<(), HardwareFault> {
        if !self.unlocked {
            return Err(HardwareFault::ControllerLocked);
        }
        if self.fail_erase {
            self.fail_erase = false;
            return Err(HardwareFault::Timeout);
        }
        let (start, size) = self.sector_range(index);
        let off = (start - self.base) as usize;
        self.mem[off..off + size as usize].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn program_bytes(&mut self, address: u32, data: &[u8]) -> Result<(), HardwareFault> {
        if !self.unlocked {
            return Err(HardwareFault::ControllerLocked);
        }
        if self.fail_program {
            self.fail_program = false;
            return Err(HardwareFault::Timeout);
        }
        let off = (address - self.base) as usize;
        assert!(off + data.len() <= self.mem.len(), "program out of bounds");
        // NOR semantics: programming can only clear bits.
        for (cell, byte) in self.mem[off..off + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        self.program_spans.push((address, data.len() as u32));
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) {
        let off = (address - self.base) as usize;
        buf.copy_from_slice(&self.mem[off..off + buf.len()]);
    }

    fn invalidate_caches(&mut self) {
        self.invalidations += 1;
    }
}
