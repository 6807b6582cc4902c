use flash_blockdev::{DeviceError, DeviceLayout, FlashBlockDevice, CACHE_CAPACITY};
use flash_core::{HardwareFault, SectorRun};
use flash_mock::MockFlash;

const BLOCK: usize = 512;
const SECTOR: u32 = 0x4000; // 32 blocks

/// Four 16 KiB sectors, the whole device as the partition.
fn test_device() -> FlashBlockDevice<MockFlash> {
    let runs = vec![SectorRun { base_address: 0, sector_size: SECTOR, sector_count: 4 }];
    let flash = MockFlash::new(&runs);
    FlashBlockDevice::new(flash, DeviceLayout::new(runs, 0, BLOCK as u32, 128))
}

fn block_data(seed: u8, blocks: usize) -> Vec<u8> {
    (0..blocks * BLOCK).map(|i| seed.wrapping_add(i as u8)).collect()
}

#[test]
fn geometry_and_init() {
    let mut dev = test_device();
    dev.init();
    dev.init();
    assert_eq!(dev.geometry(), (512, 128));
}

#[test]
fn write_flush_read_round_trip() {
    let mut dev = test_device();
    let data = block_data(0x11, 3);
    dev.write_blocks(&data, 3, 3).unwrap();
    dev.flush().unwrap();

    let mut out = vec![0u8; 3 * BLOCK];
    dev.read_blocks(&mut out, 3, 3).unwrap();
    assert_eq!(out, data);
    // And the physical sector really holds it.
    assert_eq!(dev.flash().contents(3 * BLOCK as u32, 3 * BLOCK as u32), &data[..]);
}

#[test]
fn read_observes_unflushed_writes() {
    let mut dev = test_device();
    let data = block_data(0x22, 1);
    dev.write_blocks(&data, 7, 1).unwrap();

    // Nothing has been committed yet...
    assert_eq!(dev.flash().erase_count(), 0);
    assert_eq!(dev.flash().contents(7 * BLOCK as u32, BLOCK as u32), &[0xFF; BLOCK][..]);

    // ...but a reader must still see the new bytes, not stale flash.
    let mut out = vec![0u8; BLOCK];
    dev.read_blocks(&mut out, 7, 1).unwrap();
    assert_eq!(out, data);
}

#[test]
fn identical_rewrite_costs_no_erase() {
    let mut dev = test_device();
    let data = block_data(0x33, 32);
    dev.write_blocks(&data, 0, 32).unwrap();
    dev.flush().unwrap();
    assert_eq!(dev.flash().erase_count(), 1);
    assert_eq!(dev.flash().program_count(), 1);

    // Same bytes again: the flush compare must skip the cycle.
    dev.write_blocks(&data, 0, 32).unwrap();
    dev.flush().unwrap();
    assert_eq!(dev.flash().erase_count(), 1);
    assert_eq!(dev.flash().program_count(), 1);
}

#[test]
fn cross_sector_write_splits_at_the_boundary() {
    let mut dev = test_device();
    // Blocks 30..34: two in sector 0, two in sector 1.
    let data = block_data(0x44, 4);
    dev.write_blocks(&data, 30, 4).unwrap();

    // Moving into sector 1 evicted (and therefore flushed) sector 0.
    assert_eq!(dev.flash().erase_count(), 1);
    dev.flush().unwrap();
    assert_eq!(dev.flash().erase_count(), 2);

    // No program operation crossed a sector boundary.
    for &(addr, len) in dev.flash().program_spans() {
        assert_eq!(addr / SECTOR, (addr + len - 1) / SECTOR, "program span crosses a sector");
    }

    let mut out = vec![0u8; 4 * BLOCK];
    dev.read_blocks(&mut out, 30, 4).unwrap();
    assert_eq!(out, data);
}

#[test]
fn switching_sectors_flushes_the_first_exactly_once() {
    let mut dev = test_device();
    dev.write_blocks(&block_data(0x55, 1), 0, 1).unwrap();
    assert_eq!(dev.flash().erase_count(), 0);

    // Block 40 lives in sector 1; the dirty sector 0 goes out first.
    dev.write_blocks(&block_data(0x66, 1), 40, 1).unwrap();
    assert_eq!(dev.flash().erase_count(), 1);
    assert_eq!(dev.flash().program_count(), 1);
    let (addr, len) = dev.flash().program_spans()[0];
    assert_eq!((addr, len), (0, SECTOR));
}

#[test]
fn out_of_range_requests_touch_nothing() {
    let mut dev = test_device();
    let mut dest = vec![0xAA; 10 * BLOCK];
    assert_eq!(dev.read_blocks(&mut dest, 125, 10), Err(DeviceError::InvalidBlock(125)));
    assert!(dest.iter().all(|&b| b == 0xAA), "dest must be untouched");

    let src = vec![0x77; 10 * BLOCK];
    assert_eq!(dev.write_blocks(&src, 125, 10), Err(DeviceError::InvalidBlock(125)));
    dev.flush().unwrap();
    assert_eq!(dev.flash().erase_count(), 0);
    assert_eq!(dev.flash().program_count(), 0);
}

#[test]
fn full_sector_then_one_block_is_one_erase_program_cycle() {
    let mut dev = test_device();
    let data_a = block_data(0x88, 32);
    let data_b = block_data(0x99, 1);
    dev.write_blocks(&data_a, 0, 32).unwrap();
    dev.write_blocks(&data_b, 5, 1).unwrap();
    dev.flush().unwrap();

    assert_eq!(dev.flash().erase_count(), 1);
    assert_eq!(dev.flash().program_count(), 1);

    let mut expected = data_a;
    expected[5 * BLOCK..6 * BLOCK].copy_from_slice(&data_b);
    assert_eq!(dev.flash().contents(0, SECTOR), &expected[..]);
}

#[test]
fn failed_erase_keeps_the_buffer_and_allows_retry() {
    let mut dev = test_device();
    let data = block_data(0xAB, 2);
    dev.write_blocks(&data, 2, 2).unwrap();

    dev.flash_mut().fail_next_erase();
    assert_eq!(
        dev.flush(),
        Err(DeviceError::EraseFailed { sector: 0, source: HardwareFault::Timeout })
    );
    // The guard released the controller on the failure path.
    assert!(dev.flash().is_locked());

    // The intended contents survived in the cache; retrying commits.
    dev.flush().unwrap();
    assert_eq!(dev.flash().contents(2 * BLOCK as u32, 2 * BLOCK as u32), &data[..]);
}

#[test]
fn failed_program_leaves_controller_locked_and_retries() {
    let mut dev = test_device();
    let data = block_data(0xCD, 1);
    dev.write_blocks(&data, 1, 1).unwrap();

    dev.flash_mut().fail_next_program();
    let err = dev.flush().unwrap_err();
    assert!(matches!(err, DeviceError::ProgramFailed { address: 0, .. }));
    assert!(dev.flash().is_locked());

    // The sector is erased but unprogrammed; the retry reprograms it.
    dev.flush().unwrap();
    assert_eq!(dev.flash().contents(BLOCK as u32, BLOCK as u32), &data[..]);
}

#[test]
fn erase_brackets_a_controller_cache_invalidation() {
    let mut dev = test_device();
    dev.write_blocks(&block_data(0xEF, 1), 0, 1).unwrap();
    dev.flush().unwrap();
    assert_eq!(dev.flash().cache_invalidations(), 1);
}

#[test]
fn writes_into_oversized_sectors_are_refused() {
    // 16 KiB sectors followed by a 64 KiB sector, all one partition.
    let runs = vec![
        SectorRun { base_address: 0, sector_size: 0x4000, sector_count: 4 },
        SectorRun { base_address: 0x1_0000, sector_size: 0x1_0000, sector_count: 1 },
    ];
    let flash = MockFlash::new(&runs);
    let mut dev = FlashBlockDevice::new(flash, DeviceLayout::new(runs, 0, 512, 256));

    // Block 128 is the first block of the 64 KiB sector.
    let src = vec![0x11; BLOCK];
    assert_eq!(
        dev.write_blocks(&src, 128, 1),
        Err(DeviceError::SectorTooLarge { size: 0x1_0000 })
    );
    assert_eq!(dev.flash().erase_count(), 0);
    assert!(0x1_0000 > CACHE_CAPACITY as u32);

    // Reads of the same region are unaffected.
    let mut out = vec![0u8; BLOCK];
    dev.read_blocks(&mut out, 128, 1).unwrap();
    assert_eq!(out, vec![0xFF; BLOCK]);
}

#[test]
fn release_cache_after_flush_keeps_data_readable() {
    let mut dev = test_device();
    let data = block_data(0x5A, 1);
    dev.write_blocks(&data, 9, 1).unwrap();
    dev.flush().unwrap();
    dev.release_cache();

    let mut out = vec![0u8; BLOCK];
    dev.read_blocks(&mut out, 9, 1).unwrap();
    assert_eq!(out, data);
}

#[test]
fn flush_on_empty_cache_is_a_no_op() {
    let mut dev = test_device();
    dev.flush().unwrap();
    assert_eq!(dev.flash().erase_count(), 0);
}
