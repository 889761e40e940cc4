use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;

/// Block device error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    InvalidBlock,
    IoError,
    DeviceError,
    OutOfMemory,
}

/// Sector-addressed storage the filesystem sits on.
///
/// Transfers are synchronous: a call returns once every sector has moved.
/// `buf` must be exactly `count * SECTOR_SIZE` bytes long.
pub trait BlockDevice: Send + Sync {
    fn read_sectors(
        &self,
        drive: u8,
        lba: u32,
        count: u8,
        buf: &mut [u8],
    ) -> Result<(), BlockError>;

    fn write_sectors(&self, drive: u8, lba: u32, count: u8, buf: &[u8]) -> Result<(), BlockError>;

    /// Flush all pending writes
    fn sync(&self) -> Result<(), BlockError> {
        Ok(())
    }

    /// Get device statistics
    fn statistics(&self) -> BlockDeviceStats {
        BlockDeviceStats::default()
    }
}

/// Block device statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDeviceStats {
    pub read_count: u64,
    pub write_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

/// Injected failures for one transfer direction.
#[derive(Debug, Default)]
struct FaultPlan {
    /// Every request fails.
    always: bool,
    /// Requests left to succeed before a single one fails.
    fail_after: Option<usize>,
}

impl FaultPlan {
    /// Consumes one request; true when it must fail.
    fn trips(&mut self) -> bool {
        if self.always {
            return true;
        }
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                true
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

/// A drive backed by a byte vector, used for ramdisks and test images.
///
/// Reads and writes can be forced to fail, either until cleared (a dying
/// disk) or once after a number of successful requests (a transient error
/// in the middle of an operation).
pub struct RamDisk {
    drive: u8,
    data: Mutex<Vec<u8>>,
    stats: Mutex<BlockDeviceStats>,
    read_faults: Mutex<FaultPlan>,
    write_faults: Mutex<FaultPlan>,
}

impl RamDisk {
    pub fn new(drive: u8, sectors: usize) -> Self {
        Self::from_image(drive, vec![0u8; sectors * SECTOR_SIZE])
    }

    /// Wraps an existing image. A trailing partial sector is zero-padded.
    pub fn from_image(drive: u8, mut image: Vec<u8>) -> Self {
        let rem = image.len() % SECTOR_SIZE;
        if rem != 0 {
            image.resize(image.len() + SECTOR_SIZE - rem, 0);
        }
        Self {
            drive,
            data: Mutex::new(image),
            stats: Mutex::new(BlockDeviceStats::default()),
            read_faults: Mutex::new(FaultPlan::default()),
            write_faults: Mutex::new(FaultPlan::default()),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.read_faults.lock().always = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.write_faults.lock().always = fail;
    }

    /// Lets `reads` more read requests through, fails the next one, then
    /// recovers.
    pub fn fail_read_after(&self, reads: usize) {
        self.read_faults.lock().fail_after = Some(reads);
    }

    pub fn fail_write_after(&self, writes: usize) {
        self.write_faults.lock().fail_after = Some(writes);
    }

    /// Copy of the whole medium.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn byte_range(
        &self,
        drive: u8,
        lba: u32,
        count: u8,
        buf_len: usize,
    ) -> Result<Range<usize>, BlockError> {
        if drive != self.drive {
            return Err(BlockError::DeviceError);
        }
        let len = count as usize * SECTOR_SIZE;
        if count == 0 || buf_len != len {
            return Err(BlockError::InvalidBlock);
        }
        let start = lba as usize * SECTOR_SIZE;
        let end = start.checked_add(len).ok_or(BlockError::InvalidBlock)?;
        if end > self.data.lock().len() {
            return Err(BlockError::InvalidBlock);
        }
        Ok(start..end)
    }
}

impl BlockDevice for RamDisk {
    fn read_sectors(
        &self,
        drive: u8,
        lba: u32,
        count: u8,
        buf: &mut [u8],
    ) -> Result<(), BlockError> {
        let range = self.byte_range(drive, lba, count, buf.len());
        let mut stats = self.stats.lock();
        if self.read_faults.lock().trips() {
            stats.read_errors += 1;
            return Err(BlockError::IoError);
        }
        let range = range.inspect_err(|_| stats.read_errors += 1)?;
        buf.copy_from_slice(&self.data.lock()[range]);
        stats.read_count += 1;
        stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    fn write_sectors(&self, drive: u8, lba: u32, count: u8, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.byte_range(drive, lba, count, buf.len());
        let mut stats = self.stats.lock();
        if self.write_faults.lock().trips() {
            stats.write_errors += 1;
            return Err(BlockError::IoError);
        }
        let range = range.inspect_err(|_| stats.write_errors += 1)?;
        self.data.lock()[range].copy_from_slice(buf);
        stats.write_count += 1;
        stats.bytes_written += buf.len() as u64;
        Ok(())
    }

    fn statistics(&self) -> BlockDeviceStats {
        self.stats.lock().clone()
    }
}
