use log::LevelFilter;

// Logging
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Debug;

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Upper bound on block groups accepted at mount; larger counts mean a
/// corrupt superblock.
pub const DEFAULT_MAX_BLOCK_GROUPS: u32 = 1000;

/// `s_log_block_size` ceiling (1 KiB << 10).
pub const MAX_LOG_BLOCK_SIZE: u32 = 10;

/// Sector count per device request; the request count field is 8 bits.
pub const MAX_SECTORS_PER_TRANSFER: usize = 128;

/// Caller-supplied mount parameters.
#[derive(Debug, Clone, Copy)]
pub struct MountConfig {
    pub drive: u8,
    /// First sector of the partition on `drive`.
    pub partition_offset: u32,
    pub max_block_groups: u32,
    /// Seconds since the epoch, stamped into inode times.
    pub clock: fn() -> u32,
}

fn no_clock() -> u32 {
    0
}

impl MountConfig {
    pub fn new(drive: u8, partition_offset: u32) -> Self {
        Self {
            drive,
            partition_offset,
            max_block_groups: DEFAULT_MAX_BLOCK_GROUPS,
            clock: no_clock,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> u32) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_block_groups(mut self, max: u32) -> Self {
        self.max_block_groups = max;
        self
    }
}
