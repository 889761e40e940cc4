use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::block::{BlockDevice, BlockError, SECTOR_SIZE};
use crate::config::{MAX_LOG_BLOCK_SIZE, MAX_SECTORS_PER_TRANSFER, MountConfig};
use crate::error::{FileSystemError, MountError, Result};
use crate::layout::{
    EXT2_SUPER_MAGIC, GOOD_OLD_INODE_SIZE, GROUP_DESC_SIZE, GroupDescriptor, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE, SuperBlock, ceil_div, volume_label,
};

const SUPERBLOCK_LBA: u32 = (SUPERBLOCK_OFFSET / SECTOR_SIZE) as u32;
const SUPERBLOCK_SECTORS: u8 = (SUPERBLOCK_SIZE / SECTOR_SIZE) as u8;

/// Zero-filled scratch buffer, or `OutOfMemory` when the heap is exhausted.
pub(crate) fn scratch_buf(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| FileSystemError::OutOfMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}

pub(crate) fn read_sectors_chunked(
    device: &dyn BlockDevice,
    drive: u8,
    lba: u32,
    buf: &mut [u8],
) -> core::result::Result<(), BlockError> {
    for (i, chunk) in buf.chunks_mut(MAX_SECTORS_PER_TRANSFER * SECTOR_SIZE).enumerate() {
        let chunk_lba = lba
            .checked_add((i * MAX_SECTORS_PER_TRANSFER) as u32)
            .ok_or(BlockError::InvalidBlock)?;
        let count = (chunk.len() / SECTOR_SIZE) as u8;
        device.read_sectors(drive, chunk_lba, count, chunk)?;
    }
    Ok(())
}

pub(crate) fn write_sectors_chunked(
    device: &dyn BlockDevice,
    drive: u8,
    lba: u32,
    buf: &[u8],
) -> core::result::Result<(), BlockError> {
    for (i, chunk) in buf.chunks(MAX_SECTORS_PER_TRANSFER * SECTOR_SIZE).enumerate() {
        let chunk_lba = lba
            .checked_add((i * MAX_SECTORS_PER_TRANSFER) as u32)
            .ok_or(BlockError::InvalidBlock)?;
        let count = (chunk.len() / SECTOR_SIZE) as u8;
        device.write_sectors(drive, chunk_lba, count, chunk)?;
    }
    Ok(())
}

/// A mounted ext2 volume.
///
/// Owns the superblock and the descriptor table loaded at mount time. Every
/// other structure (bitmaps, inode tables, directory and indirect blocks) is
/// re-read from the device on each use, so nothing here can go stale.
pub struct Ext2FileSystem {
    device: Arc<dyn BlockDevice>,
    config: MountConfig,
    pub(crate) superblock: SuperBlock,
    pub(crate) groups: Vec<GroupDescriptor>,
    pub(crate) block_size: usize,
    pub(crate) inode_size: usize,
}

impl fmt::Debug for Ext2FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ext2FileSystem")
            .field("drive", &self.config.drive)
            .field("partition_offset", &self.config.partition_offset)
            .field("block_size", &self.block_size)
            .field("groups", &self.groups.len())
            .field("inodes_per_group", &self.superblock.inodes_per_group)
            .field("blocks_per_group", &self.superblock.blocks_per_group)
            .finish()
    }
}

impl Ext2FileSystem {
    pub fn mount(device: Arc<dyn BlockDevice>, config: MountConfig) -> Result<Self> {
        let mut sb_buf = Vec::new();
        sb_buf
            .try_reserve_exact(SUPERBLOCK_SIZE)
            .map_err(|_| MountError::AllocFailed)?;
        sb_buf.resize(SUPERBLOCK_SIZE, 0);
        let sb_lba = config
            .partition_offset
            .checked_add(SUPERBLOCK_LBA)
            .ok_or(MountError::IoError)?;
        device
            .read_sectors(config.drive, sb_lba, SUPERBLOCK_SECTORS, &mut sb_buf)
            .map_err(|e| {
                error!("ext2: failed to read superblock: {:?}", e);
                MountError::IoError
            })?;
        let superblock = SuperBlock::parse(&sb_buf);
        drop(sb_buf);

        debug!("ext2: superblock magic={:#x} (expected {:#x})", superblock.magic, EXT2_SUPER_MAGIC);
        if superblock.magic != EXT2_SUPER_MAGIC {
            warn!("ext2: invalid magic number {:#x}", superblock.magic);
            return Err(MountError::BadMagic.into());
        }
        if superblock.log_block_size > MAX_LOG_BLOCK_SIZE {
            warn!("ext2: invalid block size exponent {}", superblock.log_block_size);
            return Err(MountError::BadBlockSize.into());
        }
        let block_size = 1024usize << superblock.log_block_size;

        let bits_per_bitmap = block_size as u32 * 8;
        let blocks_per_group = superblock.blocks_per_group;
        if blocks_per_group == 0
            || blocks_per_group > bits_per_bitmap
            || superblock.inodes_per_group == 0
            || superblock.inodes_per_group > bits_per_bitmap
        {
            warn!("ext2: invalid group geometry");
            return Err(MountError::BadGroupCount.into());
        }
        let group_count = superblock.blocks_count.div_ceil(blocks_per_group);
        if group_count == 0 || group_count > config.max_block_groups {
            warn!("ext2: invalid number of block groups: {}", group_count);
            return Err(MountError::BadGroupCount.into());
        }

        let inode_size = superblock.inode_record_size();
        if inode_size < GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || inode_size > block_size
        {
            warn!("ext2: unsupported inode size {}", inode_size);
            return Err(MountError::BadInodeSize.into());
        }

        let group_count = group_count as usize;
        let mut groups = Vec::new();
        groups
            .try_reserve_exact(group_count)
            .map_err(|_| MountError::AllocFailed)?;

        let gdt_blocks = ceil_div(group_count * GROUP_DESC_SIZE, block_size);
        let mut gdt_buf = Vec::new();
        gdt_buf
            .try_reserve_exact(gdt_blocks * block_size)
            .map_err(|_| MountError::AllocFailed)?;
        gdt_buf.resize(gdt_blocks * block_size, 0);

        let sectors_per_block = (block_size / SECTOR_SIZE) as u64;
        let gdt_start = superblock.first_data_block as u64 + 1;
        let gdt_lba = config.partition_offset as u64 + gdt_start * sectors_per_block;
        let gdt_lba = u32::try_from(gdt_lba).map_err(|_| MountError::IoError)?;
        read_sectors_chunked(device.as_ref(), config.drive, gdt_lba, &mut gdt_buf).map_err(|e| {
            error!("ext2: failed to read block group descriptors: {:?}", e);
            MountError::IoError
        })?;
        for i in 0..group_count {
            let start = i * GROUP_DESC_SIZE;
            groups.push(GroupDescriptor::parse(&gdt_buf[start..start + GROUP_DESC_SIZE]));
        }

        info!(
            "ext2: mounted '{}' (drive {}, sector {}): block size {}, {} groups, \
             {}/{} blocks free, {}/{} inodes free",
            superblock.volume_name(),
            config.drive,
            config.partition_offset,
            block_size,
            group_count,
            superblock.free_blocks_count,
            superblock.blocks_count,
            superblock.free_inodes_count,
            superblock.inodes_count,
        );

        Ok(Self {
            device,
            config,
            superblock,
            groups,
            block_size,
            inode_size,
        })
    }

    /// Flushes the device and releases the descriptor table.
    pub fn unmount(self) -> Result<()> {
        self.device.sync()?;
        info!("ext2: unmounted drive {}", self.config.drive);
        Ok(())
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn inode_size(&self) -> usize {
        self.inode_size
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn group_descriptors(&self) -> &[GroupDescriptor] {
        &self.groups
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> u32 {
        (self.config.clock)()
    }

    /// Block pointers held by one indirection block.
    pub(crate) fn ptrs_per_block(&self) -> usize {
        self.block_size / 4
    }

    pub(crate) fn sectors_per_block(&self) -> u32 {
        (self.block_size / SECTOR_SIZE) as u32
    }

    fn block_lba(&self, block: u32) -> Result<u32> {
        if block >= self.superblock.blocks_count {
            warn!("ext2: block {} beyond end of volume", block);
            return Err(FileSystemError::InvalidFileSystem);
        }
        let lba = self.config.partition_offset as u64
            + block as u64 * self.sectors_per_block() as u64;
        u32::try_from(lba).map_err(|_| FileSystemError::InvalidFileSystem)
    }

    pub(crate) fn new_block_buf(&self) -> Result<Vec<u8>> {
        scratch_buf(self.block_size)
    }

    pub(crate) fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(FileSystemError::IoError);
        }
        let lba = self.block_lba(block)?;
        read_sectors_chunked(self.device.as_ref(), self.config.drive, lba, buf)?;
        Ok(())
    }

    pub(crate) fn write_block(&self, block: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != self.block_size {
            return Err(FileSystemError::IoError);
        }
        let lba = self.block_lba(block)?;
        write_sectors_chunked(self.device.as_ref(), self.config.drive, lba, buf)?;
        Ok(())
    }

    pub(crate) fn read_block_vec(&self, block: u32) -> Result<Vec<u8>> {
        let mut buf = self.new_block_buf()?;
        self.read_block(block, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn zero_block(&self, block: u32) -> Result<()> {
        let buf = self.new_block_buf()?;
        self.write_block(block, &buf)
    }

    /// Writes the descriptor of `group` into its slot of the on-disk table.
    pub(crate) fn write_group_descriptor(&self, group: usize) -> Result<()> {
        let gd = self.groups.get(group).ok_or(FileSystemError::InvalidFileSystem)?;
        let per_block = self.block_size / GROUP_DESC_SIZE;
        let table_block = self.superblock.first_data_block + 1 + (group / per_block) as u32;
        let offset = (group % per_block) * GROUP_DESC_SIZE;

        let mut buf = self.read_block_vec(table_block)?;
        gd.write_to(&mut buf[offset..offset + GROUP_DESC_SIZE]);
        self.write_block(table_block, &buf)
    }

    /// Writes the in-memory superblock back over the on-disk one.
    pub(crate) fn write_superblock(&self) -> Result<()> {
        let lba = self
            .config
            .partition_offset
            .checked_add(SUPERBLOCK_LBA)
            .ok_or(FileSystemError::InvalidFileSystem)?;
        let mut buf = scratch_buf(SUPERBLOCK_SIZE)?;
        self.device
            .read_sectors(self.config.drive, lba, SUPERBLOCK_SECTORS, &mut buf)?;
        self.superblock.write_to(&mut buf);
        self.device
            .write_sectors(self.config.drive, lba, SUPERBLOCK_SECTORS, &buf)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.device.sync()?;
        Ok(())
    }

    pub fn fs_info(&self) -> FsInfo {
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&self.superblock.volume_name);
        FsInfo {
            block_size: self.block_size,
            blocks_count: self.superblock.blocks_count,
            free_blocks_count: self.superblock.free_blocks_count,
            inodes_count: self.superblock.inodes_count,
            free_inodes_count: self.superblock.free_inodes_count,
            group_count: self.groups.len(),
            inode_size: self.inode_size,
            volume_name,
        }
    }
}

/// Snapshot of the volume's geometry and free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub block_size: usize,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub inodes_count: u32,
    pub free_inodes_count: u32,
    pub group_count: usize,
    pub inode_size: usize,
    volume_name: [u8; 16],
}

impl FsInfo {
    pub fn volume_name(&self) -> &str {
        volume_label(&self.volume_name)
    }
}

impl fmt::Display for FsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EXT2 Filesystem Information:")?;
        if !self.volume_name().is_empty() {
            writeln!(f, "  Volume name: {}", self.volume_name())?;
        }
        writeln!(f, "  Block size: {} bytes", self.block_size)?;
        writeln!(f, "  Total blocks: {}", self.blocks_count)?;
        writeln!(f, "  Free blocks: {}", self.free_blocks_count)?;
        writeln!(f, "  Total inodes: {}", self.inodes_count)?;
        writeln!(f, "  Free inodes: {}", self.free_inodes_count)?;
        write!(f, "  Block groups: {}", self.group_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::testing;
    use alloc::string::ToString;

    #[test]
    fn test_mount_reports_geometry() {
        let (_disk, fs) = testing::mount_fresh();
        assert_eq!(fs.block_size(), 1024);
        assert_eq!(fs.group_count(), 2);
        assert_eq!(fs.inode_size(), 128);
        let info = fs.fs_info();
        assert_eq!(info.free_blocks_count, testing::INITIAL_FREE_BLOCKS);
        assert_eq!(info.free_inodes_count, testing::INITIAL_FREE_INODES);
        assert_eq!(info.volume_name(), "testvol");
        let text = info.to_string();
        assert!(text.contains("Block size: 1024 bytes"));
        assert!(text.contains("Block groups: 2"));
    }

    #[test]
    fn test_mount_rejects_bad_magic() {
        let disk = testing::fresh_disk();
        testing::patch_superblock(&disk, |sb| sb.magic = 0x1234);
        let err = Ext2FileSystem::mount(disk, testing::config()).unwrap_err();
        assert_eq!(err, FileSystemError::Mount(MountError::BadMagic));
    }

    #[test]
    fn test_mount_rejects_bad_block_size() {
        let disk = testing::fresh_disk();
        testing::patch_superblock(&disk, |sb| sb.log_block_size = MAX_LOG_BLOCK_SIZE + 1);
        let err = Ext2FileSystem::mount(disk, testing::config()).unwrap_err();
        assert_eq!(err, FileSystemError::Mount(MountError::BadBlockSize));
    }

    #[test]
    fn test_mount_rejects_implausible_group_count() {
        let disk = testing::fresh_disk();
        testing::patch_superblock(&disk, |sb| sb.blocks_per_group = 0);
        let err = Ext2FileSystem::mount(disk, testing::config()).unwrap_err();
        assert_eq!(err, FileSystemError::Mount(MountError::BadGroupCount));

        let disk = testing::fresh_disk();
        let config = testing::config().with_max_block_groups(1);
        let err = Ext2FileSystem::mount(disk, config).unwrap_err();
        assert_eq!(err, FileSystemError::Mount(MountError::BadGroupCount));
    }

    #[test]
    fn test_mount_rejects_bad_inode_size() {
        let disk = testing::fresh_disk();
        testing::patch_superblock(&disk, |sb| sb.inode_size = 100);
        let err = Ext2FileSystem::mount(disk, testing::config()).unwrap_err();
        assert_eq!(err, FileSystemError::Mount(MountError::BadInodeSize));
    }

    #[test]
    fn test_mount_surfaces_read_failure() {
        let disk = testing::fresh_disk();
        disk.set_fail_reads(true);
        let err = Ext2FileSystem::mount(disk, testing::config()).unwrap_err();
        assert_eq!(err, FileSystemError::Mount(MountError::IoError));
    }

    #[test]
    fn test_block_reads_honour_partition_offset() {
        let (disk, fs) = testing::mount_fresh();
        let image = disk.snapshot();
        let block = fs.read_block_vec(testing::ROOT_DIR_BLOCK).unwrap();
        let start = testing::PARTITION_OFFSET as usize * SECTOR_SIZE
            + testing::ROOT_DIR_BLOCK as usize * testing::BLOCK_SIZE;
        assert_eq!(&image[start..start + testing::BLOCK_SIZE], block.as_slice());
        assert_eq!(
            fs.read_block_vec(testing::BLOCKS_COUNT),
            Err(FileSystemError::InvalidFileSystem)
        );
    }

    #[test]
    fn test_large_transfers_are_split() {
        let disk = RamDisk::new(3, 400);
        let data: Vec<u8> = (0..300 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        write_sectors_chunked(&disk, 3, 10, &data).unwrap();
        assert_eq!(disk.statistics().write_count, 3);

        let mut back = vec![0u8; data.len()];
        read_sectors_chunked(&disk, 3, 10, &mut back).unwrap();
        assert_eq!(back, data);
    }
}
