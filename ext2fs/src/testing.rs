//! Fixtures shared by the unit tests: a freshly formatted two-group volume
//! with 1 KiB blocks, sitting behind a non-zero partition offset.
//!
//! | block    | contents                    |
//! |----------|-----------------------------|
//! | 1        | superblock                  |
//! | 2        | group descriptor table      |
//! | 3, 4     | group 0 block/inode bitmaps |
//! | 5..=8    | group 0 inode table         |
//! | 9        | root directory              |
//! | 257, 258 | group 1 block/inode bitmaps |
//! | 259..=262| group 1 inode table         |
//!
//! [`large_block_disk`] builds a one-group volume with 64 KiB or bigger
//! blocks for the directory record encoding.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::RangeInclusive;

use lazy_static::lazy_static;

use crate::block::{BlockDevice, RamDisk, SECTOR_SIZE};
use crate::config::MountConfig;
use crate::fs::Ext2FileSystem;
use crate::layout::{
    DirEntry, DiskInode, EXT2_ROOT_INO, EXT2_SUPER_MAGIC, FilePerm, GROUP_DESC_SIZE,
    GroupDescriptor, InodeType, SuperBlock,
};

pub const DRIVE: u8 = 0;
pub const PARTITION_OFFSET: u32 = 8;
pub const BLOCK_SIZE: usize = 1024;
pub const BLOCKS_COUNT: u32 = 512;
pub const BLOCKS_PER_GROUP: u32 = 256;
pub const INODES_PER_GROUP: u32 = 32;
pub const INODES_COUNT: u32 = 64;
pub const ROOT_DIR_BLOCK: u32 = 9;
pub const FIRST_FREE_BLOCK: u32 = 10;
pub const INITIAL_FREE_BLOCKS: u32 = 496;
pub const INITIAL_FREE_INODES: u32 = 54;

const GROUP0_INODE_TABLE: u32 = 5;

/// 64 KiB blocks.
pub const LARGE_LOG_BLOCK_SIZE: u32 = 6;
pub const LARGE_BLOCKS_COUNT: u32 = 16;
/// Blocks 0..=5 hold the superblock, descriptors, bitmaps, inode table and
/// the root directory.
pub const LARGE_FREE_BLOCKS: u32 = 10;

lazy_static! {
    static ref BASE_IMAGE: Vec<u8> = build_image();
    static ref LARGE_BLOCK_IMAGE: Vec<u8> = build_large_block_image(LARGE_LOG_BLOCK_SIZE);
}

fn set_bits(bitmap: &mut [u8], bits: RangeInclusive<usize>) {
    for bit in bits {
        bitmap[bit / 8] |= 1 << (bit % 8);
    }
}

fn build_image() -> Vec<u8> {
    let base = PARTITION_OFFSET as usize * SECTOR_SIZE;
    let mut image = vec![0u8; base + BLOCKS_COUNT as usize * BLOCK_SIZE];
    let at = |block: u32| base + block as usize * BLOCK_SIZE;

    let mut volume_name = [0u8; 16];
    volume_name[..7].copy_from_slice(b"testvol");
    let sb = SuperBlock {
        inodes_count: INODES_COUNT,
        blocks_count: BLOCKS_COUNT,
        free_blocks_count: INITIAL_FREE_BLOCKS,
        free_inodes_count: INITIAL_FREE_INODES,
        first_data_block: 1,
        log_block_size: 0,
        blocks_per_group: BLOCKS_PER_GROUP,
        inodes_per_group: INODES_PER_GROUP,
        magic: EXT2_SUPER_MAGIC,
        state: 1,
        rev_level: 1,
        first_ino: 11,
        inode_size: 128,
        volume_name,
        ..Default::default()
    };
    sb.write_to(&mut image[at(1)..at(2)]);

    let groups = [
        GroupDescriptor {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: GROUP0_INODE_TABLE,
            free_blocks_count: 247,
            free_inodes_count: 22,
            used_dirs_count: 1,
        },
        GroupDescriptor {
            block_bitmap: 257,
            inode_bitmap: 258,
            inode_table: 259,
            free_blocks_count: 249,
            free_inodes_count: 32,
            used_dirs_count: 0,
        },
    ];
    for (i, gd) in groups.iter().enumerate() {
        let start = at(2) + i * GROUP_DESC_SIZE;
        gd.write_to(&mut image[start..start + GROUP_DESC_SIZE]);
    }

    // bits past the end of each group are marked in use
    {
        let bitmap = &mut image[at(3)..at(4)];
        set_bits(bitmap, 0..=8);
        bitmap[BLOCKS_PER_GROUP as usize / 8..].fill(0xFF);
    }
    {
        let bitmap = &mut image[at(257)..at(258)];
        set_bits(bitmap, 0..=5);
        set_bits(bitmap, 255..=255);
        bitmap[BLOCKS_PER_GROUP as usize / 8..].fill(0xFF);
    }
    for (bitmap_block, reserved) in [(4u32, Some(0..=9)), (258, None)] {
        let bitmap = &mut image[at(bitmap_block)..at(bitmap_block + 1)];
        if let Some(bits) = reserved {
            set_bits(bitmap, bits);
        }
        bitmap[INODES_PER_GROUP as usize / 8..].fill(0xFF);
    }

    let (table, dir) = (at(GROUP0_INODE_TABLE), at(ROOT_DIR_BLOCK));
    write_root(&mut image, table, dir, BLOCK_SIZE, ROOT_DIR_BLOCK);
    image
}

/// Writes the root inode into the table at byte `table` and its `.`/`..`
/// records into block `block`, which starts at byte `dir`.
fn write_root(image: &mut [u8], table: usize, dir: usize, block_size: usize, block: u32) {
    let mut root = DiskInode::new(InodeType::Directory, FilePerm::from_bits_truncate(0o755), 0);
    root.links_count = 2;
    root.size = block_size as u32;
    root.blocks = (block_size / SECTOR_SIZE) as u32;
    root.block[0] = block;
    let slot = table + (EXT2_ROOT_INO as usize - 1) * DiskInode::RECORD_SIZE;
    root.write_to(&mut image[slot..slot + DiskInode::RECORD_SIZE]);

    let dir = &mut image[dir..dir + block_size];
    let dir_type = InodeType::Directory.dirent_file_type();
    DirEntry {
        inode: EXT2_ROOT_INO,
        rec_len: 12,
        name_len: 1,
        file_type: dir_type,
        name: b".".to_vec(),
    }
    .write_to(dir, 0);
    DirEntry {
        inode: EXT2_ROOT_INO,
        rec_len: (block_size - 12) as u32,
        name_len: 2,
        file_type: dir_type,
        name: b"..".to_vec(),
    }
    .write_to(dir, 12);
}

/// One group at partition offset 0: superblock in block 0, descriptors in
/// block 1, bitmaps in 2 and 3, inode table in 4, root directory in 5.
fn build_large_block_image(log_block_size: u32) -> Vec<u8> {
    let block_size = 1024usize << log_block_size;
    let mut image = vec![0u8; LARGE_BLOCKS_COUNT as usize * block_size];
    let at = |block: u32| block as usize * block_size;

    let sb = SuperBlock {
        inodes_count: INODES_PER_GROUP,
        blocks_count: LARGE_BLOCKS_COUNT,
        free_blocks_count: LARGE_FREE_BLOCKS,
        free_inodes_count: INODES_PER_GROUP - 10,
        first_data_block: 0,
        log_block_size,
        blocks_per_group: LARGE_BLOCKS_COUNT,
        inodes_per_group: INODES_PER_GROUP,
        magic: EXT2_SUPER_MAGIC,
        state: 1,
        rev_level: 1,
        first_ino: 11,
        inode_size: 128,
        ..Default::default()
    };
    sb.write_to(&mut image[1024..2048]);

    let gd = GroupDescriptor {
        block_bitmap: 2,
        inode_bitmap: 3,
        inode_table: 4,
        free_blocks_count: LARGE_FREE_BLOCKS as u16,
        free_inodes_count: (INODES_PER_GROUP - 10) as u16,
        used_dirs_count: 1,
    };
    gd.write_to(&mut image[at(1)..at(1) + GROUP_DESC_SIZE]);

    {
        let bitmap = &mut image[at(2)..at(3)];
        set_bits(bitmap, 0..=5);
        bitmap[LARGE_BLOCKS_COUNT as usize / 8..].fill(0xFF);
    }
    {
        let bitmap = &mut image[at(3)..at(4)];
        set_bits(bitmap, 0..=9);
        bitmap[INODES_PER_GROUP as usize / 8..].fill(0xFF);
    }

    let (table, dir) = (at(4), at(5));
    write_root(&mut image, table, dir, block_size, 5);
    image
}

pub fn config() -> MountConfig {
    MountConfig::new(DRIVE, PARTITION_OFFSET)
}

pub fn fresh_disk() -> Arc<RamDisk> {
    Arc::new(RamDisk::from_image(DRIVE, BASE_IMAGE.clone()))
}

pub fn remount(disk: &Arc<RamDisk>) -> Ext2FileSystem {
    Ext2FileSystem::mount(disk.clone(), config()).unwrap()
}

pub fn mount_fresh() -> (Arc<RamDisk>, Ext2FileSystem) {
    let disk = fresh_disk();
    let fs = remount(&disk);
    (disk, fs)
}

/// A one-group volume with `1024 << log_block_size` byte blocks.
pub fn large_block_disk(log_block_size: u32) -> Arc<RamDisk> {
    let image = if log_block_size == LARGE_LOG_BLOCK_SIZE {
        LARGE_BLOCK_IMAGE.clone()
    } else {
        build_large_block_image(log_block_size)
    };
    Arc::new(RamDisk::from_image(DRIVE, image))
}

pub fn remount_large_block(disk: &Arc<RamDisk>) -> Ext2FileSystem {
    Ext2FileSystem::mount(disk.clone(), MountConfig::new(DRIVE, 0)).unwrap()
}

pub fn mount_large_block(log_block_size: u32) -> (Arc<RamDisk>, Ext2FileSystem) {
    let disk = large_block_disk(log_block_size);
    let fs = remount_large_block(&disk);
    (disk, fs)
}

/// Rewrites the on-disk superblock through `patch` before a mount attempt.
pub fn patch_superblock(disk: &RamDisk, patch: impl FnOnce(&mut SuperBlock)) {
    let lba = PARTITION_OFFSET + 2;
    let mut buf = vec![0u8; 2 * SECTOR_SIZE];
    disk.read_sectors(DRIVE, lba, 2, &mut buf).unwrap();
    let mut sb = SuperBlock::parse(&buf);
    patch(&mut sb);
    sb.write_to(&mut buf);
    disk.write_sectors(DRIVE, lba, 2, &buf).unwrap();
}
