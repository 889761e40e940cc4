//! On-disk ext2 records.
//!
//! Every structure is decoded from and encoded into byte buffers field by
//! field at its fixed little-endian offset, so the in-memory layout of these
//! types never has to match the disk.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT2_ROOT_INO: u32 = 2;

/// Byte offset of the superblock from the start of the partition.
pub const SUPERBLOCK_OFFSET: usize = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const GROUP_DESC_SIZE: usize = 32;
pub const GOOD_OLD_INODE_SIZE: usize = 128;
pub const GOOD_OLD_FIRST_INO: u32 = 11;

pub const DIRECT_BLOCKS: usize = 12;
pub const IND_BLOCK: usize = 12;
pub const DIND_BLOCK: usize = 13;
/// Reserved by the format; files never reach it here.
pub const TIND_BLOCK: usize = 14;
pub const N_BLOCKS: usize = 15;

pub const MAX_NAME_LEN: usize = 255;

/// Largest directory block whose record lengths the on-disk `u16` can
/// express. Past 64 KiB the low two bits carry bits 16 and 17.
pub const MAX_DIR_BLOCK_SIZE: usize = 1 << 18;
const REC_LEN_MAX: u16 = 0xFFFF;

pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

pub(crate) fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

/// Decodes a stored `rec_len` into a byte span.
pub(crate) fn rec_len_from_disk(raw: u16, block_size: usize) -> usize {
    let len = raw as usize;
    if block_size < 0x1_0000 {
        return len;
    }
    if raw == REC_LEN_MAX || raw == 0 {
        return block_size;
    }
    (len & 0xFFFC) | ((len & 3) << 16)
}

/// Encodes a record span for the `rec_len` field. Only valid for blocks up
/// to [`MAX_DIR_BLOCK_SIZE`].
pub(crate) fn rec_len_to_disk(len: usize, block_size: usize) -> u16 {
    if len < 0x1_0000 {
        return len as u16;
    }
    if len == block_size {
        return if block_size == 0x1_0000 { REC_LEN_MAX } else { 0 };
    }
    ((len & 0xFFFC) | ((len >> 16) & 3)) as u16
}

/// NUL-trimmed volume label, empty when it is not UTF-8.
pub(crate) fn volume_label(raw: &[u8; 16]) -> &str {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..len]).unwrap_or("")
}

/// The filesystem-wide metadata record at byte 1024 of the partition.
///
/// Only the fields this driver reads or maintains are decoded; the rest of
/// the on-disk record is left untouched by [`SuperBlock::write_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuperBlock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub r_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    // revision 1 fields
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub volume_name: [u8; 16],
}

impl SuperBlock {
    pub fn parse(buf: &[u8]) -> Self {
        let mut volume_name = [0u8; 16];
        volume_name.copy_from_slice(&buf[120..136]);
        Self {
            inodes_count: read_u32(buf, 0),
            blocks_count: read_u32(buf, 4),
            r_blocks_count: read_u32(buf, 8),
            free_blocks_count: read_u32(buf, 12),
            free_inodes_count: read_u32(buf, 16),
            first_data_block: read_u32(buf, 20),
            log_block_size: read_u32(buf, 24),
            blocks_per_group: read_u32(buf, 32),
            inodes_per_group: read_u32(buf, 40),
            mtime: read_u32(buf, 44),
            wtime: read_u32(buf, 48),
            mnt_count: read_u16(buf, 52),
            magic: read_u16(buf, 56),
            state: read_u16(buf, 58),
            rev_level: read_u32(buf, 76),
            first_ino: read_u32(buf, 84),
            inode_size: read_u16(buf, 88),
            feature_compat: read_u32(buf, 92),
            feature_incompat: read_u32(buf, 96),
            feature_ro_compat: read_u32(buf, 100),
            volume_name,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.inodes_count);
        write_u32(buf, 4, self.blocks_count);
        write_u32(buf, 8, self.r_blocks_count);
        write_u32(buf, 12, self.free_blocks_count);
        write_u32(buf, 16, self.free_inodes_count);
        write_u32(buf, 20, self.first_data_block);
        write_u32(buf, 24, self.log_block_size);
        write_u32(buf, 32, self.blocks_per_group);
        write_u32(buf, 40, self.inodes_per_group);
        write_u32(buf, 44, self.mtime);
        write_u32(buf, 48, self.wtime);
        write_u16(buf, 52, self.mnt_count);
        write_u16(buf, 56, self.magic);
        write_u16(buf, 58, self.state);
        write_u32(buf, 76, self.rev_level);
        write_u32(buf, 84, self.first_ino);
        write_u16(buf, 88, self.inode_size);
        write_u32(buf, 92, self.feature_compat);
        write_u32(buf, 96, self.feature_incompat);
        write_u32(buf, 100, self.feature_ro_compat);
        buf[120..136].copy_from_slice(&self.volume_name);
    }

    /// Inode record size; revision 0 volumes always use 128 bytes.
    pub fn inode_record_size(&self) -> usize {
        if self.rev_level == 0 {
            GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size as usize
        }
    }

    pub fn first_inode(&self) -> u32 {
        if self.rev_level == 0 {
            GOOD_OLD_FIRST_INO
        } else {
            self.first_ino
        }
    }

    pub fn volume_name(&self) -> &str {
        volume_label(&self.volume_name)
    }
}

/// One entry of the block group descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDescriptor {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            block_bitmap: read_u32(buf, 0),
            inode_bitmap: read_u32(buf, 4),
            inode_table: read_u32(buf, 8),
            free_blocks_count: read_u16(buf, 12),
            free_inodes_count: read_u16(buf, 14),
            used_dirs_count: read_u16(buf, 16),
        }
    }

    /// Padding and reserved bytes keep whatever the buffer held.
    pub fn write_to(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.block_bitmap);
        write_u32(buf, 4, self.inode_bitmap);
        write_u32(buf, 8, self.inode_table);
        write_u16(buf, 12, self.free_blocks_count);
        write_u16(buf, 14, self.free_inodes_count);
        write_u16(buf, 16, self.used_dirs_count);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    File,
    Directory,
    SymLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

impl InodeType {
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => InodeType::File,
            S_IFDIR => InodeType::Directory,
            S_IFLNK => InodeType::SymLink,
            S_IFCHR => InodeType::CharDevice,
            S_IFBLK => InodeType::BlockDevice,
            S_IFIFO => InodeType::Fifo,
            S_IFSOCK => InodeType::Socket,
            _ => InodeType::Unknown,
        }
    }

    pub fn mode_bits(self) -> u16 {
        match self {
            InodeType::File => S_IFREG,
            InodeType::Directory => S_IFDIR,
            InodeType::SymLink => S_IFLNK,
            InodeType::CharDevice => S_IFCHR,
            InodeType::BlockDevice => S_IFBLK,
            InodeType::Fifo => S_IFIFO,
            InodeType::Socket => S_IFSOCK,
            InodeType::Unknown => 0,
        }
    }

    /// Value stored in a directory entry's `file_type` byte.
    pub fn dirent_file_type(self) -> u8 {
        match self {
            InodeType::Unknown => 0,
            InodeType::File => 1,
            InodeType::Directory => 2,
            InodeType::CharDevice => 3,
            InodeType::BlockDevice => 4,
            InodeType::Fifo => 5,
            InodeType::Socket => 6,
            InodeType::SymLink => 7,
        }
    }
}

bitflags! {
    /// Permission bits of `i_mode`. Stored, never enforced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FilePerm: u16 {
        const S_ISUID = 0o4000;
        const S_ISGID = 0o2000;
        const S_ISVTX = 0o1000;
        const S_IRUSR = 0o0400;
        const S_IWUSR = 0o0200;
        const S_IXUSR = 0o0100;
        const S_IRGRP = 0o0040;
        const S_IWGRP = 0o0020;
        const S_IXGRP = 0o0010;
        const S_IROTH = 0o0004;
        const S_IWOTH = 0o0002;
        const S_IXOTH = 0o0001;
    }
}

/// An inode record. Only the first 128 bytes are decoded; larger records
/// keep their tail intact because writes go through read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    /// Allocated space in 512-byte units.
    pub blocks: u32,
    pub flags: u32,
    pub osd1: u32,
    pub block: [u32; N_BLOCKS],
    pub generation: u32,
    pub file_acl: u32,
    pub dir_acl: u32,
    pub faddr: u32,
    pub osd2: [u8; 12],
}

impl DiskInode {
    pub const RECORD_SIZE: usize = GOOD_OLD_INODE_SIZE;

    pub fn new(kind: InodeType, perm: FilePerm, now: u32) -> Self {
        Self {
            mode: kind.mode_bits() | perm.bits(),
            atime: now,
            ctime: now,
            mtime: now,
            ..Default::default()
        }
    }

    pub fn parse(buf: &[u8]) -> Self {
        let mut block = [0u32; N_BLOCKS];
        for (i, b) in block.iter_mut().enumerate() {
            *b = read_u32(buf, 40 + i * 4);
        }
        let mut osd2 = [0u8; 12];
        osd2.copy_from_slice(&buf[116..128]);
        Self {
            mode: read_u16(buf, 0),
            uid: read_u16(buf, 2),
            size: read_u32(buf, 4),
            atime: read_u32(buf, 8),
            ctime: read_u32(buf, 12),
            mtime: read_u32(buf, 16),
            dtime: read_u32(buf, 20),
            gid: read_u16(buf, 24),
            links_count: read_u16(buf, 26),
            blocks: read_u32(buf, 28),
            flags: read_u32(buf, 32),
            osd1: read_u32(buf, 36),
            block,
            generation: read_u32(buf, 100),
            file_acl: read_u32(buf, 104),
            dir_acl: read_u32(buf, 108),
            faddr: read_u32(buf, 112),
            osd2,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        write_u16(buf, 0, self.mode);
        write_u16(buf, 2, self.uid);
        write_u32(buf, 4, self.size);
        write_u32(buf, 8, self.atime);
        write_u32(buf, 12, self.ctime);
        write_u32(buf, 16, self.mtime);
        write_u32(buf, 20, self.dtime);
        write_u16(buf, 24, self.gid);
        write_u16(buf, 26, self.links_count);
        write_u32(buf, 28, self.blocks);
        write_u32(buf, 32, self.flags);
        write_u32(buf, 36, self.osd1);
        for (i, b) in self.block.iter().enumerate() {
            write_u32(buf, 40 + i * 4, *b);
        }
        write_u32(buf, 100, self.generation);
        write_u32(buf, 104, self.file_acl);
        write_u32(buf, 108, self.dir_acl);
        write_u32(buf, 112, self.faddr);
        buf[116..128].copy_from_slice(&self.osd2);
    }

    pub fn inode_type(&self) -> InodeType {
        InodeType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn perm(&self) -> FilePerm {
        FilePerm::from_bits_truncate(self.mode)
    }
}

/// A directory record, copied out of a directory block.
///
/// `parse` and `write_to` take the whole directory block: its length is the
/// block size the `rec_len` encoding depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    /// Decoded span of the record in bytes.
    pub rec_len: u32,
    pub name_len: u8,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    pub const HEADER_LEN: usize = 8;

    /// Bytes a record with a name of `name_len` bytes needs, padded to 4.
    pub fn ideal_len(name_len: usize) -> usize {
        align_up(Self::HEADER_LEN + name_len, 4)
    }

    /// Decodes the record at `offset`, or `None` when its header or name
    /// would run past the end of `block`.
    pub fn parse(block: &[u8], offset: usize) -> Option<Self> {
        if offset + Self::HEADER_LEN > block.len() {
            return None;
        }
        let name_len = block[offset + 6];
        let name_start = offset + Self::HEADER_LEN;
        let name_end = name_start + name_len as usize;
        if name_end > block.len() {
            return None;
        }
        Some(Self {
            inode: read_u32(block, offset),
            rec_len: rec_len_from_disk(read_u16(block, offset + 4), block.len()) as u32,
            name_len,
            file_type: block[offset + 7],
            name: block[name_start..name_end].to_vec(),
        })
    }

    pub fn write_to(&self, block: &mut [u8], offset: usize) {
        write_u32(block, offset, self.inode);
        let raw = rec_len_to_disk(self.rec_len as usize, block.len());
        write_u16(block, offset + 4, raw);
        block[offset + 6] = self.name_len;
        block[offset + 7] = self.file_type;
        let name_start = offset + Self::HEADER_LEN;
        block[name_start..name_start + self.name.len()].copy_from_slice(&self.name);
    }

    pub fn name_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.name).ok()
    }

    pub fn is_dir(&self) -> bool {
        self.file_type == InodeType::Directory.dirent_file_type()
    }
}

impl fmt::Display for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.is_dir() { "[DIR] " } else { "[FILE]" };
        write!(f, "{} {}", tag, self.name_str().unwrap_or("?"))
    }
}
