//! Directory blocks: lookup, insertion and removal of entries.
//!
//! Records are 4-byte aligned and the last record of a block spans to its
//! end. A record with inode 0 ends the scan of its block; removal keeps
//! that safe by only ever leaving such a record at the start of an
//! otherwise empty block.

use alloc::vec::Vec;

use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;
use crate::layout::{
    DirEntry, DiskInode, MAX_DIR_BLOCK_SIZE, MAX_NAME_LEN, ceil_div, read_u16, rec_len_from_disk,
    rec_len_to_disk, write_u16, write_u32,
};

/// Walks the live records of one directory block.
struct BlockEntries<'a> {
    block: &'a [u8],
    offset: usize,
}

fn entries(block: &[u8]) -> BlockEntries<'_> {
    entries_from(block, 0)
}

fn entries_from(block: &[u8], offset: usize) -> BlockEntries<'_> {
    BlockEntries { block, offset }
}

fn set_rec_len(block: &mut [u8], offset: usize, len: usize) {
    let raw = rec_len_to_disk(len, block.len());
    write_u16(block, offset + 4, raw);
}

impl Iterator for BlockEntries<'_> {
    type Item = (usize, DirEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = DirEntry::parse(self.block, self.offset)?;
        let rec_len = entry.rec_len as usize;
        if entry.inode == 0
            || rec_len < DirEntry::HEADER_LEN + entry.name_len as usize
            || self.offset + rec_len > self.block.len()
        {
            self.offset = self.block.len();
            return None;
        }
        let at = self.offset;
        self.offset += rec_len;
        Some((at, entry))
    }
}

/// Writes `entry` into free space of `block`, fixing up `entry.rec_len`.
/// Returns false when no record has enough slack.
fn place_entry(block: &mut [u8], entry: &mut DirEntry) -> bool {
    let needed = DirEntry::ideal_len(entry.name.len());

    if let Some(first) = DirEntry::parse(block, 0) {
        if first.inode == 0 {
            let rec_len = match first.rec_len as usize {
                0 => block.len(),
                len => len,
            };
            if rec_len >= needed && rec_len <= block.len() {
                entry.rec_len = rec_len as u32;
                entry.write_to(block, 0);
                return true;
            }
        }
    }

    let slot = entries(block).find_map(|(offset, e)| {
        let used = DirEntry::ideal_len(e.name_len as usize);
        let rec_len = e.rec_len as usize;
        (rec_len >= used + needed).then_some((offset, used, rec_len))
    });
    let Some((offset, used, rec_len)) = slot else {
        return false;
    };
    set_rec_len(block, offset, used);
    entry.rec_len = (rec_len - used) as u32;
    entry.write_to(block, offset + used);
    true
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(FileSystemError::InvalidPath);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FileSystemError::NameTooLong);
    }
    Ok(())
}

impl Ext2FileSystem {
    /// Directory records cannot describe spans of blocks past 256 KiB, so
    /// such volumes are read-only as far as the namespace goes.
    pub(crate) fn check_dir_writable(&self) -> Result<()> {
        if self.block_size > MAX_DIR_BLOCK_SIZE {
            warn!("ext2: {} byte blocks cannot hold directory records", self.block_size);
            return Err(FileSystemError::UnsupportedBlockSize);
        }
        Ok(())
    }

    fn dir_block_count(&self, dir: &DiskInode) -> u32 {
        ceil_div(dir.size as usize, self.block_size) as u32
    }

    pub fn find_dirent(&self, dir: &DiskInode, name: &str) -> Result<Option<DirEntry>> {
        if !dir.is_dir() {
            return Err(FileSystemError::NotADirectory);
        }
        let mut buf = self.new_block_buf()?;
        for index in 0..self.dir_block_count(dir) {
            let block = self.resolve(dir, index)?;
            if block == 0 {
                continue;
            }
            self.read_block(block, &mut buf)?;
            if let Some((_, entry)) = entries(&buf).find(|(_, e)| e.name == name.as_bytes()) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Every live entry of `dir`, `.` and `..` included, in on-disk order.
    pub fn read_dir(&self, dir: &DiskInode) -> Result<Vec<DirEntry>> {
        if !dir.is_dir() {
            return Err(FileSystemError::NotADirectory);
        }
        let mut out = Vec::new();
        let mut buf = self.new_block_buf()?;
        for index in 0..self.dir_block_count(dir) {
            let block = self.resolve(dir, index)?;
            if block == 0 {
                continue;
            }
            self.read_block(block, &mut buf)?;
            for (_, entry) in entries(&buf) {
                out.try_reserve(1).map_err(|_| FileSystemError::OutOfMemory)?;
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub(crate) fn dir_is_empty(&self, dir: &DiskInode) -> Result<bool> {
        Ok(self
            .read_dir(dir)?
            .iter()
            .all(|e| e.name == b"." || e.name == b".."))
    }

    /// Links `name` to `inode` inside directory `dir` (inode number `dir_ino`).
    ///
    /// Uses slack in an existing block when there is any, otherwise appends
    /// a block. The directory inode is written back either way.
    pub fn create_dirent(
        &mut self,
        dir: &mut DiskInode,
        dir_ino: u32,
        name: &str,
        inode: u32,
        file_type: u8,
    ) -> Result<()> {
        self.check_dir_writable()?;
        check_name(name)?;
        if self.find_dirent(dir, name)?.is_some() {
            return Err(FileSystemError::AlreadyExists);
        }
        let mut entry = DirEntry {
            inode,
            rec_len: 0,
            name_len: name.len() as u8,
            file_type,
            name: name.as_bytes().to_vec(),
        };

        let count = self.dir_block_count(dir);
        let mut buf = self.new_block_buf()?;
        for index in 0..count {
            let block = self.resolve(dir, index)?;
            if block == 0 {
                continue;
            }
            self.read_block(block, &mut buf)?;
            if place_entry(&mut buf, &mut entry) {
                self.write_block(block, &buf)?;
                debug!("ext2: dirent '{}' -> inode {} in block {}", name, inode, block);
                return self.touch_dir(dir, dir_ino);
            }
        }

        let (block, _) = self.map_or_alloc(dir, count)?;
        buf.fill(0);
        entry.rec_len = self.block_size as u32;
        entry.write_to(&mut buf, 0);
        self.write_block(block, &buf)?;
        dir.size = (count + 1) * self.block_size as u32;
        debug!("ext2: dirent '{}' -> inode {} in new block {}", name, inode, block);
        self.touch_dir(dir, dir_ino)
    }

    /// Unlinks `name` from `dir` and returns the removed record.
    ///
    /// The freed space is merged into the preceding record. The first
    /// record of a block is replaced by its successor, or marked unused
    /// when it is the only one.
    pub fn remove_dirent(
        &mut self,
        dir: &mut DiskInode,
        dir_ino: u32,
        name: &str,
    ) -> Result<DirEntry> {
        if !dir.is_dir() {
            return Err(FileSystemError::NotADirectory);
        }
        self.check_dir_writable()?;
        let mut buf = self.new_block_buf()?;
        for index in 0..self.dir_block_count(dir) {
            let block = self.resolve(dir, index)?;
            if block == 0 {
                continue;
            }
            self.read_block(block, &mut buf)?;

            let mut prev = None;
            let mut hit = None;
            for (offset, entry) in entries(&buf) {
                if entry.name == name.as_bytes() {
                    hit = Some((prev, offset, entry));
                    break;
                }
                prev = Some(offset);
            }
            let Some((prev, offset, entry)) = hit else {
                continue;
            };

            if let Some(prev) = prev {
                let prev_len = rec_len_from_disk(read_u16(&buf, prev + 4), buf.len());
                set_rec_len(&mut buf, prev, prev_len + entry.rec_len as usize);
            } else {
                let next = offset + entry.rec_len as usize;
                let successor = entries_from(&buf, next).next();
                match successor {
                    Some((_, mut successor)) => {
                        successor.rec_len += entry.rec_len;
                        successor.write_to(&mut buf, offset);
                    }
                    None => write_u32(&mut buf, offset, 0),
                }
            }
            self.write_block(block, &buf)?;
            debug!("ext2: removed dirent '{}' (inode {}) from block {}", name, entry.inode, block);
            self.touch_dir(dir, dir_ino)?;
            return Ok(entry);
        }
        Err(FileSystemError::NotFound)
    }

    fn touch_dir(&mut self, dir: &mut DiskInode, dir_ino: u32) -> Result<()> {
        let now = self.now();
        dir.mtime = now;
        dir.ctime = now;
        self.write_inode(dir_ino, dir)
    }
}
