//! Bitmap allocators for blocks and inodes.
//!
//! Each call re-reads the group's bitmap from disk and writes back the
//! bitmap, the group descriptor and the superblock before returning, so the
//! bitmap bits and both free counters agree on disk after every successful
//! call.

use crate::bitmap::Bitmap;
use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;

impl Ext2FileSystem {
    /// Valid block bits in `group`; the last group may be short.
    fn group_block_count(&self, group: usize) -> usize {
        let sb = &self.superblock;
        let start = group as u64 * sb.blocks_per_group as u64;
        let data_blocks = sb.blocks_count.saturating_sub(sb.first_data_block) as u64;
        data_blocks.saturating_sub(start).min(sb.blocks_per_group as u64) as usize
    }

    fn group_inode_count(&self, group: usize) -> usize {
        let sb = &self.superblock;
        let start = group as u64 * sb.inodes_per_group as u64;
        (sb.inodes_count as u64).saturating_sub(start).min(sb.inodes_per_group as u64) as usize
    }

    /// Claims the first clear bit of a bitmap block, or `None` if it is full.
    fn alloc_from_bitmap(&self, bitmap_block: u32, limit: usize) -> Result<Option<usize>> {
        if bitmap_block == 0 {
            return Err(FileSystemError::InvalidFileSystem);
        }
        let mut buf = self.read_block_vec(bitmap_block)?;
        let mut bitmap = Bitmap::new(&mut buf, limit);
        let Some(bit) = bitmap.first_zero() else {
            return Ok(None);
        };
        bitmap.set(bit);
        self.write_block(bitmap_block, &buf)?;
        Ok(Some(bit))
    }

    fn free_in_bitmap(&self, bitmap_block: u32, bit: usize) -> Result<()> {
        if bitmap_block == 0 {
            return Err(FileSystemError::InvalidFileSystem);
        }
        let mut buf = self.read_block_vec(bitmap_block)?;
        let mut bitmap = Bitmap::new(&mut buf, bit + 1);
        if !bitmap.is_set(bit) {
            warn!("ext2: double free of bit {} in bitmap block {}", bit, bitmap_block);
            return Err(FileSystemError::InvalidFileSystem);
        }
        bitmap.clear(bit);
        self.write_block(bitmap_block, &buf)
    }

    fn persist_counters(&self, group: usize) -> Result<()> {
        self.write_group_descriptor(group)?;
        self.write_superblock()
    }

    /// Allocates one block, scanning groups in ascending order.
    ///
    /// Fails with `Exhausted` when no group has a free block.
    pub fn alloc_block(&mut self) -> Result<u32> {
        for group in 0..self.groups.len() {
            if self.groups[group].free_blocks_count == 0 {
                continue;
            }
            let limit = self.group_block_count(group);
            let Some(bit) = self.alloc_from_bitmap(self.groups[group].block_bitmap, limit)? else {
                warn!(
                    "ext2: group {} claims {} free blocks but its bitmap is full",
                    group, self.groups[group].free_blocks_count
                );
                continue;
            };
            self.groups[group].free_blocks_count -= 1;
            self.superblock.free_blocks_count = self.superblock.free_blocks_count.saturating_sub(1);
            self.persist_counters(group)?;

            let block = group as u32 * self.superblock.blocks_per_group
                + bit as u32
                + self.superblock.first_data_block;
            debug!("ext2: allocated block {} (group {}, bit {})", block, group, bit);
            return Ok(block);
        }
        Err(FileSystemError::Exhausted)
    }

    pub fn free_block(&mut self, block: u32) -> Result<()> {
        let sb = &self.superblock;
        if block == 0 || block < sb.first_data_block || block >= sb.blocks_count {
            warn!("ext2: refusing to free block {}", block);
            return Err(FileSystemError::InvalidFileSystem);
        }
        let rel = block - sb.first_data_block;
        let group = (rel / sb.blocks_per_group) as usize;
        let bit = (rel % sb.blocks_per_group) as usize;
        let bitmap_block = self
            .groups
            .get(group)
            .ok_or(FileSystemError::InvalidFileSystem)?
            .block_bitmap;

        self.free_in_bitmap(bitmap_block, bit)?;
        self.groups[group].free_blocks_count += 1;
        self.superblock.free_blocks_count += 1;
        self.persist_counters(group)?;
        debug!("ext2: freed block {}", block);
        Ok(())
    }

    /// Allocates one inode. Inode numbers are 1-based.
    pub fn alloc_inode(&mut self) -> Result<u32> {
        for group in 0..self.groups.len() {
            if self.groups[group].free_inodes_count == 0 {
                continue;
            }
            let limit = self.group_inode_count(group);
            let Some(bit) = self.alloc_from_bitmap(self.groups[group].inode_bitmap, limit)? else {
                warn!(
                    "ext2: group {} claims {} free inodes but its bitmap is full",
                    group, self.groups[group].free_inodes_count
                );
                continue;
            };
            self.groups[group].free_inodes_count -= 1;
            self.superblock.free_inodes_count = self.superblock.free_inodes_count.saturating_sub(1);
            self.persist_counters(group)?;

            let inode = group as u32 * self.superblock.inodes_per_group + bit as u32 + 1;
            debug!("ext2: allocated inode {}", inode);
            return Ok(inode);
        }
        Err(FileSystemError::Exhausted)
    }

    pub fn free_inode(&mut self, inode: u32) -> Result<()> {
        if inode < self.superblock.first_inode() || inode > self.superblock.inodes_count {
            warn!("ext2: refusing to free inode {}", inode);
            return Err(FileSystemError::InvalidFileSystem);
        }
        let index = inode - 1;
        let group = (index / self.superblock.inodes_per_group) as usize;
        let bit = (index % self.superblock.inodes_per_group) as usize;
        let bitmap_block = self
            .groups
            .get(group)
            .ok_or(FileSystemError::InvalidFileSystem)?
            .inode_bitmap;

        self.free_in_bitmap(bitmap_block, bit)?;
        self.groups[group].free_inodes_count += 1;
        self.superblock.free_inodes_count += 1;
        self.persist_counters(group)?;
        debug!("ext2: freed inode {}", inode);
        Ok(())
    }

    /// Frees a block that never got linked while unwinding a failed
    /// operation. A failure here leaks the block and is only logged.
    pub(crate) fn discard_block(&mut self, block: u32) {
        if let Err(e) = self.free_block(block) {
            warn!("ext2: leaked block {} while unwinding: {}", block, e);
        }
    }

    pub(crate) fn discard_inode(&mut self, inode: u32) {
        if let Err(e) = self.free_inode(inode) {
            warn!("ext2: leaked inode {} while unwinding: {}", inode, e);
        }
    }

    /// Recounts every bitmap and compares the result with the group and
    /// superblock free counters.
    pub fn verify_counters(&self) -> Result<()> {
        let mut free_blocks = 0u64;
        let mut free_inodes = 0u64;
        for (group, gd) in self.groups.iter().enumerate() {
            let mut buf = self.read_block_vec(gd.block_bitmap)?;
            let blocks = Bitmap::new(&mut buf, self.group_block_count(group)).count_zeros();
            let mut buf = self.read_block_vec(gd.inode_bitmap)?;
            let inodes = Bitmap::new(&mut buf, self.group_inode_count(group)).count_zeros();
            if blocks != gd.free_blocks_count as usize || inodes != gd.free_inodes_count as usize {
                warn!(
                    "ext2: group {} counters {}/{} disagree with bitmaps {}/{}",
                    group, gd.free_blocks_count, gd.free_inodes_count, blocks, inodes
                );
                return Err(FileSystemError::InvalidFileSystem);
            }
            free_blocks += blocks as u64;
            free_inodes += inodes as u64;
        }
        if free_blocks != self.superblock.free_blocks_count as u64
            || free_inodes != self.superblock.free_inodes_count as u64
        {
            warn!("ext2: superblock free counters disagree with group totals");
            return Err(FileSystemError::InvalidFileSystem);
        }
        Ok(())
    }

    /// Adjusts the owning group's directory count after a mkdir or rmdir.
    pub(crate) fn adjust_used_dirs(&mut self, inode: u32, created: bool) -> Result<()> {
        let group = ((inode - 1) / self.superblock.inodes_per_group) as usize;
        let gd = self.groups.get_mut(group).ok_or(FileSystemError::InvalidFileSystem)?;
        gd.used_dirs_count = if created {
            gd.used_dirs_count.saturating_add(1)
        } else {
            gd.used_dirs_count.saturating_sub(1)
        };
        self.write_group_descriptor(group)
    }
}
