//! Logical-to-physical block mapping through the inode's pointer tree.
//!
//! Logical indices `[0, 12)` are direct, `[12, 12 + E)` go through the
//! single-indirect block and `[12 + E, 12 + E + E * E)` through the
//! double-indirect block, with `E = block_size / 4`. Triple-indirect
//! blocks are never mapped, only released.

use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;
use crate::layout::{
    DIND_BLOCK, DIRECT_BLOCKS, DiskInode, IND_BLOCK, N_BLOCKS, TIND_BLOCK, read_u32, write_u32,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Direct(usize),
    Single(usize),
    Double(usize, usize),
    Beyond,
}

impl Ext2FileSystem {
    fn classify(&self, index: u32) -> Slot {
        let e = self.ptrs_per_block() as u64;
        let mut i = index as u64;
        if i < DIRECT_BLOCKS as u64 {
            return Slot::Direct(i as usize);
        }
        i -= DIRECT_BLOCKS as u64;
        if i < e {
            return Slot::Single(i as usize);
        }
        i -= e;
        if i < e * e {
            return Slot::Double((i / e) as usize, (i % e) as usize);
        }
        Slot::Beyond
    }

    /// Number of logical blocks a file can address.
    pub(crate) fn max_file_blocks(&self) -> u64 {
        let e = self.ptrs_per_block() as u64;
        DIRECT_BLOCKS as u64 + e + e * e
    }

    fn read_ptr(&self, table: u32, slot: usize) -> Result<u32> {
        let buf = self.read_block_vec(table)?;
        Ok(read_u32(&buf, slot * 4))
    }

    /// Physical block backing logical block `index` of `inode`.
    ///
    /// Returns 0 for a hole and for indices past the double-indirect range.
    pub fn resolve(&self, inode: &DiskInode, index: u32) -> Result<u32> {
        match self.classify(index) {
            Slot::Direct(i) => Ok(inode.block[i]),
            Slot::Single(i) => {
                let ind = inode.block[IND_BLOCK];
                if ind == 0 {
                    return Ok(0);
                }
                self.read_ptr(ind, i)
            }
            Slot::Double(outer, inner) => {
                let dind = inode.block[DIND_BLOCK];
                if dind == 0 {
                    return Ok(0);
                }
                let ind = self.read_ptr(dind, outer)?;
                if ind == 0 {
                    return Ok(0);
                }
                self.read_ptr(ind, inner)
            }
            Slot::Beyond => Ok(0),
        }
    }

    /// Counts a newly linked block against `i_blocks`.
    fn charge(&self, inode: &mut DiskInode) {
        inode.blocks += self.sectors_per_block();
    }

    /// Indirect blocks start zeroed so unset slots read as holes.
    fn alloc_indirect_block(&mut self) -> Result<u32> {
        let block = self.alloc_block()?;
        if let Err(e) = self.zero_block(block) {
            self.discard_block(block);
            return Err(e);
        }
        Ok(block)
    }

    fn ensure_root(&mut self, inode: &mut DiskInode, which: usize) -> Result<u32> {
        if inode.block[which] == 0 {
            inode.block[which] = self.alloc_indirect_block()?;
            self.charge(inode);
        }
        Ok(inode.block[which])
    }

    /// Fills slot `slot` of indirect block `table` if it is empty. The new
    /// block is charged to `inode` only once the table points at it.
    fn ensure_ptr(
        &mut self,
        inode: &mut DiskInode,
        table: u32,
        slot: usize,
        indirect: bool,
    ) -> Result<(u32, bool)> {
        let mut buf = self.read_block_vec(table)?;
        let existing = read_u32(&buf, slot * 4);
        if existing != 0 {
            return Ok((existing, false));
        }
        let block = if indirect {
            self.alloc_indirect_block()?
        } else {
            self.alloc_block()?
        };
        write_u32(&mut buf, slot * 4, block);
        if let Err(e) = self.write_block(table, &buf) {
            self.discard_block(block);
            return Err(e);
        }
        self.charge(inode);
        Ok((block, true))
    }

    /// Like [`resolve`](Self::resolve), but allocates the data block and any
    /// missing indirect blocks on the way. The flag is true when the data
    /// block is new; its on-disk contents are then undefined.
    ///
    /// Updates `inode.block` and `inode.blocks` in memory only; the caller
    /// writes the inode back.
    pub(crate) fn map_or_alloc(
        &mut self,
        inode: &mut DiskInode,
        index: u32,
    ) -> Result<(u32, bool)> {
        match self.classify(index) {
            Slot::Direct(i) => {
                if inode.block[i] != 0 {
                    return Ok((inode.block[i], false));
                }
                let block = self.alloc_block()?;
                inode.block[i] = block;
                self.charge(inode);
                Ok((block, true))
            }
            Slot::Single(i) => {
                let ind = self.ensure_root(inode, IND_BLOCK)?;
                self.ensure_ptr(inode, ind, i, false)
            }
            Slot::Double(outer, inner) => {
                let dind = self.ensure_root(inode, DIND_BLOCK)?;
                let (ind, _) = self.ensure_ptr(inode, dind, outer, true)?;
                self.ensure_ptr(inode, ind, inner, false)
            }
            Slot::Beyond => Err(FileSystemError::FileTooLarge),
        }
    }

    fn release_tree(&mut self, block: u32, depth: u32, accounted: &mut u32) -> Result<()> {
        if depth > 0 {
            let buf = self.read_block_vec(block)?;
            for slot in 0..self.ptrs_per_block() {
                let child = read_u32(&buf, slot * 4);
                if child != 0 {
                    self.release_tree(child, depth - 1, accounted)?;
                }
            }
        }
        self.free_block(block)?;
        *accounted = accounted.saturating_sub(self.sectors_per_block());
        Ok(())
    }

    /// Frees every data and indirect block of `inode` and clears its
    /// pointers. Size and the on-disk record are left to the caller.
    pub(crate) fn release_blocks(&mut self, inode: &mut DiskInode) -> Result<()> {
        for i in 0..N_BLOCKS {
            let block = inode.block[i];
            if block == 0 {
                continue;
            }
            let depth = match i {
                IND_BLOCK => 1,
                DIND_BLOCK => 2,
                TIND_BLOCK => 3,
                _ => 0,
            };
            self.release_tree(block, depth, &mut inode.blocks)?;
            inode.block[i] = 0;
        }
        Ok(())
    }
}
