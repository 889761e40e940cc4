use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;
use crate::layout::DiskInode;

impl Ext2FileSystem {
    /// Table block and byte offset of inode `inode_num`'s record.
    fn locate_inode(&self, inode_num: u32) -> Result<(u32, usize)> {
        if inode_num == 0 || inode_num > self.superblock.inodes_count {
            warn!("ext2: inode {} out of range", inode_num);
            return Err(FileSystemError::InvalidFileSystem);
        }
        // ext2 inode numbers start at 1
        let idx = (inode_num - 1) as usize;
        let ipg = self.superblock.inodes_per_group as usize;
        let (group, local) = (idx / ipg, idx % ipg);
        let gd = self.groups.get(group).ok_or(FileSystemError::InvalidFileSystem)?;

        let byte_offset = local * self.inode_size;
        let block = gd.inode_table + (byte_offset / self.block_size) as u32;
        Ok((block, byte_offset % self.block_size))
    }

    pub fn read_inode(&self, inode_num: u32) -> Result<DiskInode> {
        let (block, offset) = self.locate_inode(inode_num)?;
        let buf = self.read_block_vec(block)?;
        Ok(DiskInode::parse(&buf[offset..offset + DiskInode::RECORD_SIZE]))
    }

    /// Splices `inode` into its table block. Neighbouring records and any
    /// bytes past the first 128 of a large record are preserved.
    pub fn write_inode(&self, inode_num: u32, inode: &DiskInode) -> Result<()> {
        let (block, offset) = self.locate_inode(inode_num)?;
        let mut buf = self.read_block_vec(block)?;
        inode.write_to(&mut buf[offset..offset + DiskInode::RECORD_SIZE]);
        self.write_block(block, &buf)
    }
}
