//! Namespace operations: creating, listing and removing files and
//! directories by path.

use alloc::vec::Vec;

use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;
use crate::layout::{DirEntry, DiskInode, FilePerm, InodeType};

/// Metadata of one inode, as reported by [`Ext2FileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub ino: u32,
    pub file_type: InodeType,
    pub perm: FilePerm,
    pub size: u64,
    pub nlink: u16,
    /// Allocated space in 512-byte units.
    pub blocks: u32,
    pub uid: u16,
    pub gid: u16,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl FileStat {
    fn from_inode(ino: u32, inode: &DiskInode) -> Self {
        Self {
            ino,
            file_type: inode.inode_type(),
            perm: inode.perm(),
            size: inode.size as u64,
            nlink: inode.links_count,
            blocks: inode.blocks,
            uid: inode.uid,
            gid: inode.gid,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
        }
    }
}

fn reject_dot_names(name: &str) -> Result<()> {
    if name == "." || name == ".." {
        return Err(FileSystemError::InvalidPath);
    }
    Ok(())
}

impl Ext2FileSystem {
    /// Creates an empty regular file and returns its inode number.
    pub fn create(&mut self, path: &str, mode: u16) -> Result<u32> {
        let (parent_ino, mut parent, name) = self.traverse_parent(path)?;
        reject_dot_names(name)?;
        self.check_dir_writable()?;
        if self.find_dirent(&parent, name)?.is_some() {
            return Err(FileSystemError::AlreadyExists);
        }

        let ino = self.alloc_inode()?;
        let perm = FilePerm::from_bits_truncate(mode);
        let mut inode = DiskInode::new(InodeType::File, perm, self.now());
        inode.links_count = 1;

        let file_type = InodeType::File.dirent_file_type();
        let linked = self
            .write_inode(ino, &inode)
            .and_then(|()| self.create_dirent(&mut parent, parent_ino, name, ino, file_type));
        if let Err(e) = linked {
            self.discard_inode(ino);
            return Err(e);
        }
        info!("ext2: created file {} (inode {})", path, ino);
        Ok(ino)
    }

    /// Creates a directory holding `.` and `..` and returns its inode number.
    pub fn mkdir(&mut self, path: &str, mode: u16) -> Result<u32> {
        let (parent_ino, mut parent, name) = self.traverse_parent(path)?;
        reject_dot_names(name)?;
        self.check_dir_writable()?;
        if self.find_dirent(&parent, name)?.is_some() {
            return Err(FileSystemError::AlreadyExists);
        }

        let ino = self.alloc_inode()?;
        let block = match self.alloc_block() {
            Ok(block) => block,
            Err(e) => {
                self.discard_inode(ino);
                return Err(e);
            }
        };
        if let Err(e) = self.init_directory(ino, block, mode, &mut parent, parent_ino, name) {
            self.discard_block(block);
            self.discard_inode(ino);
            return Err(e);
        }
        self.adjust_used_dirs(ino, true)?;
        info!("ext2: created directory {} (inode {})", path, ino);
        Ok(ino)
    }

    fn init_directory(
        &mut self,
        ino: u32,
        block: u32,
        mode: u16,
        parent: &mut DiskInode,
        parent_ino: u32,
        name: &str,
    ) -> Result<()> {
        let dir_type = InodeType::Directory.dirent_file_type();
        let dot_len = DirEntry::ideal_len(1);
        let mut buf = self.new_block_buf()?;
        DirEntry {
            inode: ino,
            rec_len: dot_len as u32,
            name_len: 1,
            file_type: dir_type,
            name: b".".to_vec(),
        }
        .write_to(&mut buf, 0);
        DirEntry {
            inode: parent_ino,
            rec_len: (self.block_size() - dot_len) as u32,
            name_len: 2,
            file_type: dir_type,
            name: b"..".to_vec(),
        }
        .write_to(&mut buf, dot_len);
        self.write_block(block, &buf)?;

        let perm = FilePerm::from_bits_truncate(mode);
        let mut inode = DiskInode::new(InodeType::Directory, perm, self.now());
        inode.links_count = 2;
        inode.size = self.block_size() as u32;
        inode.blocks = self.sectors_per_block();
        inode.block[0] = block;
        self.write_inode(ino, &inode)?;

        // the child's ".." links back to the parent
        parent.links_count += 1;
        self.create_dirent(parent, parent_ino, name, ino, dir_type)
    }

    /// Removes a non-directory entry. The inode and its blocks are freed
    /// once no links remain.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        let (parent_ino, mut parent, name) = self.traverse_parent(path)?;
        reject_dot_names(name)?;
        let entry = self.find_dirent(&parent, name)?.ok_or(FileSystemError::NotFound)?;
        let mut inode = self.read_inode(entry.inode)?;
        if inode.is_dir() {
            return Err(FileSystemError::IsADirectory);
        }

        self.remove_dirent(&mut parent, parent_ino, name)?;
        inode.links_count = inode.links_count.saturating_sub(1);
        let now = self.now();
        inode.ctime = now;
        if inode.links_count == 0 {
            self.release_blocks(&mut inode)?;
            inode.size = 0;
            inode.dtime = now;
            self.write_inode(entry.inode, &inode)?;
            self.free_inode(entry.inode)?;
        } else {
            self.write_inode(entry.inode, &inode)?;
        }
        info!("ext2: unlinked {} (inode {})", path, entry.inode);
        Ok(())
    }

    /// Removes an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let (parent_ino, mut parent, name) = self.traverse_parent(path)?;
        reject_dot_names(name)?;
        let entry = self.find_dirent(&parent, name)?.ok_or(FileSystemError::NotFound)?;
        let mut inode = self.read_inode(entry.inode)?;
        if !inode.is_dir() {
            return Err(FileSystemError::NotADirectory);
        }
        if !self.dir_is_empty(&inode)? {
            return Err(FileSystemError::DirectoryNotEmpty);
        }

        parent.links_count = parent.links_count.saturating_sub(1);
        self.remove_dirent(&mut parent, parent_ino, name)?;

        self.release_blocks(&mut inode)?;
        inode.links_count = 0;
        inode.size = 0;
        inode.dtime = self.now();
        self.write_inode(entry.inode, &inode)?;
        self.free_inode(entry.inode)?;
        self.adjust_used_dirs(entry.inode, false)?;
        info!("ext2: removed directory {} (inode {})", path, entry.inode);
        Ok(())
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (_, inode) = self.traverse(path)?;
        self.read_dir(&inode)
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let (ino, inode) = self.traverse(path)?;
        Ok(FileStat::from_inode(ino, &inode))
    }
}
