//! Byte-level access to regular files through open handles.

use bitflags::bitflags;

use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;
use crate::layout::DiskInode;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Create the file if the path does not exist.
        const CREATE = 1 << 2;
        /// Drop all data on open. Requires `WRITE`.
        const TRUNCATE = 1 << 3;
        /// Every write goes to end-of-file. Requires `WRITE`.
        const APPEND = 1 << 4;
    }
}

/// Origin of a [`FileHandle::seek`] offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// An open file: a private copy of the inode plus a byte cursor.
///
/// Writes update the copy; it reaches the disk on
/// [`flush`](Ext2FileSystem::flush) or [`close`](Ext2FileSystem::close).
#[derive(Debug)]
#[must_use = "handles that were written to must be closed to persist their inode"]
pub struct FileHandle {
    ino: u32,
    inode: DiskInode,
    position: u64,
    flags: OpenFlags,
    dirty: bool,
}

impl FileHandle {
    pub fn inode_num(&self) -> u32 {
        self.ino
    }

    pub fn inode(&self) -> &DiskInode {
        &self.inode
    }

    pub fn size(&self) -> u64 {
        self.inode.size as u64
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Moves the cursor and returns its new value.
    ///
    /// Negative targets clamp to 0. Handles without `WRITE` also clamp to
    /// the file size; writable ones may move past it, and the next write
    /// leaves a hole.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> u64 {
        let size = self.inode.size as i64;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position as i64,
            Whence::End => size,
        };
        let mut target = base.saturating_add(offset).max(0);
        if !self.flags.contains(OpenFlags::WRITE) {
            target = target.min(size);
        }
        self.position = target as u64;
        self.position
    }
}

impl Ext2FileSystem {
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let modifying = OpenFlags::TRUNCATE | OpenFlags::APPEND;
        if flags.intersects(modifying) && !flags.contains(OpenFlags::WRITE) {
            return Err(FileSystemError::InvalidHandleMode);
        }

        let (ino, mut inode) = match self.traverse(path) {
            Ok(found) => found,
            Err(FileSystemError::NotFound) if flags.contains(OpenFlags::CREATE) => {
                let ino = self.create(path, DEFAULT_FILE_MODE)?;
                (ino, self.read_inode(ino)?)
            }
            Err(e) => return Err(e),
        };
        if inode.is_dir() && flags.contains(OpenFlags::WRITE) {
            return Err(FileSystemError::IsADirectory);
        }

        if flags.contains(OpenFlags::TRUNCATE) && (inode.size != 0 || inode.blocks != 0) {
            self.release_blocks(&mut inode)?;
            inode.size = 0;
            let now = self.now();
            inode.mtime = now;
            inode.ctime = now;
            self.write_inode(ino, &inode)?;
        }

        debug!("ext2: open {} -> inode {} ({:?})", path, ino, flags);
        Ok(FileHandle {
            ino,
            inode,
            position: 0,
            flags,
            dirty: false,
        })
    }

    /// Reads from the cursor into `buf`, clipped to end-of-file.
    ///
    /// Stops at the first hole and returns the bytes copied so far. On error
    /// the cursor stays after the last block copied.
    pub fn read(&self, handle: &mut FileHandle, buf: &mut [u8]) -> Result<usize> {
        if !handle.flags.contains(OpenFlags::READ) {
            return Err(FileSystemError::InvalidHandleMode);
        }
        let size = handle.size();
        if handle.position >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - handle.position) as usize);
        let bs = self.block_size() as u64;
        let mut scratch = self.new_block_buf()?;

        let mut done = 0;
        while done < want {
            let index = (handle.position / bs) as u32;
            let offset = (handle.position % bs) as usize;
            let n = (self.block_size() - offset).min(want - done);

            let block = self.resolve(&handle.inode, index)?;
            if block == 0 {
                break;
            }
            self.read_block(block, &mut scratch)?;
            buf[done..done + n].copy_from_slice(&scratch[offset..offset + n]);
            done += n;
            handle.position += n as u64;
        }
        Ok(done)
    }

    /// Writes `data` at the cursor, allocating blocks as needed, and grows
    /// the file when writing past its end.
    ///
    /// On error the bytes already written stay, and the handle's size
    /// covers them.
    pub fn write(&mut self, handle: &mut FileHandle, data: &[u8]) -> Result<usize> {
        if !handle.flags.contains(OpenFlags::WRITE) {
            return Err(FileSystemError::InvalidHandleMode);
        }
        if handle.flags.contains(OpenFlags::APPEND) {
            handle.position = handle.size();
        }
        if data.is_empty() {
            return Ok(0);
        }

        let bs = self.block_size() as u64;
        let end = handle
            .position
            .checked_add(data.len() as u64)
            .ok_or(FileSystemError::FileTooLarge)?;
        if end > u32::MAX as u64 || (end - 1) / bs >= self.max_file_blocks() {
            return Err(FileSystemError::FileTooLarge);
        }

        let mut scratch = self.new_block_buf()?;
        handle.dirty = true;
        let mut done = 0;
        while done < data.len() {
            let index = (handle.position / bs) as u32;
            let offset = (handle.position % bs) as usize;
            let n = (self.block_size() - offset).min(data.len() - done);
            let chunk = &data[done..done + n];

            let (block, fresh) = self.map_or_alloc(&mut handle.inode, index)?;
            if n == self.block_size() {
                self.write_block(block, chunk)?;
            } else {
                if fresh {
                    scratch.fill(0);
                } else {
                    self.read_block(block, &mut scratch)?;
                }
                scratch[offset..offset + n].copy_from_slice(chunk);
                self.write_block(block, &scratch)?;
            }

            done += n;
            handle.position += n as u64;
            if handle.position > handle.size() {
                handle.inode.size = handle.position as u32;
            }
        }

        let now = self.now();
        handle.inode.mtime = now;
        handle.inode.ctime = now;
        Ok(done)
    }

    /// Writes a dirty handle's inode back without closing it.
    pub fn flush(&mut self, handle: &mut FileHandle) -> Result<()> {
        if handle.dirty {
            self.write_inode(handle.ino, &handle.inode)?;
            handle.dirty = false;
        }
        Ok(())
    }

    pub fn close(&mut self, mut handle: FileHandle) -> Result<()> {
        self.flush(&mut handle)
    }
}

/// Permission bits given to files made by `open` with `CREATE`.
const DEFAULT_FILE_MODE: u16 = 0o644;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    const RW_CREATE: OpenFlags = OpenFlags::READ.union(OpenFlags::WRITE).union(OpenFlags::CREATE);

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (_disk, mut fs) = testing::mount_fresh();
        let data = pattern(3000);
        let mut handle = fs.open("/f", RW_CREATE).unwrap();
        assert_eq!(fs.write(&mut handle, &data).unwrap(), data.len());
        assert_eq!(handle.size(), 3000);
        assert_eq!(handle.position(), 3000);

        handle.seek(0, Whence::Set);
        let mut back = vec![0u8; data.len() + 100];
        assert_eq!(fs.read(&mut handle, &mut back).unwrap(), data.len());
        assert_eq!(&back[..data.len()], data.as_slice());
        // at end-of-file
        assert_eq!(fs.read(&mut handle, &mut back).unwrap(), 0);
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_inode_reaches_disk_on_close() {
        let (disk, mut fs) = testing::mount_fresh();
        let mut handle = fs.open("/f", RW_CREATE).unwrap();
        let ino = handle.inode_num();
        fs.write(&mut handle, b"hello world").unwrap();
        assert!(handle.is_dirty());
        assert_eq!(fs.read_inode(ino).unwrap().size, 0);

        fs.flush(&mut handle).unwrap();
        assert!(!handle.is_dirty());
        assert_eq!(fs.read_inode(ino).unwrap().size, 11);
        fs.write(&mut handle, b"!").unwrap();
        fs.close(handle).unwrap();

        let mut fs = testing::remount(&disk);
        let mut handle = fs.open("/f", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 32];
        let n = fs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world!");
        assert_eq!(handle.inode().blocks, 2);
    }

    #[test]
    fn test_write_across_indirect_boundaries() {
        let (_disk, mut fs) = testing::mount_fresh();
        let bs = testing::BLOCK_SIZE;
        let data = pattern(14 * bs + 17);
        let mut handle = fs.open("/big", RW_CREATE).unwrap();
        fs.write(&mut handle, &data).unwrap();
        assert_ne!(fs.resolve(handle.inode(), 12).unwrap(), 0);

        // first block past the single-indirect range
        let far = (12 + bs / 4) * bs + 100;
        handle.seek(far as i64, Whence::Set);
        fs.write(&mut handle, b"double").unwrap();
        assert_eq!(handle.size(), far as u64 + 6);
        assert_ne!(handle.inode().block[crate::layout::DIND_BLOCK], 0);

        handle.seek(0, Whence::Set);
        let mut back = vec![0u8; data.len()];
        assert_eq!(fs.read(&mut handle, &mut back).unwrap(), data.len());
        assert_eq!(back, data);

        handle.seek(far as i64, Whence::Set);
        let mut tail = [0u8; 16];
        assert_eq!(fs.read(&mut handle, &mut tail).unwrap(), 6);
        assert_eq!(&tail[..6], b"double");
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_read_stops_at_hole() {
        let (_disk, mut fs) = testing::mount_fresh();
        let bs = testing::BLOCK_SIZE;
        let mut handle = fs.open("/sparse", RW_CREATE).unwrap();
        fs.write(&mut handle, &pattern(bs)).unwrap();
        handle.seek(3 * bs as i64, Whence::Set);
        fs.write(&mut handle, b"tail").unwrap();
        assert_eq!(handle.inode().blocks, 4);

        handle.seek(0, Whence::Set);
        let mut buf = vec![0u8; 4 * bs];
        assert_eq!(fs.read(&mut handle, &mut buf).unwrap(), bs);
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_partial_block_overwrite_keeps_neighbours() {
        let (_disk, mut fs) = testing::mount_fresh();
        let mut handle = fs.open("/f", RW_CREATE).unwrap();
        fs.write(&mut handle, b"aaaaaaaaaa").unwrap();
        handle.seek(3, Whence::Set);
        fs.write(&mut handle, b"BBB").unwrap();
        assert_eq!(handle.size(), 10);

        handle.seek(0, Whence::Set);
        let mut buf = [0u8; 10];
        fs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaBBBaaaa");
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_seek_semantics() {
        let (_disk, mut fs) = testing::mount_fresh();
        let mut handle = fs.open("/f", RW_CREATE).unwrap();
        fs.write(&mut handle, &pattern(100)).unwrap();
        assert_eq!(handle.seek(-10, Whence::End), 90);
        assert_eq!(handle.seek(5, Whence::Cur), 95);
        assert_eq!(handle.seek(-500, Whence::Cur), 0);
        // writable handles may move past the end
        assert_eq!(handle.seek(50, Whence::End), 150);
        fs.close(handle).unwrap();

        let mut handle = fs.open("/f", OpenFlags::READ).unwrap();
        assert_eq!(handle.seek(500, Whence::Set), 100);
        assert_eq!(handle.seek(1, Whence::End), 100);
        assert_eq!(handle.seek(-1, Whence::Set), 0);
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_handle_modes() {
        let (_disk, mut fs) = testing::mount_fresh();
        assert_eq!(fs.open("/nope", OpenFlags::READ).unwrap_err(), FileSystemError::NotFound);
        assert_eq!(fs.open("/", OpenFlags::WRITE).unwrap_err(), FileSystemError::IsADirectory);
        assert_eq!(
            fs.open("/f", OpenFlags::CREATE | OpenFlags::TRUNCATE).unwrap_err(),
            FileSystemError::InvalidHandleMode
        );

        let handle = fs.open("/f", OpenFlags::WRITE | OpenFlags::CREATE).unwrap();
        fs.close(handle).unwrap();
        let mut handle = fs.open("/f", OpenFlags::READ).unwrap();
        assert_eq!(fs.write(&mut handle, b"x"), Err(FileSystemError::InvalidHandleMode));
        fs.close(handle).unwrap();

        let mut handle = fs.open("/f", OpenFlags::WRITE).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&mut handle, &mut buf), Err(FileSystemError::InvalidHandleMode));
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_append_and_truncate() {
        let (_disk, mut fs) = testing::mount_fresh();
        let free = fs.superblock().free_blocks_count;
        let mut handle = fs.open("/log", RW_CREATE).unwrap();
        fs.write(&mut handle, b"abc").unwrap();
        fs.close(handle).unwrap();

        let append = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND;
        let mut handle = fs.open("/log", append).unwrap();
        handle.seek(0, Whence::Set);
        fs.write(&mut handle, b"def").unwrap();
        handle.seek(0, Whence::Set);
        let mut buf = [0u8; 8];
        let n = fs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcdef");
        fs.close(handle).unwrap();
        assert_eq!(fs.superblock().free_blocks_count, free - 1);

        let handle = fs.open("/log", OpenFlags::WRITE | OpenFlags::TRUNCATE).unwrap();
        assert_eq!(handle.size(), 0);
        fs.close(handle).unwrap();
        assert_eq!(fs.stat("/log").unwrap().size, 0);
        assert_eq!(fs.superblock().free_blocks_count, free);
    }

    #[test]
    fn test_write_until_volume_is_full() {
        let (_disk, mut fs) = testing::mount_fresh();
        let bs = testing::BLOCK_SIZE;
        let mut handle = fs.open("/fill", RW_CREATE).unwrap();
        let err = fs.write(&mut handle, &pattern(600 * bs)).unwrap_err();
        assert_eq!(err, FileSystemError::Exhausted);
        // 496 free blocks minus one indirect, one double-indirect and one
        // second-level indirect block
        assert_eq!(handle.size(), 493 * bs as u64);
        fs.close(handle).unwrap();
        assert_eq!(fs.superblock().free_blocks_count, 0);

        fs.verify_counters().unwrap();

        fs.unlink("/fill").unwrap();
        assert_eq!(fs.superblock().free_blocks_count, testing::INITIAL_FREE_BLOCKS);
        fs.verify_counters().unwrap();
    }

    #[test]
    fn test_failed_data_write_keeps_earlier_chunks() {
        let (disk, mut fs) = testing::mount_fresh();
        let bs = testing::BLOCK_SIZE;
        let data = pattern(2 * bs);
        let mut handle = fs.open("/f", RW_CREATE).unwrap();

        // each chunk writes the bitmap, descriptor, superblock and then its
        // data; the second data write fails after its block is mapped
        disk.fail_write_after(7);
        assert_eq!(fs.write(&mut handle, &data), Err(FileSystemError::IoError));
        assert_eq!(handle.size(), bs as u64);
        assert_eq!(handle.position(), bs as u64);
        assert!(handle.is_dirty());
        assert_eq!(handle.inode().blocks, 4);
        fs.close(handle).unwrap();
        fs.verify_counters().unwrap();

        let mut handle = fs.open("/f", OpenFlags::READ).unwrap();
        let mut back = vec![0u8; 2 * bs];
        assert_eq!(fs.read(&mut handle, &mut back).unwrap(), bs);
        assert_eq!(&back[..bs], &data[..bs]);
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_failed_inode_write_back() {
        let (disk, mut fs) = testing::mount_fresh();
        let mut handle = fs.open("/f", RW_CREATE).unwrap();
        let ino = handle.inode_num();
        fs.write(&mut handle, b"payload").unwrap();

        disk.set_fail_writes(true);
        assert_eq!(fs.flush(&mut handle), Err(FileSystemError::IoError));
        assert!(handle.is_dirty());
        disk.set_fail_writes(false);
        assert_eq!(fs.read_inode(ino).unwrap().size, 0);
        fs.flush(&mut handle).unwrap();
        assert_eq!(fs.read_inode(ino).unwrap().size, 7);

        fs.write(&mut handle, b"!").unwrap();
        disk.fail_write_after(0);
        assert_eq!(fs.close(handle), Err(FileSystemError::IoError));
        assert_eq!(fs.read_inode(ino).unwrap().size, 7);
    }

    #[test]
    fn test_failed_read_leaves_cursor_after_last_copy() {
        let (disk, mut fs) = testing::mount_fresh();
        let bs = testing::BLOCK_SIZE;
        let data = pattern(3 * bs);
        let mut handle = fs.open("/f", RW_CREATE).unwrap();
        fs.write(&mut handle, &data).unwrap();

        handle.seek(0, Whence::Set);
        disk.fail_read_after(1);
        let mut back = vec![0u8; 3 * bs];
        assert_eq!(fs.read(&mut handle, &mut back), Err(FileSystemError::IoError));
        assert_eq!(handle.position(), bs as u64);

        assert_eq!(fs.read(&mut handle, &mut back[bs..]).unwrap(), 2 * bs);
        assert_eq!(back, data);
        fs.close(handle).unwrap();
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let (_disk, mut fs) = testing::mount_fresh();
        let mut handle = fs.open("/f", RW_CREATE).unwrap();
        handle.seek(u32::MAX as i64, Whence::Set);
        assert_eq!(fs.write(&mut handle, b"xy"), Err(FileSystemError::FileTooLarge));
        assert!(!handle.is_dirty());
        fs.close(handle).unwrap();
    }
}
