use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;
use crate::layout::{DiskInode, EXT2_ROOT_INO, MAX_NAME_LEN};

/// Splits an absolute path into its parent and final component.
fn split_path(path: &str) -> Result<(&str, &str)> {
    let rest = path.strip_prefix('/').ok_or(FileSystemError::InvalidPath)?;
    if rest.is_empty() {
        return Err(FileSystemError::InvalidPath);
    }
    let (parent, name) = match rest.rfind('/') {
        Some(pos) => (&path[..pos + 1], &rest[pos + 1..]),
        None => ("/", rest),
    };
    if name.is_empty() {
        return Err(FileSystemError::InvalidPath);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FileSystemError::NameTooLong);
    }
    Ok((parent, name))
}

impl Ext2FileSystem {
    /// Resolves an absolute path to its inode number and record.
    ///
    /// `.` and `..` get no special treatment; they resolve through whatever
    /// entries the directory holds. Empty components are skipped.
    pub fn traverse(&self, path: &str) -> Result<(u32, DiskInode)> {
        let rest = path.strip_prefix('/').ok_or(FileSystemError::InvalidPath)?;
        debug!("ext2: resolving path {}", path);

        let mut ino = EXT2_ROOT_INO;
        let mut inode = self.read_inode(ino)?;
        for component in rest.split('/') {
            if component.is_empty() {
                continue;
            }
            if component.len() > MAX_NAME_LEN {
                return Err(FileSystemError::NameTooLong);
            }
            if !inode.is_dir() {
                return Err(FileSystemError::NotADirectory);
            }
            let entry = self
                .find_dirent(&inode, component)?
                .ok_or(FileSystemError::NotFound)?;
            ino = entry.inode;
            inode = self.read_inode(ino)?;
        }
        Ok((ino, inode))
    }

    /// Resolves everything but the last component, which must name an entry
    /// inside a directory. The last component itself need not exist.
    pub fn traverse_parent<'p>(&self, path: &'p str) -> Result<(u32, DiskInode, &'p str)> {
        let (parent, name) = split_path(path)?;
        let (ino, inode) = self.traverse(parent)?;
        if !inode.is_dir() {
            return Err(FileSystemError::NotADirectory);
        }
        Ok((ino, inode, name))
    }
}
