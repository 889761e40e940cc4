use thiserror::Error;

use crate::block::BlockError;

pub type Result<T> = core::result::Result<T, FileSystemError>;

/// Reasons a volume refuses to mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MountError {
    #[error("bad superblock magic")]
    BadMagic,
    #[error("unsupported block size")]
    BadBlockSize,
    #[error("implausible block group count")]
    BadGroupCount,
    #[error("unsupported inode record size")]
    BadInodeSize,
    #[error("cannot allocate the descriptor table")]
    AllocFailed,
    #[error("i/o error while reading filesystem metadata")]
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileSystemError {
    #[error("mount failed: {0}")]
    Mount(MountError),
    #[error("filesystem is not mounted")]
    NotMounted,
    #[error("filesystem is already mounted")]
    AlreadyMounted,
    #[error("no such file or directory")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("invalid path")]
    InvalidPath,
    #[error("name too long")]
    NameTooLong,
    #[error("no free blocks or inodes left")]
    Exhausted,
    #[error("file exceeds the addressable size")]
    FileTooLarge,
    #[error("operation not permitted by the handle's open flags")]
    InvalidHandleMode,
    #[error("out of memory")]
    OutOfMemory,
    #[error("i/o error")]
    IoError,
    #[error("corrupt or inconsistent filesystem")]
    InvalidFileSystem,
    #[error("block size too large for directory records")]
    UnsupportedBlockSize,
}

impl From<MountError> for FileSystemError {
    fn from(error: MountError) -> Self {
        FileSystemError::Mount(error)
    }
}

impl From<BlockError> for FileSystemError {
    fn from(error: BlockError) -> Self {
        match error {
            BlockError::OutOfMemory => FileSystemError::OutOfMemory,
            _ => FileSystemError::IoError,
        }
    }
}
