//! ext2 filesystem driver for the kernel.
//!
//! The driver keeps no cache: every operation goes straight to the
//! [`BlockDevice`] it was mounted on, so the disk is always authoritative.
//! A mounted volume is an [`Ext2FileSystem`] value; the kernel owns one
//! through [`volume()`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod allocator;
mod bitmap;
pub mod block;
mod block_map;
pub mod config;
mod dir;
pub mod error;
mod file;
pub mod fs;
mod inode_table;
pub mod layout;
pub mod logger;
mod ops;
mod path;
mod volume;

#[cfg(test)]
mod testing;

pub use block::{BlockDevice, BlockDeviceStats, BlockError, RamDisk, SECTOR_SIZE};
pub use config::MountConfig;
pub use error::{FileSystemError, MountError, Result};
pub use file::{FileHandle, OpenFlags, Whence};
pub use fs::{Ext2FileSystem, FsInfo};
pub use layout::{DirEntry, DiskInode, FilePerm, InodeType};
pub use ops::FileStat;
pub use volume::{Ext2Volume, init_volume, volume};
