//! Mount-handle lifecycle: `init` records where the volume lives, `mount`
//! loads it, `unmount` releases it. The kernel keeps one volume behind a
//! global lock; every filesystem call runs with that lock held.

use alloc::sync::Arc;

use spin::{Mutex, Once};

use crate::block::BlockDevice;
use crate::config::MountConfig;
use crate::error::{FileSystemError, Result};
use crate::fs::Ext2FileSystem;

#[derive(Default)]
pub struct Ext2Volume {
    target: Option<(Arc<dyn BlockDevice>, MountConfig)>,
    fs: Option<Ext2FileSystem>,
}

impl Ext2Volume {
    pub const fn new() -> Self {
        Self { target: None, fs: None }
    }

    /// Records the drive and partition to mount. Refused while mounted.
    pub fn init(&mut self, device: Arc<dyn BlockDevice>, config: MountConfig) -> Result<()> {
        if self.fs.is_some() {
            return Err(FileSystemError::AlreadyMounted);
        }
        info!("ext2: volume set to drive {} at sector {}", config.drive, config.partition_offset);
        self.target = Some((device, config));
        Ok(())
    }

    pub fn mount(&mut self) -> Result<()> {
        if self.fs.is_some() {
            return Err(FileSystemError::AlreadyMounted);
        }
        let (device, config) = self.target.as_ref().ok_or(FileSystemError::NotMounted)?;
        self.fs = Some(Ext2FileSystem::mount(device.clone(), *config)?);
        Ok(())
    }

    /// Drops the mounted filesystem. Unmounting an unmounted volume is a
    /// no-op.
    pub fn unmount(&mut self) -> Result<()> {
        match self.fs.take() {
            Some(fs) => fs.unmount(),
            None => Ok(()),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.fs.is_some()
    }

    pub fn fs(&self) -> Result<&Ext2FileSystem> {
        self.fs.as_ref().ok_or(FileSystemError::NotMounted)
    }

    pub fn fs_mut(&mut self) -> Result<&mut Ext2FileSystem> {
        self.fs.as_mut().ok_or(FileSystemError::NotMounted)
    }
}

static VOLUME: Once<Mutex<Ext2Volume>> = Once::new();

/// The kernel's volume.
pub fn volume() -> &'static Mutex<Ext2Volume> {
    VOLUME.call_once(|| Mutex::new(Ext2Volume::new()))
}

pub fn init_volume(device: Arc<dyn BlockDevice>, config: MountConfig) -> Result<()> {
    volume().lock().init(device, config)
}
