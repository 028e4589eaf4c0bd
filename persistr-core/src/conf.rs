//! Writes the activation file onto the persistence volume.

use crate::system::MountManager;
use crate::{ACTIVATION_FILE, ACTIVATION_LINE, Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Unmounts a mount this run created when dropped, so release happens even
/// if the write bails early. `finish` unmounts explicitly so errors
/// surface on the success path.
struct MountGuard<'a> {
    mounts: &'a dyn MountManager,
    target: Option<PathBuf>,
}

impl<'a> MountGuard<'a> {
    fn new(mounts: &'a dyn MountManager, target: PathBuf) -> Self {
        Self {
            mounts,
            target: Some(target),
        }
    }

    fn finish(mut self) -> Result<()> {
        match self.target.take() {
            Some(target) => self.mounts.unmount(&target),
            None => Ok(()),
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let _ = self.mounts.unmount(&target);
        }
    }
}

/// Where the activation file ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenConf {
    /// Directory the volume was mounted at while writing.
    pub target: PathBuf,
    /// True when the device was already mounted and that mount was reused.
    pub reused_mount: bool,
}

/// Mounts `device` (unless it is already mounted), writes the activation
/// line to its root, and releases only mounts this call created.
///
/// A device mounted elsewhere beforehand is written to in place and left
/// mounted; unmounting someone else's mount is not this function's call.
pub fn write_activation(
    device: &Path,
    mount_dir: &Path,
    mounts: &dyn MountManager,
) -> Result<WrittenConf> {
    let existing = mounts.mount_targets(device)?;
    if let Some(target) = existing.first() {
        write_conf_file(target)?;
        return Ok(WrittenConf {
            target: target.clone(),
            reused_mount: true,
        });
    }

    fs::create_dir_all(mount_dir)
        .map_err(|e| Error::Mount(format!("create {}: {e}", mount_dir.display())))?;
    mounts.mount(device, mount_dir)?;

    let guard = MountGuard::new(mounts, mount_dir.to_path_buf());
    write_conf_file(mount_dir)?;
    guard.finish()?;

    Ok(WrittenConf {
        target: mount_dir.to_path_buf(),
        reused_mount: false,
    })
}

/// Byte-for-byte activation content, flushed to disk before the mount can
/// go away.
fn write_conf_file(dir: &Path) -> Result<()> {
    let path = dir.join(ACTIVATION_FILE);
    let conf_error =
        |e: std::io::Error| Error::Mount(format!("write {}: {e}", path.display()));
    let mut file = fs::File::create(&path).map_err(conf_error)?;
    file.write_all(ACTIVATION_LINE.as_bytes())
        .map_err(conf_error)?;
    file.sync_all().map_err(conf_error)?;
    Ok(())
}
