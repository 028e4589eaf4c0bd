//! Guards that keep destructive operations away from the wrong disk.

use crate::device::Disk;
use crate::system::{MountManager, RootFsResolver};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Refuses to proceed when `disk` backs the running root filesystem.
///
/// The check is a path-prefix match: `/dev/sda` backs a root on
/// `/dev/sda2`, and an NVMe root on `/dev/nvme0n1p2` shares the
/// `/dev/nvme0n1` prefix. Not a perfect test, but it stops the common
/// accident of pointing the tool at the machine's own disk.
pub fn assert_not_system_disk(disk: &Path, rootfs: &dyn RootFsResolver) -> Result<()> {
    let root_dev = rootfs.root_device()?;
    if root_dev
        .to_string_lossy()
        .starts_with(&*disk.to_string_lossy())
    {
        return Err(Error::SafetyAbort {
            disk: disk.to_path_buf(),
            root_dev,
        });
    }
    Ok(())
}

/// Best-effort unmount of every mounted partition on `disk` before
/// destructive work.
///
/// One stray mount failing to release must not block the rest of the
/// sweep, so failures are collected and returned for reporting rather than
/// aborting. Callers must not assume every mount cleared.
pub fn quiesce(disk: &Disk, mounts: &dyn MountManager) -> Vec<(PathBuf, Error)> {
    let mut failures = Vec::new();
    for partition in &disk.partitions {
        for target in &partition.mount_targets {
            if let Err(err) = mounts.unmount_forced(target) {
                failures.push((target.clone(), err));
            }
        }
    }
    failures
}
