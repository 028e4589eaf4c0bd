//! The collaborator traits the provisioning flow runs against.
//!
//! Everything that touches real block devices goes through one of these
//! traits, so the selection heuristics, safety checks, and the state machine
//! in [`crate::orchestrate`] can be exercised against fakes. The real
//! implementations live in [`crate::platform`].

use crate::Result;
use crate::device::{Disk, FreeRegion};
use std::path::{Path, PathBuf};

/// Queries the current disk/partition tree. No side effects.
pub trait InventoryProvider {
    /// An empty tree is a valid result. Failure to run the query at all is
    /// [`crate::Error::InventoryUnavailable`].
    fn inventory(&self) -> Result<Vec<Disk>>;
}

/// Reads and edits a disk's partition table.
pub trait TableEditor {
    /// Unallocated extents on `disk`, in MiB, in table order.
    fn free_regions(&self, disk: &Path) -> Result<Vec<FreeRegion>>;

    /// Creates a new primary partition spanning `[start_mib, end_mib]`.
    fn create_partition(&self, disk: &Path, start_mib: f64, end_mib: f64) -> Result<()>;
}

/// Formats a partition as the persistence filesystem with the fixed label.
pub trait Formatter {
    fn format_persistence(&self, partition: &Path) -> Result<()>;
}

/// Mounts and unmounts block devices.
pub trait MountManager {
    fn mount(&self, device: &Path, target: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Force variant used by the pre-destruction sweep. Defaults to a plain
    /// unmount.
    fn unmount_forced(&self, target: &Path) -> Result<()> {
        self.unmount(target)
    }

    /// Current mount targets of `device`; empty when it is not mounted.
    fn mount_targets(&self, device: &Path) -> Result<Vec<PathBuf>>;
}

/// Resolves the device backing the running root filesystem.
pub trait RootFsResolver {
    fn root_device(&self) -> Result<PathBuf>;
}

/// Waits out device-topology propagation after partition-table or
/// filesystem changes. The kernel does not surface new nodes immediately.
pub trait DeviceSettler {
    /// Pause briefly, then ask the system to finish processing pending
    /// device-change events.
    fn settle(&self);

    /// Whether the device node exists yet.
    fn device_present(&self, path: &Path) -> bool;
}

/// The full set of collaborators a provisioning run needs.
pub struct System<'a> {
    pub inventory: &'a dyn InventoryProvider,
    pub table: &'a dyn TableEditor,
    pub formatter: &'a dyn Formatter,
    pub mounts: &'a dyn MountManager,
    pub rootfs: &'a dyn RootFsResolver,
    pub settler: &'a dyn DeviceSettler,
}
