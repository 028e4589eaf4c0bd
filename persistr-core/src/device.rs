use crate::human_size;
use std::fmt;
use std::path::{Path, PathBuf};

/// A whole physical disk and its partitions, as last inventoried.
///
/// This is a read-only snapshot. Anything that edits the partition table or
/// formats a filesystem invalidates it; re-query instead of reusing one
/// across such an operation.
#[derive(Clone, Debug)]
pub struct Disk {
    /// The device path (e.g. `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name (e.g. `sdb`).
    pub name: String,
    /// Total size in bytes.
    pub size_bytes: u64,
    /// Whether the kernel reports the disk as removable.
    pub removable: bool,
    /// Children ordered by partition number.
    pub partitions: Vec<Partition>,
}

/// One partition on a [`Disk`].
#[derive(Clone, Debug)]
pub struct Partition {
    /// The device path (e.g. `/dev/sdb1`).
    pub path: PathBuf,
    /// Partition number, derived from the trailing digits of the path.
    pub number: u32,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Filesystem type as probed, when one was recognized.
    pub fs_type: Option<String>,
    /// Filesystem label, when one is set.
    pub label: Option<String>,
    /// Everywhere the partition is currently mounted.
    pub mount_targets: Vec<PathBuf>,
}

impl Partition {
    pub fn is_mounted(&self) -> bool {
        !self.mount_targets.is_empty()
    }

    /// True when this partition already carries the persistence filesystem
    /// type and label the boot overlay looks for.
    pub fn is_persistence_volume(&self) -> bool {
        self.fs_type.as_deref() == Some(crate::PERSISTENCE_FS)
            && self.label.as_deref() == Some(crate::PERSISTENCE_LABEL)
    }
}

/// An unallocated extent in the partition table, in MiB from disk start.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FreeRegion {
    pub start_mib: f64,
    pub end_mib: f64,
}

impl FreeRegion {
    pub fn span_mib(&self) -> f64 {
        self.end_mib - self.start_mib
    }

    /// A region below [`crate::MIN_REGION_MIB`] is not worth turning into a
    /// partition.
    pub fn is_usable(&self) -> bool {
        self.span_mib() >= crate::MIN_REGION_MIB
    }
}

/// Derives the device path of partition `number` on `disk`.
///
/// Simple disk names take a bare numeric suffix (`/dev/sdb` → `/dev/sdb3`).
/// Names whose final component itself ends in a digit (`nvme0n1`,
/// `mmcblk0`) need a `p` separator so the number stays unambiguous
/// (`/dev/nvme0n1` → `/dev/nvme0n1p3`).
pub fn partition_path(disk: &Path, number: u32) -> PathBuf {
    let name = disk.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let suffix = if name.ends_with(|c: char| c.is_ascii_digit()) {
        format!("p{number}")
    } else {
        number.to_string()
    };
    let mut path = disk.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

/// Extracts the partition number from a partition device path.
pub fn partition_number(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

impl fmt::Display for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {:>9} {} ({} partitions)",
            self.path.display(),
            human_size(self.size_bytes),
            if self.removable { "[removable]" } else { "[fixed]" },
            self.partitions.len()
        )
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if self.is_mounted() {
            let targets: Vec<String> = self
                .mount_targets
                .iter()
                .map(|t| t.display().to_string())
                .collect();
            format!("[mounted at {}]", targets.join(", "))
        } else {
            "[not mounted]".to_string()
        };

        write!(
            f,
            "{:<15} {:>9} {:<8} {:<12} {}",
            self.path.display(),
            human_size(self.size_bytes),
            self.fs_type.as_deref().unwrap_or("-"),
            self.label.as_deref().unwrap_or("-"),
            mount_info
        )
    }
}
