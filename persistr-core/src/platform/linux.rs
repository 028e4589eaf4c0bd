//! Linux implementations of the collaborator traits, backed by the standard
//! util-linux / parted / e2fsprogs command-line tools.
//!
//! All output parsing lives here as plain functions over captured text, so
//! it can be tested without real block devices.

use crate::device::{Disk, FreeRegion, Partition, partition_number};
use crate::system::{
    DeviceSettler, Formatter, InventoryProvider, MountManager, RootFsResolver, System, TableEditor,
};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Runs a command, capturing output. Nonzero exit becomes
/// [`Error::ExternalTool`] carrying the command line and stderr.
fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::ExternalTool {
            command: program.to_string(),
            stderr: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::ExternalTool {
            command: format!("{program} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Same, but the outcome is deliberately ignored (best-effort steps).
fn run_unchecked(program: &str, args: &[&str]) {
    let _ = Command::new(program).args(args).output();
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| Error::Parse {
        what: "device path",
        message: format!("{} is not valid UTF-8", path.display()),
    })
}

// ---------------------------------------------------------------------------
// Inventory via lsblk

const LSBLK_COLUMNS: &str = "NAME,PATH,TYPE,SIZE,RM,FSTYPE,LABEL,MOUNTPOINTS";

/// Inventory provider backed by `lsblk -bJ`.
pub struct LsblkInventory;

impl InventoryProvider for LsblkInventory {
    fn inventory(&self) -> Result<Vec<Disk>> {
        let json = run("lsblk", &["-bJ", "-o", LSBLK_COLUMNS])
            .map_err(|e| Error::InventoryUnavailable(e.to_string()))?;
        parse_lsblk(&json)
    }
}

#[derive(Deserialize)]
struct LsblkReport {
    #[serde(default)]
    blockdevices: Vec<LsblkNode>,
}

#[derive(Deserialize)]
struct LsblkNode {
    name: String,
    path: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    size: Option<Scalar>,
    rm: Option<Scalar>,
    fstype: Option<String>,
    label: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// Older lsblk releases print numeric and boolean columns as JSON strings;
/// accept every shape that shows up in the wild.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Num(u64),
    Flag(bool),
    Text(String),
}

impl Scalar {
    fn as_u64(&self) -> u64 {
        match self {
            Scalar::Num(n) => *n,
            Scalar::Flag(b) => u64::from(*b),
            Scalar::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }

    fn as_bool(&self) -> bool {
        self.as_u64() == 1
    }
}

impl LsblkNode {
    fn device_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("/dev").join(&self.name),
        }
    }
}

fn parse_lsblk(json: &str) -> Result<Vec<Disk>> {
    let report: LsblkReport = serde_json::from_str(json).map_err(|e| Error::Parse {
        what: "lsblk",
        message: e.to_string(),
    })?;

    let mut disks = Vec::new();
    for node in &report.blockdevices {
        if node.kind != "disk" {
            continue;
        }
        let mut partitions: Vec<Partition> = node
            .children
            .iter()
            .filter(|child| child.kind == "part")
            .map(|child| {
                let path = child.device_path();
                Partition {
                    number: partition_number(&path).unwrap_or(0),
                    path,
                    size_bytes: child.size.as_ref().map(Scalar::as_u64).unwrap_or(0),
                    fs_type: child.fstype.clone().filter(|s| !s.is_empty()),
                    label: child.label.clone().filter(|s| !s.is_empty()),
                    mount_targets: child
                        .mountpoints
                        .iter()
                        .flatten()
                        .filter(|target| !target.is_empty())
                        .map(PathBuf::from)
                        .collect(),
                }
            })
            .collect();
        partitions.sort_by_key(|p| p.number);

        disks.push(Disk {
            path: node.device_path(),
            name: node.name.clone(),
            size_bytes: node.size.as_ref().map(Scalar::as_u64).unwrap_or(0),
            removable: node.rm.as_ref().map(Scalar::as_bool).unwrap_or(false),
            partitions,
        });
    }
    Ok(disks)
}

// ---------------------------------------------------------------------------
// Partition table via parted

/// Table editor backed by `parted`. Works on both MBR and GPT labels.
pub struct PartedEditor;

impl TableEditor for PartedEditor {
    fn free_regions(&self, disk: &Path) -> Result<Vec<FreeRegion>> {
        let report = run(
            "parted",
            &["-sm", path_str(disk)?, "unit", "MiB", "print", "free"],
        )?;
        Ok(parse_free_report(&report))
    }

    fn create_partition(&self, disk: &Path, start_mib: f64, end_mib: f64) -> Result<()> {
        let start = format!("{start_mib:.2}MiB");
        let end = format!("{end_mib:.2}MiB");
        run(
            "parted",
            &[
                "-s",
                path_str(disk)?,
                "mkpart",
                "primary",
                crate::PERSISTENCE_FS,
                &start,
                &end,
            ],
        )?;
        Ok(())
    }
}

/// Pulls the free extents out of `parted -sm <disk> unit MiB print free`.
///
/// Machine-readable lines look like
/// `1:0.00MiB:4700MiB:4700MiB:primary:iso9660:;` with free extents carrying
/// `free` in the type field and no partition number.
fn parse_free_report(report: &str) -> Vec<FreeRegion> {
    let mut regions = Vec::new();
    for line in report.lines() {
        let line = line.trim().trim_end_matches(';');
        if !(line.ends_with(":free") || line.contains(":free:")) {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 5 {
            continue;
        }
        let (Some(start_mib), Some(end_mib)) = (parse_mib(fields[1]), parse_mib(fields[2])) else {
            continue;
        };
        if end_mib > start_mib {
            regions.push(FreeRegion { start_mib, end_mib });
        }
    }
    regions
}

fn parse_mib(field: &str) -> Option<f64> {
    field.strip_suffix("MiB")?.parse().ok()
}

// ---------------------------------------------------------------------------
// Formatting, mounting, root lookup, settling

/// Formatter backed by `mkfs.ext4`.
pub struct Ext4Formatter;

impl Formatter for Ext4Formatter {
    fn format_persistence(&self, partition: &Path) -> Result<()> {
        run(
            "mkfs.ext4",
            &["-F", "-L", crate::PERSISTENCE_LABEL, path_str(partition)?],
        )
        .map_err(|e| Error::Format {
            path: partition.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// Mount manager shelling out to `mount`/`umount`/`findmnt`.
pub struct MountCommands;

impl MountManager for MountCommands {
    fn mount(&self, device: &Path, target: &Path) -> Result<()> {
        run("mount", &[path_str(device)?, path_str(target)?]).map_err(as_mount_error)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        run("umount", &[path_str(target)?]).map_err(as_mount_error)?;
        Ok(())
    }

    fn unmount_forced(&self, target: &Path) -> Result<()> {
        run("umount", &["-f", path_str(target)?]).map_err(as_mount_error)?;
        Ok(())
    }

    fn mount_targets(&self, device: &Path) -> Result<Vec<PathBuf>> {
        // findmnt exits nonzero when the device is simply not mounted, so a
        // failure here means "no targets", not an error.
        let output = Command::new("findmnt")
            .args(["-rn", "-S", path_str(device)?, "-o", "TARGET"])
            .output();
        let Ok(output) = output else {
            return Ok(Vec::new());
        };
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

fn as_mount_error(e: Error) -> Error {
    Error::Mount(e.to_string())
}

/// Resolves the device backing `/` via sysinfo's disk list.
pub struct SysinfoRootFs;

impl RootFsResolver for SysinfoRootFs {
    fn root_device(&self) -> Result<PathBuf> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        for disk in disks.iter() {
            if disk.mount_point() == Path::new("/") {
                let name = PathBuf::from(disk.name());
                return Ok(if name.is_absolute() {
                    name
                } else {
                    PathBuf::from("/dev").join(name)
                });
            }
        }
        Err(Error::InventoryUnavailable(
            "could not determine the device backing /".to_string(),
        ))
    }
}

/// Settler that sleeps briefly, then asks udev to drain its event queue.
pub struct UdevSettler {
    /// How long to pause before asking udev. Topology propagation time
    /// varies by medium; this is a tunable default, not a guaranteed bound.
    pub pause: Duration,
}

impl Default for UdevSettler {
    fn default() -> Self {
        Self {
            pause: Duration::from_millis(1200),
        }
    }
}

impl DeviceSettler for UdevSettler {
    fn settle(&self) {
        thread::sleep(self.pause);
        run_unchecked("udevadm", &["settle"]);
    }

    fn device_present(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Owns one of each real collaborator and hands out a [`System`] view.
pub struct LiveSystem {
    inventory: LsblkInventory,
    table: PartedEditor,
    formatter: Ext4Formatter,
    mounts: MountCommands,
    rootfs: SysinfoRootFs,
    settler: UdevSettler,
}

impl LiveSystem {
    pub fn new() -> Self {
        Self {
            inventory: LsblkInventory,
            table: PartedEditor,
            formatter: Ext4Formatter,
            mounts: MountCommands,
            rootfs: SysinfoRootFs,
            settler: UdevSettler::default(),
        }
    }

    pub fn system(&self) -> System<'_> {
        System {
            inventory: &self.inventory,
            table: &self.table,
            formatter: &self.formatter,
            mounts: &self.mounts,
            rootfs: &self.rootfs,
            settler: &self.settler,
        }
    }
}

impl Default for LiveSystem {
    fn default() -> Self {
        Self::new()
    }
}
